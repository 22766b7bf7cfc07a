//! Authenticated principals.

/// The identity attached to a store request by the authentication layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Principal {
    /// Principal name, e.g. `system:node:node-a`.
    pub name: String,
    /// Group memberships.
    pub groups: Vec<String>,
}

impl Principal {
    /// A principal with the given name and no groups.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
        }
    }

    /// The node identity `system:node:<node>`.
    pub fn node(node: &str) -> Self {
        Self {
            name: format!("system:node:{}", node),
            groups: vec!["system:nodes".to_string()],
        }
    }
}
