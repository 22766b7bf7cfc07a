//! Object metadata shared by every persisted kind.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Metadata carried by every stored object.
///
/// `uid`, `resource_version`, and `generation` are owned by the object store:
/// the store assigns `uid` on create, bumps `resource_version` on every
/// persisted write, and bumps `generation` on every spec mutation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within its scope.
    pub name: String,

    /// Namespace for namespaced kinds; empty for cluster-scoped kinds.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Store-assigned unique identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Monotone version counter bumped on every persisted write.
    #[serde(default)]
    pub resource_version: u64,

    /// Monotone counter bumped by the store on every spec mutation.
    #[serde(default)]
    pub generation: i64,

    /// Object labels, matched by label selectors.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Object annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// When the store first persisted the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for a cluster-scoped object.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Metadata for a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// The `(namespace, name)` key identifying this object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// `(namespace, name)` identifier for a stored object.
///
/// The namespace is empty for cluster-scoped kinds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace; empty for cluster-scoped kinds.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Key for a cluster-scoped object.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
        }
    }

    /// Key for a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display() {
        assert_eq!(ObjectKey::named("bundle").to_string(), "bundle");
        assert_eq!(ObjectKey::namespaced("ns", "req").to_string(), "ns/req");
    }

    #[test]
    fn meta_key_roundtrip() {
        let meta = ObjectMeta::namespaced("n1", "kubelet-p1-v1-0");
        assert_eq!(meta.key(), ObjectKey::namespaced("n1", "kubelet-p1-v1-0"));
    }
}
