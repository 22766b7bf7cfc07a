//! Stored-object abstraction: the trait persisted kinds implement, watch
//! events, and list selectors.

use std::collections::BTreeMap;

use trellis_api::{CertRequest, ObjectKey, ObjectMeta, TrustBundle};

/// A kind the object store can persist.
///
/// The store owns `uid`, `resource_version`, and `generation`; implementors
/// expose enough structure for the store to manage those fields and to
/// answer field-selector queries.
pub trait StoredObject: Clone + Send + Sync + 'static {
    /// Kind name used in errors and logs.
    const KIND: &'static str;

    /// Whether objects of this kind live in a namespace.
    const NAMESPACED: bool;

    /// Whether this kind has a status subresource.
    const HAS_STATUS: bool;

    /// Object metadata.
    fn metadata(&self) -> &ObjectMeta;

    /// Mutable object metadata.
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// The `(namespace, name)` key.
    fn key(&self) -> ObjectKey {
        self.metadata().key()
    }

    /// Whether the spec portion equals `other`'s (drives generation bumps).
    fn spec_equals(&self, other: &Self) -> bool;

    /// Replace this object's status with `other`'s. No-op for kinds without
    /// status.
    fn copy_status_from(&mut self, other: &Self);

    /// Reset status to its default. No-op for kinds without status.
    fn clear_status(&mut self);

    /// The value of a supported field-selector label, or `None` when the
    /// label is not selectable for this kind.
    fn field(&self, name: &str) -> Option<String>;
}

impl StoredObject for TrustBundle {
    const KIND: &'static str = "TrustBundle";
    const NAMESPACED: bool = false;
    const HAS_STATUS: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_equals(&self, other: &Self) -> bool {
        self.spec == other.spec
    }

    fn copy_status_from(&mut self, _other: &Self) {}

    fn clear_status(&mut self) {}

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "metadata.name" => Some(self.metadata.name.clone()),
            "spec.signerName" => Some(self.spec.signer_name.clone()),
            _ => None,
        }
    }
}

impl StoredObject for CertRequest {
    const KIND: &'static str = "CertRequest";
    const NAMESPACED: bool = true;
    const HAS_STATUS: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn spec_equals(&self, other: &Self) -> bool {
        self.spec == other.spec
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }

    fn clear_status(&mut self) {
        self.status = Default::default();
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "metadata.name" => Some(self.metadata.name.clone()),
            "spec.signerName" => Some(self.spec.signer_name.clone()),
            "spec.node" => Some(self.spec.node.clone()),
            _ => None,
        }
    }
}

/// One change observed through a watch subscription.
#[derive(Clone, Debug)]
pub enum WatchEvent<T> {
    /// The object was created (or seen for the first time).
    Added(T),
    /// The object was updated.
    Modified(T),
    /// The object was deleted; carries the last observed state.
    Deleted(T),
}

impl<T> WatchEvent<T> {
    /// The object the event refers to.
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

/// Label selector: equality requirements over object labels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    /// Labels that must all be present with the given values.
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// A selector matching everything.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Require `key == value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Whether the given label set satisfies every requirement.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Combined label and field selector for list queries.
#[derive(Clone, Debug, Default)]
pub struct Selector {
    /// Label requirements.
    pub labels: LabelSelector,
    /// Field requirements as `(label, value)` pairs. Only the persisted
    /// field labels of each kind are accepted.
    pub fields: Vec<(String, String)>,
}

impl Selector {
    /// A selector matching everything.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Require the field `label == value`.
    pub fn with_field(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((label.into(), value.into()));
        self
    }

    /// Require the label `key == value`.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.match_labels.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_api::{CertRequestSpec, TrustBundleSpec};

    #[test]
    fn bundle_field_labels() {
        let bundle = TrustBundle::new(
            "example.com:foo:v1",
            TrustBundleSpec {
                signer_name: "example.com/foo".to_string(),
                trust_bundle: String::new(),
            },
        );
        assert_eq!(
            bundle.field("spec.signerName").as_deref(),
            Some("example.com/foo")
        );
        assert_eq!(
            bundle.field("metadata.name").as_deref(),
            Some("example.com:foo:v1")
        );
        assert_eq!(bundle.field("spec.node"), None);
    }

    #[test]
    fn request_field_labels() {
        let req = CertRequest::new(
            "ns",
            "r1",
            CertRequestSpec {
                node: "node-a".to_string(),
                ..CertRequestSpec::default()
            },
        );
        assert_eq!(req.field("spec.node").as_deref(), Some("node-a"));
        assert_eq!(req.field("spec.unknown"), None);
    }

    #[test]
    fn label_selector_matching() {
        let selector = LabelSelector::everything().with("tier", "platform");
        let mut labels = BTreeMap::new();
        assert!(!selector.matches(&labels));
        labels.insert("tier".to_string(), "platform".to_string());
        assert!(selector.matches(&labels));
        assert!(LabelSelector::everything().matches(&BTreeMap::new()));
    }
}
