//! TrustBundle: a cluster-scoped container for X.509 trust anchors.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// A cluster-scoped set of X.509 trust anchors (root certificates).
///
/// A bundle may be linked to a signer, in which case it holds one valid set
/// of trust anchors for that signer and only principals holding the `attest`
/// verb on the signer may create or modify it. Signers may have multiple
/// bundles; each is an independent anchor set.
///
/// A stored bundle always satisfies the canonicalization rules enforced by
/// [`crate::normalize::normalize`]: only `CERTIFICATE` blocks, no
/// duplicates, no headers, deterministic order.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrustBundle {
    /// Object metadata. Cluster-scoped: the namespace is always empty.
    pub metadata: ObjectMeta,

    /// Signer linkage and anchor payload.
    pub spec: TrustBundleSpec,
}

/// Desired state of a [`TrustBundle`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrustBundleSpec {
    /// The associated signer, if any. Immutable after creation.
    ///
    /// When set, the object name must begin with the signer name translated
    /// `/` to `:` (e.g. signer `example.com/foo` requires names matching
    /// `example.com:foo:*`). When empty, the name must not carry such a
    /// prefix.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signer_name: String,

    /// The trust anchors, as canonicalized PEM.
    pub trust_bundle: String,
}

impl TrustBundle {
    /// Build a bundle with the given name and spec.
    pub fn new(name: impl Into<String>, spec: TrustBundleSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec,
        }
    }
}
