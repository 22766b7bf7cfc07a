//! Pod reference value type.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The slice of a running pod that admission needs to verify a certificate
/// request: identity, service account, and placement.
///
/// Certificate requests refer to pods by `(name, UID)` value rather than an
/// ownership link; admission re-verifies liveness against this snapshot on
/// every mutation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Pod UID, regenerated on every pod replacement.
    pub uid: String,
    /// Service account the pod runs as.
    pub service_account: String,
    /// Node the pod is scheduled onto.
    pub node: String,
}

impl Pod {
    /// Build a pod snapshot.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
        service_account: impl Into<String>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
            service_account: service_account.into(),
            node: node.into(),
        }
    }
}
