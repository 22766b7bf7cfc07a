//! CertRequest: a namespaced request for a workload certificate.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

/// A request for a short-lived workload certificate, made on behalf of a
/// running pod.
///
/// The requester owns the main resource; principals holding the `sign` verb
/// on the signer own the status subresource. The request is *issued* when
/// `status.certificate` is set and `status.observed_generation` matches the
/// current spec generation; a spec mutation (public-key rotation) starts a
/// new signing cycle.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertRequest {
    /// Object metadata. Namespaced.
    pub metadata: ObjectMeta,

    /// The desired signer and the workload/node identity being asserted.
    pub spec: CertRequestSpec,

    /// Conditions and the issued certificate.
    #[serde(default)]
    pub status: CertRequestStatus,
}

/// Desired state of a [`CertRequest`]. All fields except `public_key` are
/// immutable after creation; `public_key` may only change through the
/// re-key flow.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertRequestSpec {
    /// The signer that should handle this request.
    pub signer_name: String,

    /// Name of the pod being asserted.
    pub pod: String,

    /// UID of the pod being asserted.
    #[serde(rename = "podUID")]
    pub pod_uid: String,

    /// Service account of the pod. Set by admission from the live pod.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account: String,

    /// Node the pod runs on. Set by admission from the live pod.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,

    /// Identity of the requester. Set by admission from the authenticated
    /// principal.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requester: String,

    /// PEM-wrapped public key to certify. Exactly one key block is required
    /// at signing time.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,
}

/// Observed state of a [`CertRequest`], owned by the signer.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertRequestStatus {
    /// Conditions applied to the request, keyed by type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CertRequestCondition>,

    /// The issued certificate as a single PEM block; empty until issuance.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificate: String,

    /// Spec generation at which `certificate` was issued.
    #[serde(default)]
    pub observed_generation: i64,

    /// Start of the certificate validity interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// End of the certificate validity interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,

    /// Time after which the owner should re-key to obtain a fresh
    /// certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_refresh_at: Option<DateTime<Utc>>,
}

/// Well-known condition types for certificate requests.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    /// The signer permanently failed to issue for the current generation.
    Failed,
    /// The signer is temporarily unable to issue.
    Pending,
}

/// Status of a condition.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// The condition state is unknown.
    #[default]
    Unknown,
}

/// One condition on a [`CertRequest`].
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertRequestCondition {
    /// Condition type.
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    /// Whether the condition holds.
    pub status: ConditionStatus,

    /// Brief machine-readable reason for the request state.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable details about the request state.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Generation of the object at which this condition was recorded.
    #[serde(default)]
    pub observed_generation: i64,

    /// Time of the last update to this condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Time the condition last transitioned between statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Tri-state issuance decision over a request's status, evaluated against
/// the current spec generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Issuance {
    /// The certificate is issued for the current generation.
    Issued,
    /// Issuance is still in progress (explicitly or implicitly).
    Pending,
    /// Issuance failed terminally for the current generation.
    Failed(String),
}

impl CertRequest {
    /// Build a request with the given key and spec.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: CertRequestSpec,
    ) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec,
            status: CertRequestStatus::default(),
        }
    }

    /// Whether the certificate was issued at the current spec generation.
    pub fn is_issued(&self) -> bool {
        !self.status.certificate.is_empty()
            && self.status.observed_generation == self.metadata.generation
    }

    /// The condition of the given type, if present.
    pub fn condition(&self, condition_type: ConditionType) -> Option<&CertRequestCondition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Decide issuance for the current generation.
    ///
    /// Issued wins; a `Failed=True` condition observed at the current
    /// generation is terminal; a `Pending=True` condition (or the absence of
    /// any signal) means the request is still pending.
    pub fn issuance(&self) -> Issuance {
        if self.is_issued() {
            return Issuance::Issued;
        }

        let current = |c: &&CertRequestCondition| {
            c.status == ConditionStatus::True && c.observed_generation == self.metadata.generation
        };

        if let Some(cond) = self.condition(ConditionType::Failed).filter(current) {
            return Issuance::Failed(format!(
                "the certificate request failed issuance (reason={}): {}",
                cond.reason, cond.message
            ));
        }

        Issuance::Pending
    }
}
