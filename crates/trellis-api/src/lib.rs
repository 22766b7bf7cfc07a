//! Object model for Trellis: trust bundles, certificate requests, and the
//! validation rules that keep them canonical.
//!
//! This crate is deliberately free of I/O. It defines the two persisted
//! kinds ([`TrustBundle`] and [`CertRequest`]), the pod reference value type
//! consumed by admission, PEM trust-anchor canonicalization, and the pure
//! validation functions the object store runs on every write.

#![deny(missing_docs)]

pub mod certrequest;
pub mod error;
pub mod meta;
pub mod normalize;
pub mod pod;
pub mod signer_name;
pub mod trustbundle;
pub mod validation;

pub use certrequest::{
    CertRequest, CertRequestCondition, CertRequestSpec, CertRequestStatus, ConditionStatus,
    ConditionType, Issuance,
};
pub use error::{FieldError, ValidationErrors};
pub use meta::{ObjectKey, ObjectMeta};
pub use normalize::normalize;
pub use pod::Pod;
pub use trustbundle::{TrustBundle, TrustBundleSpec};

/// Signer handled by the built-in signing controller for workload-to-workload
/// authentication certificates.
pub const DEFAULT_WORKLOAD_CERTIFICATE_SIGNER: &str =
    "kubernetes.io/default-workload-certificate";

/// Signer handled by the built-in signing controller for client certificates
/// presented to the cluster API server.
pub const KUBE_APISERVER_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";
