//! Node-side consumers of the Trellis workload-identity objects: the
//! per-node workload-certificate manager and the trust-anchor manager.

pub mod anchors;
pub mod workload;

pub use anchors::{NoopTrustAnchorManager, TrustAnchorError, TrustAnchorManager, TrustAnchors};
pub use workload::{
    key_file_hash, NoopWorkloadCertificateManager, WorkloadCertificateError,
    WorkloadCertificateManager, WorkloadCertificates, PRIVATE_KEY_FILE_HASH_ANNOTATION,
};
