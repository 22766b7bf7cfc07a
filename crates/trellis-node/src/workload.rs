//! Per-node workload-certificate manager.
//!
//! Serves the node's local runtime: creates certificate requests on behalf
//! of running pods, re-keys them when the refresh window opens or the
//! on-disk key changed, and waits for issuance. Request names are
//! deterministic (`kubelet-<pod>-<volume>-<sourceIndex>`) so lookups are
//! idempotent across restarts and mount points.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rcgen::KeyPair;
use sha2::{Digest, Sha512_256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use trellis_api::{CertRequest, CertRequestSpec, Issuance, ObjectKey};
use trellis_store::{Cache, Clock, ObjectStore, Principal, StoreError};

/// Annotation recording `base64(SHA-512/256(privateKeyPEM))` of the key
/// most recently handed to the workload.
pub const PRIVATE_KEY_FILE_HASH_ANNOTATION: &str =
    "certrequests.kubelet.kubernetes.io/private-key-file-hash";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Errors from the workload-certificate manager.
#[derive(Debug, Error)]
pub enum WorkloadCertificateError {
    /// A store read or write failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Local key-pair generation failed.
    #[error("while generating key pair: {0}")]
    KeyGeneration(String),

    /// The signer recorded a terminal failure for the current generation.
    #[error("{0}")]
    IssuanceFailed(String),

    /// The caller's context was cancelled while waiting for issuance.
    #[error("cancelled while waiting for certificate issuance")]
    Cancelled,

    /// The feature is disabled in this deployment.
    #[error("workload certificates are not supported in this configuration")]
    Unsupported,
}

/// Node-local interface handing `(privateKeyPEM, certificatePEM)` pairs to
/// the pod runtime.
#[async_trait]
pub trait WorkloadCertificates: Send + Sync {
    /// Obtain a certificate for the given pod and mount point, creating or
    /// re-keying the underlying request as needed.
    ///
    /// Returns the private key PEM (empty when the caller's existing key is
    /// still current) and the issued certificate PEM.
    #[allow(clippy::too_many_arguments)]
    async fn get_workload_certificate(
        &self,
        ctx: &CancellationToken,
        signer_name: &str,
        namespace: &str,
        pod_name: &str,
        pod_uid: &str,
        volume_name: &str,
        source_index: usize,
        key_file_hash: &str,
    ) -> Result<(String, String), WorkloadCertificateError>;
}

/// [`WorkloadCertificates`] backed by the object store and a node-local
/// watch cache.
pub struct WorkloadCertificateManager {
    store: Arc<dyn ObjectStore<CertRequest>>,
    requests: Arc<Cache<CertRequest>>,
    clock: Arc<dyn Clock>,
    principal: Principal,
    poll_interval: Duration,
}

impl WorkloadCertificateManager {
    /// A manager writing as `principal` (the node identity) and reading
    /// from the given request cache. The cache's lifecycle is owned by the
    /// caller.
    pub fn new(
        store: Arc<dyn ObjectStore<CertRequest>>,
        requests: Arc<Cache<CertRequest>>,
        clock: Arc<dyn Clock>,
        principal: Principal,
    ) -> Self {
        Self {
            store,
            requests,
            clock,
            principal,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the issuance poll interval (default 5 s).
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The deterministic request name for one pod mount point.
    pub fn request_name(pod_name: &str, volume_name: &str, source_index: usize) -> String {
        format!("kubelet-{}-{}-{}", pod_name, volume_name, source_index)
    }

    /// Generate a fresh P-256 key pair and bind it to the request: the
    /// public key goes into the spec, the private-key-file hash into the
    /// annotations. Returns the private key PEM.
    fn rekey(request: &mut CertRequest) -> Result<String, WorkloadCertificateError> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| WorkloadCertificateError::KeyGeneration(e.to_string()))?;

        let private_key_pem = key_pair.serialize_pem();
        request.metadata.annotations.insert(
            PRIVATE_KEY_FILE_HASH_ANNOTATION.to_string(),
            key_file_hash(&private_key_pem),
        );
        request.spec.public_key = key_pair.public_key_pem();

        Ok(private_key_pem)
    }

    /// Poll the local cache until the request is issued for at least
    /// `min_generation`, the signer records a terminal failure, or the
    /// caller cancels.
    async fn await_issuance(
        &self,
        ctx: &CancellationToken,
        key: &ObjectKey,
        min_generation: i64,
    ) -> Result<CertRequest, WorkloadCertificateError> {
        loop {
            if let Some(request) = self.requests.get(key) {
                // A cache still showing an older generation says nothing
                // about the write we just made; keep waiting.
                if request.metadata.generation >= min_generation {
                    match request.issuance() {
                        Issuance::Issued => return Ok(request),
                        Issuance::Failed(message) => {
                            return Err(WorkloadCertificateError::IssuanceFailed(message));
                        }
                        Issuance::Pending => {}
                    }
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(WorkloadCertificateError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[async_trait]
impl WorkloadCertificates for WorkloadCertificateManager {
    async fn get_workload_certificate(
        &self,
        ctx: &CancellationToken,
        signer_name: &str,
        namespace: &str,
        pod_name: &str,
        pod_uid: &str,
        volume_name: &str,
        source_index: usize,
        key_file_hash: &str,
    ) -> Result<(String, String), WorkloadCertificateError> {
        let name = Self::request_name(pod_name, volume_name, source_index);
        let key = ObjectKey::namespaced(namespace, &name);

        let Some(existing) = self.requests.get(&key) else {
            debug!(request = %key, "creating workload certificate request");
            let mut request = CertRequest::new(
                namespace,
                &name,
                CertRequestSpec {
                    signer_name: signer_name.to_string(),
                    pod: pod_name.to_string(),
                    pod_uid: pod_uid.to_string(),
                    // serviceAccount, node, and requester are filled in by
                    // admission.
                    ..CertRequestSpec::default()
                },
            );
            let private_key_pem = Self::rekey(&mut request)?;

            let created = self.store.create(&self.principal, request).await?;
            let issued = self
                .await_issuance(ctx, &key, created.metadata.generation)
                .await?;
            return Ok((private_key_pem, issued.status.certificate));
        };

        let due_for_refresh = existing
            .status
            .begin_refresh_at
            .is_some_and(|t| self.clock.now() >= t);
        let hash_mismatch = existing
            .metadata
            .annotations
            .get(PRIVATE_KEY_FILE_HASH_ANNOTATION)
            .map(String::as_str)
            != Some(key_file_hash);

        if due_for_refresh || hash_mismatch {
            info!(
                request = %key,
                due_for_refresh,
                hash_mismatch,
                "re-keying workload certificate request"
            );
            let mut updated = existing.clone();
            let private_key_pem = Self::rekey(&mut updated)?;

            let written = self.store.update(&self.principal, updated).await?;
            let issued = self
                .await_issuance(ctx, &key, written.metadata.generation)
                .await?;
            return Ok((private_key_pem, issued.status.certificate));
        }

        // The existing key is still good; wait out issuance if it has not
        // happened yet and hand back only the certificate.
        let issued = self
            .await_issuance(ctx, &key, existing.metadata.generation)
            .await?;
        Ok((String::new(), issued.status.certificate))
    }
}

/// `base64(SHA-512/256(privateKeyPEM))`, the value kept in the
/// [`PRIVATE_KEY_FILE_HASH_ANNOTATION`].
pub fn key_file_hash(private_key_pem: &str) -> String {
    BASE64.encode(Sha512_256::digest(private_key_pem.as_bytes()))
}

/// Manager variant for deployments with the feature disabled; every call
/// returns a fixed error.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopWorkloadCertificateManager;

#[async_trait]
impl WorkloadCertificates for NoopWorkloadCertificateManager {
    async fn get_workload_certificate(
        &self,
        _ctx: &CancellationToken,
        _signer_name: &str,
        _namespace: &str,
        _pod_name: &str,
        _pod_uid: &str,
        _volume_name: &str,
        _source_index: usize,
        _key_file_hash: &str,
    ) -> Result<(String, String), WorkloadCertificateError> {
        Err(WorkloadCertificateError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_names_are_deterministic() {
        assert_eq!(
            WorkloadCertificateManager::request_name("p1", "certs", 0),
            "kubelet-p1-certs-0"
        );
        assert_eq!(
            WorkloadCertificateManager::request_name("p1", "certs", 3),
            "kubelet-p1-certs-3"
        );
    }

    #[test]
    fn rekey_binds_key_material_to_the_request() {
        let mut request = CertRequest::new("n1", "r1", CertRequestSpec::default());
        let private_key_pem = WorkloadCertificateManager::rekey(&mut request).unwrap();

        assert!(private_key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(request.spec.public_key.contains("BEGIN PUBLIC KEY"));
        assert!(!request.spec.public_key.contains("PRIVATE"));
        assert_eq!(
            request
                .metadata
                .annotations
                .get(PRIVATE_KEY_FILE_HASH_ANNOTATION)
                .unwrap(),
            &key_file_hash(&private_key_pem)
        );

        // A second re-key rotates everything.
        let old_public = request.spec.public_key.clone();
        let next_key = WorkloadCertificateManager::rekey(&mut request).unwrap();
        assert_ne!(next_key, private_key_pem);
        assert_ne!(request.spec.public_key, old_public);
    }

    #[test]
    fn key_file_hash_is_stable() {
        let hash = key_file_hash("some pem bytes");
        assert_eq!(hash, key_file_hash("some pem bytes"));
        assert_ne!(hash, key_file_hash("other pem bytes"));
        // SHA-512/256 digests are 32 bytes, 44 base64 characters.
        assert_eq!(hash.len(), 44);
    }

    #[tokio::test]
    async fn noop_manager_always_errors() {
        let manager = NoopWorkloadCertificateManager;
        let err = manager
            .get_workload_certificate(
                &CancellationToken::new(),
                "kubernetes.io/default-workload-certificate",
                "n1",
                "p1",
                "u1",
                "certs",
                0,
                "",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkloadCertificateError::Unsupported));
    }
}
