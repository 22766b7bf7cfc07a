//! The signing controller.
//!
//! Watches certificate requests, issues certificates for the built-in
//! signers, and writes the result to the status subresource. Work is
//! sharded across workers pulling `(namespace, name)` keys from one
//! rate-limited queue; per-key processing is serialized by the queue, so at
//! most one worker touches a request's status at a time.
//!
//! Per request and generation the state machine is
//! `New -> Pending -> {Issued | Failed}`; a spec generation bump resets it.
//! Transient problems (CA material unavailable, store conflicts) surface as
//! errors and retry with backoff; structural problems (bad public key,
//! crypto failure) are recorded as a terminal `Failed` condition for the
//! current generation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, PublicKeyData, SerialNumber, SignatureAlgorithm,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use x509_parser::prelude::FromDer;
use x509_parser::x509::{AlgorithmIdentifier, SubjectPublicKeyInfo};

use trellis_api::{
    CertRequest, CertRequestCondition, ConditionStatus, ConditionType, ObjectKey,
    DEFAULT_WORKLOAD_CERTIFICATE_SIGNER, KUBE_APISERVER_CLIENT_SIGNER,
};
use trellis_store::{Cache, Clock, ObjectStore, Principal, StoreError, StoredObject, WatchEvent};

use crate::keypair::{CaKeyPair, KeyPairError, KeyPairSource};
use crate::queue::WorkQueue;

/// Issued certificates are backdated by this much to absorb clock skew.
const BACKDATE_MINUTES: i64 = 5;
/// Certificate lifetime.
const LIFETIME_HOURS: i64 = 24;
/// Offset from `notBefore` after which the owner should re-key.
const REFRESH_AT_HOURS: i64 = 18;

/// Condition reason recorded when the request's public key is unusable.
const REASON_BAD_PUBLIC_KEY: &str = "BadPublicKey";
/// Condition reason recorded when the CA-side signing operation fails.
const REASON_SIGNING_FAILURE: &str = "SigningFailure";

/// Errors that re-enqueue a request for retry.
#[derive(Debug, Error)]
pub enum SignError {
    /// CA material could not be loaded from its source.
    #[error("while loading CA material: {0}")]
    CaUnavailable(#[from] KeyPairError),

    /// The CA bundle did not hold exactly one certificate.
    #[error("while reading CA certificate: {count} cert(s) found, one expected")]
    CaCertCount {
        /// Number of certificates found.
        count: usize,
    },

    /// CA material was present but unparseable.
    #[error("while parsing CA material: {0}")]
    CaInvalid(String),

    /// The certificate template could not be built.
    #[error("while building certificate template: {0}")]
    Template(String),

    /// A store read or write failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-signer capability set: load CA material and shape the certificate
/// template. Signers absent from the controller's table are ignored, not
/// errors; other controllers may own them.
pub trait SignerStrategy: Send + Sync {
    /// The signer's current CA pair.
    fn load_ca(&self) -> Result<CaKeyPair, SignError>;

    /// Build the certificate template for one request.
    fn build_template(
        &self,
        request: &CertRequest,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<CertificateParams, SignError>;
}

/// Strategy shared by both built-in signers: workload identity subject,
/// fixed key usages, 24 hour lifetime.
pub struct WorkloadSigner {
    source: Arc<dyn KeyPairSource>,
}

impl WorkloadSigner {
    /// A built-in signer backed by the given CA source.
    pub fn new(source: Arc<dyn KeyPairSource>) -> Self {
        Self { source }
    }
}

impl SignerStrategy for WorkloadSigner {
    fn load_ca(&self) -> Result<CaKeyPair, SignError> {
        Ok(self.source.current()?)
    }

    fn build_template(
        &self,
        request: &CertRequest,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<CertificateParams, SignError> {
        let mut params = CertificateParams::default();

        params.serial_number = Some(random_serial());

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(format!(
                "system:serviceaccount:{}:{}",
                request.metadata.namespace, request.spec.service_account
            )),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DataEncipherment,
            KeyUsagePurpose::KeyAgreement,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;

        Ok(params)
    }
}

/// Random serial in `[1, 2^128)`.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    if bytes.iter().all(|&b| b == 0) {
        bytes[15] = 1;
    }
    SerialNumber::from_slice(&bytes)
}

fn to_offset(t: DateTime<Utc>) -> Result<time::OffsetDateTime, SignError> {
    time::OffsetDateTime::from_unix_timestamp(t.timestamp())
        .map_err(|e| SignError::Template(e.to_string()))
}

/// Public key taken from a certificate request, usable as the subject key
/// of an rcgen-issued certificate.
struct RequestPublicKey {
    /// DER-encoded SubjectPublicKeyInfo.
    spki_der: Vec<u8>,
    algorithm: &'static SignatureAlgorithm,
}

impl PublicKeyData for RequestPublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.spki_der
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        self.algorithm
    }
}

/// Map an SPKI algorithm identifier onto the rcgen signature algorithm used
/// to issue for that key.
fn detect_algorithm(alg: &AlgorithmIdentifier<'_>) -> Option<&'static SignatureAlgorithm> {
    const RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
    const ID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
    const SECP256R1: &str = "1.2.840.10045.3.1.7";
    const SECP384R1: &str = "1.3.132.0.34";
    const ED25519: &str = "1.3.101.112";

    match alg.algorithm.to_id_string().as_str() {
        ED25519 => Some(&rcgen::PKCS_ED25519),
        RSA_ENCRYPTION => Some(&rcgen::PKCS_RSA_SHA256),
        ID_EC_PUBLIC_KEY => {
            let curve = alg.parameters.as_ref()?.as_oid().ok()?;
            match curve.to_id_string().as_str() {
                SECP256R1 => Some(&rcgen::PKCS_ECDSA_P256_SHA256),
                SECP384R1 => Some(&rcgen::PKCS_ECDSA_P384_SHA384),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Parse the request's public key field into exactly one usable SPKI.
fn parse_single_public_key(public_key: &str) -> Result<RequestPublicKey, String> {
    let blocks =
        pem::parse_many(public_key).map_err(|e| format!("failed to parse public key: {}", e))?;
    if blocks.len() != 1 {
        return Err(format!(
            "public key contained {} keys, wanted 1",
            blocks.len()
        ));
    }
    let block = &blocks[0];
    if block.tag() != "PUBLIC KEY" {
        return Err(format!(
            "unexpected block type {:?}, wanted \"PUBLIC KEY\"",
            block.tag()
        ));
    }

    let der = block.contents();
    let (rest, spki) = SubjectPublicKeyInfo::from_der(der)
        .map_err(|e| format!("failed to parse public key: {}", e))?;
    if !rest.is_empty() {
        return Err("trailing data after public key".to_string());
    }
    let algorithm = detect_algorithm(&spki.algorithm)
        .ok_or_else(|| "unsupported public key algorithm".to_string())?;

    Ok(RequestPublicKey {
        spki_der: der.to_vec(),
        algorithm,
    })
}

/// The certificate signing controller.
pub struct SignController {
    store: Arc<dyn ObjectStore<CertRequest>>,
    requests: Arc<Cache<CertRequest>>,
    queue: Arc<WorkQueue<ObjectKey>>,
    signers: HashMap<String, Arc<dyn SignerStrategy>>,
    clock: Arc<dyn Clock>,
    principal: Principal,
}

impl SignController {
    /// A controller handling both built-in signers, each backed by its own
    /// CA source. `principal` is the identity used for status writes and
    /// must hold the `sign` verb on both signers.
    pub fn new(
        store: Arc<dyn ObjectStore<CertRequest>>,
        clock: Arc<dyn Clock>,
        principal: Principal,
        workload_ca: Arc<dyn KeyPairSource>,
        apiserver_client_ca: Arc<dyn KeyPairSource>,
    ) -> Arc<Self> {
        let mut signers: HashMap<String, Arc<dyn SignerStrategy>> = HashMap::new();
        signers.insert(
            DEFAULT_WORKLOAD_CERTIFICATE_SIGNER.to_string(),
            Arc::new(WorkloadSigner::new(workload_ca)),
        );
        signers.insert(
            KUBE_APISERVER_CLIENT_SIGNER.to_string(),
            Arc::new(WorkloadSigner::new(apiserver_client_ca)),
        );

        Arc::new(Self {
            store,
            requests: Cache::new(),
            queue: WorkQueue::new(),
            signers,
            clock,
            principal,
        })
    }

    /// Run until cancelled: start the watch cache, feed adds/updates/deletes
    /// into the queue, and process keys on `workers` workers. The queue is
    /// drained on shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken, workers: usize) {
        info!(workers, "starting certificate signing controller");

        let queue = Arc::clone(&self.queue);
        self.requests
            .add_event_handler(move |event: &WatchEvent<CertRequest>| {
                // Deletions are enqueued too, so a worker observes the
                // absence and drops the key.
                queue.add(event.object().key());
            });
        let cache_task =
            Arc::clone(&self.requests).start(Arc::clone(&self.store), shutdown.clone());
        self.requests.wait_synced().await;

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let controller = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                controller.worker(worker).await;
            }));
        }

        shutdown.cancelled().await;
        self.queue.shut_down();
        for handle in handles {
            let _ = handle.await;
        }
        let _ = cache_task.await;
        info!("certificate signing controller stopped");
    }

    async fn worker(&self, worker: usize) {
        while let Some(key) = self.queue.get().await {
            match self.reconcile(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(err) => {
                    warn!(
                        request = %key,
                        worker,
                        error = %err,
                        "failed to process certificate request, will retry"
                    );
                    Arc::clone(&self.queue).add_rate_limited(key.clone());
                }
            }
            self.queue.done(&key);
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<(), SignError> {
        let Some(request) = self.requests.get(key) else {
            debug!(request = %key, "certificate request deleted before processing, nothing to do");
            return Ok(());
        };

        if request.is_issued() {
            debug!(request = %key, "certificate issued at current generation, nothing to do");
            return Ok(());
        }

        let Some(signer) = self.signers.get(&request.spec.signer_name) else {
            debug!(
                request = %key,
                signer = %request.spec.signer_name,
                "ignoring certificate request addressed to another signer"
            );
            return Ok(());
        };

        let ca = signer.load_ca()?;
        let ca_certs = pem::parse_many(&ca.cert_pem)
            .map_err(|e| SignError::CaInvalid(format!("failed to parse CA certificate: {}", e)))?;
        if ca_certs.len() != 1 {
            return Err(SignError::CaCertCount {
                count: ca_certs.len(),
            });
        }
        let ca_key = KeyPair::from_pem(&ca.key_pem)
            .map_err(|e| SignError::CaInvalid(format!("failed to parse CA key: {}", e)))?;

        let public_key = match parse_single_public_key(&request.spec.public_key) {
            Ok(spki) => spki,
            Err(reason) => {
                info!(request = %key, reason = %reason, "marking certificate request failed");
                self.set_failed(&request, REASON_BAD_PUBLIC_KEY, reason).await?;
                return Ok(());
            }
        };

        let not_before = self.clock.now() - Duration::minutes(BACKDATE_MINUTES);
        let not_after = not_before + Duration::hours(LIFETIME_HOURS);
        let begin_refresh_at = not_before + Duration::hours(REFRESH_AT_HOURS);

        let template = signer.build_template(&request, not_before, not_after)?;
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
            .map_err(|e| SignError::CaInvalid(format!("failed to create issuer: {}", e)))?;

        let certificate = match template.signed_by(&public_key, &issuer) {
            Ok(cert) => cert,
            Err(err) => {
                error!(request = %key, error = %err, "failed to sign certificate");
                self.set_failed(
                    &request,
                    REASON_SIGNING_FAILURE,
                    format!("failed to sign certificate: {}", err),
                )
                .await?;
                return Ok(());
            }
        };

        self.set_issued(
            &request,
            certificate.pem(),
            not_before,
            not_after,
            begin_refresh_at,
        )
        .await?;
        info!(request = %key, signer = %request.spec.signer_name, "issued certificate");
        Ok(())
    }

    /// Record a terminal failure for the current generation, clearing any
    /// prior signer-owned conditions.
    async fn set_failed(
        &self,
        request: &CertRequest,
        reason: &str,
        message: String,
    ) -> Result<(), SignError> {
        let now = self.clock.now();
        let mut updated = request.clone();
        clear_signer_conditions(&mut updated);
        updated.status.conditions.push(CertRequestCondition {
            condition_type: ConditionType::Failed,
            status: ConditionStatus::True,
            reason: reason.to_string(),
            message,
            observed_generation: request.metadata.generation,
            last_update_time: Some(now),
            last_transition_time: Some(now),
        });

        self.store.update_status(&self.principal, updated).await?;
        Ok(())
    }

    /// Record the issued certificate and validity window, clearing any
    /// prior signer-owned conditions.
    async fn set_issued(
        &self,
        request: &CertRequest,
        certificate: String,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        begin_refresh_at: DateTime<Utc>,
    ) -> Result<(), SignError> {
        let mut updated = request.clone();
        updated.status.certificate = certificate;
        updated.status.observed_generation = request.metadata.generation;
        updated.status.not_before = Some(not_before);
        updated.status.not_after = Some(not_after);
        updated.status.begin_refresh_at = Some(begin_refresh_at);
        clear_signer_conditions(&mut updated);

        self.store.update_status(&self.principal, updated).await?;
        Ok(())
    }
}

fn clear_signer_conditions(request: &mut CertRequest) {
    request.status.conditions.retain(|c| {
        !matches!(
            c.condition_type,
            ConditionType::Failed | ConditionType::Pending
        )
    });
}
