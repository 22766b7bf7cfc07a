//! End-to-end issuance flows: store + admission + signing controller +
//! node manager wired together against a fake clock.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use trellis_admission::{WorkloadRestriction, SIGN_VERB};
use trellis_api::{
    CertRequest, CertRequestSpec, ConditionStatus, ConditionType, ObjectKey, Pod,
    DEFAULT_WORKLOAD_CERTIFICATE_SIGNER,
};
use trellis_node::{
    key_file_hash, WorkloadCertificateError, WorkloadCertificateManager, WorkloadCertificates,
    PRIVATE_KEY_FILE_HASH_ANNOTATION,
};
use trellis_signer::{CaKeyPair, SignController, StaticKeyPairSource};
use trellis_store::{
    AdmissionChain, Cache, CertRequestStrategy, FakeClock, MemoryStore, ObjectStore, PodIndex,
    PolicyAuthorizer, Principal, StoreError, SIGNERS_RESOURCE,
};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

const SIGNER_PRINCIPAL: &str = "system:workload-certificate-signer";

struct Harness {
    store: Arc<MemoryStore<CertRequest>>,
    pods: Arc<PodIndex>,
    clock: Arc<FakeClock>,
    manager: WorkloadCertificateManager,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let authz = Arc::new(PolicyAuthorizer::new());
    authz.allow(SIGNER_PRINCIPAL, SIGN_VERB, SIGNERS_RESOURCE, "kubernetes.io/*");

    let pods = PodIndex::new();
    pods.insert(Pod::new("n1", "p1", "u1", "sa1", "node-a"));

    let chain = AdmissionChain::new().register(Arc::new(WorkloadRestriction::new(
        authz.clone(),
        pods.clone(),
    )));
    let store = MemoryStore::new(Box::new(CertRequestStrategy), chain);
    let clock = Arc::new(FakeClock::new(Utc::now()));
    let shutdown = CancellationToken::new();

    let ca = CaKeyPair::self_signed("cluster-workload-ca").unwrap();
    let source = Arc::new(StaticKeyPairSource::new(ca));
    let controller = SignController::new(
        store.clone(),
        clock.clone(),
        Principal::new(SIGNER_PRINCIPAL),
        source.clone(),
        source,
    );
    tokio::spawn(controller.run(shutdown.clone(), 2));

    let requests = Cache::new();
    Arc::clone(&requests).start(store.clone(), shutdown.clone());
    requests.wait_synced().await;

    let manager = WorkloadCertificateManager::new(
        store.clone(),
        requests,
        clock.clone(),
        Principal::node("node-a"),
    )
    .with_poll_interval(StdDuration::from_millis(20));

    Harness {
        store,
        pods,
        clock,
        manager,
        shutdown,
    }
}

fn subject_cn(cert_pem: &str) -> String {
    let blocks = pem::parse_many(cert_pem).unwrap();
    assert_eq!(blocks.len(), 1, "issued certificate is a single PEM block");
    let (_, cert) = X509Certificate::from_der(blocks[0].contents()).unwrap();
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap()
        .to_string();
    cn
}

async fn fetch_certificate(
    harness: &Harness,
    key_file_hash: &str,
) -> Result<(String, String), WorkloadCertificateError> {
    let ctx = CancellationToken::new();
    tokio::time::timeout(
        StdDuration::from_secs(5),
        harness.manager.get_workload_certificate(
            &ctx,
            DEFAULT_WORKLOAD_CERTIFICATE_SIGNER,
            "n1",
            "p1",
            "u1",
            "certs",
            0,
            key_file_hash,
        ),
    )
    .await
    .expect("issuance should complete in time")
}

#[tokio::test]
async fn happy_path_issues_a_workload_certificate() {
    let harness = harness().await;

    let (private_key, certificate) = fetch_certificate(&harness, "").await.unwrap();
    assert!(private_key.contains("BEGIN PRIVATE KEY"));
    assert_eq!(subject_cn(&certificate), "system:serviceaccount:n1:sa1");

    // Admission bound the request to the live pod and the node identity.
    let key = ObjectKey::namespaced("n1", "kubelet-p1-certs-0");
    let stored = harness.store.get(&key).await.unwrap();
    assert_eq!(stored.spec.service_account, "sa1");
    assert_eq!(stored.spec.node, "node-a");
    assert_eq!(stored.spec.requester, "system:node:node-a");
    assert_eq!(stored.status.observed_generation, stored.metadata.generation);
    assert_eq!(
        stored
            .metadata
            .annotations
            .get(PRIVATE_KEY_FILE_HASH_ANNOTATION)
            .unwrap(),
        &key_file_hash(&private_key)
    );

    // A second call with the current key hash returns the same certificate
    // without exposing a new private key.
    let (empty_key, same_certificate) =
        fetch_certificate(&harness, &key_file_hash(&private_key)).await.unwrap();
    assert!(empty_key.is_empty());
    assert_eq!(same_certificate, certificate);
}

#[tokio::test]
async fn bad_public_key_is_a_terminal_failure() {
    let harness = harness().await;

    // Two public-key blocks survive admission; the signer rejects them.
    let doubled = {
        let one = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .unwrap()
            .public_key_pem();
        let two = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .unwrap()
            .public_key_pem();
        format!("{}\n{}", one, two)
    };
    let broken_key_hash = key_file_hash("not-actually-a-key");
    let mut request = CertRequest::new(
        "n1",
        "kubelet-p1-certs-1",
        CertRequestSpec {
            signer_name: DEFAULT_WORKLOAD_CERTIFICATE_SIGNER.to_string(),
            pod: "p1".to_string(),
            pod_uid: "u1".to_string(),
            public_key: doubled,
            ..CertRequestSpec::default()
        },
    );
    request.metadata.annotations.insert(
        PRIVATE_KEY_FILE_HASH_ANNOTATION.to_string(),
        broken_key_hash.clone(),
    );
    let created = harness
        .store
        .create(&Principal::node("node-a"), request)
        .await
        .unwrap();
    let key = created.metadata.key();

    let failed = tokio::time::timeout(StdDuration::from_secs(5), async {
        loop {
            let current = harness.store.get(&key).await.unwrap();
            if current.condition(ConditionType::Failed).is_some() {
                return current;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await
    .expect("failure condition should appear");

    assert!(failed.status.certificate.is_empty());
    let cond = failed.condition(ConditionType::Failed).unwrap();
    assert_eq!(cond.status, ConditionStatus::True);
    assert_eq!(cond.reason, "BadPublicKey");
    assert_eq!(cond.observed_generation, 1);

    // The manager surfaces the failure instead of hanging. The caller's
    // key hash matches the recorded annotation, so no re-key happens.
    // Retry while the manager's cache is still catching up to the create.
    let ctx = CancellationToken::new();
    let err = tokio::time::timeout(StdDuration::from_secs(5), async {
        loop {
            let result = harness
                .manager
                .get_workload_certificate(
                    &ctx,
                    DEFAULT_WORKLOAD_CERTIFICATE_SIGNER,
                    "n1",
                    "p1",
                    "u1",
                    "certs",
                    1,
                    &broken_key_hash,
                )
                .await;
            match result {
                Err(WorkloadCertificateError::Store(StoreError::AlreadyExists { .. })) => {
                    tokio::time::sleep(StdDuration::from_millis(10)).await;
                }
                other => return other,
            }
        }
    })
    .await
    .expect("manager should observe the failure")
    .unwrap_err();
    match err {
        WorkloadCertificateError::IssuanceFailed(message) => {
            assert!(message.contains("BadPublicKey"));
        }
        other => panic!("expected issuance failure, got {:?}", other),
    }
}

#[tokio::test]
async fn refresh_window_triggers_a_rekey() {
    let harness = harness().await;

    let (first_key, first_certificate) = fetch_certificate(&harness, "").await.unwrap();
    let key = ObjectKey::namespaced("n1", "kubelet-p1-certs-0");
    let issued = harness.store.get(&key).await.unwrap();
    let first_public_key = issued.spec.public_key.clone();
    assert_eq!(issued.metadata.generation, 1);

    // Cross the refresh threshold and come back with the current key.
    harness.clock.advance(Duration::hours(19));
    let (second_key, second_certificate) =
        fetch_certificate(&harness, &key_file_hash(&first_key)).await.unwrap();

    assert!(second_key.contains("BEGIN PRIVATE KEY"));
    assert_ne!(second_key, first_key);
    assert_ne!(second_certificate, first_certificate);
    assert_eq!(subject_cn(&second_certificate), "system:serviceaccount:n1:sa1");

    let rekeyed = harness.store.get(&key).await.unwrap();
    assert_eq!(rekeyed.metadata.generation, 2);
    assert_eq!(rekeyed.status.observed_generation, 2);
    assert_ne!(rekeyed.spec.public_key, first_public_key);
    assert_eq!(
        rekeyed
            .metadata
            .annotations
            .get(PRIVATE_KEY_FILE_HASH_ANNOTATION)
            .unwrap(),
        &key_file_hash(&second_key)
    );
}

#[tokio::test]
async fn replaced_key_file_triggers_a_rekey() {
    let harness = harness().await;

    let (first_key, _) = fetch_certificate(&harness, "").await.unwrap();

    // The caller's on-disk key no longer matches the recorded hash.
    let (second_key, certificate) = fetch_certificate(&harness, "tampered-hash").await.unwrap();
    assert!(second_key.contains("BEGIN PRIVATE KEY"));
    assert_ne!(second_key, first_key);
    assert!(!certificate.is_empty());

    let key = ObjectKey::namespaced("n1", "kubelet-p1-certs-0");
    let rekeyed = harness.store.get(&key).await.unwrap();
    assert_eq!(rekeyed.metadata.generation, 2);
}

#[tokio::test]
async fn requests_for_unknown_pods_are_denied() {
    let harness = harness().await;
    let ctx = CancellationToken::new();

    let err = harness
        .manager
        .get_workload_certificate(
            &ctx,
            DEFAULT_WORKLOAD_CERTIFICATE_SIGNER,
            "n1",
            "ghost-pod",
            "u9",
            "certs",
            0,
            "",
        )
        .await
        .unwrap_err();

    match err {
        WorkloadCertificateError::Store(StoreError::Forbidden(denial)) => {
            assert!(denial.message.contains("does not exist in the cluster"));
        }
        other => panic!("expected policy denial, got {:?}", other),
    }
}

#[tokio::test]
async fn recycled_pod_uid_is_denied() {
    let harness = harness().await;
    harness.pods.insert(Pod::new("n1", "p2", "u2", "sa1", "node-a"));
    let ctx = CancellationToken::new();

    let err = harness
        .manager
        .get_workload_certificate(
            &ctx,
            DEFAULT_WORKLOAD_CERTIFICATE_SIGNER,
            "n1",
            "p2",
            "stale-uid",
            "certs",
            0,
            "",
        )
        .await
        .unwrap_err();

    match err {
        WorkloadCertificateError::Store(StoreError::Forbidden(denial)) => {
            assert!(denial.message.contains("pod UID mismatch"));
        }
        other => panic!("expected policy denial, got {:?}", other),
    }
}

#[tokio::test]
async fn cancellation_interrupts_the_wait() {
    let harness = harness().await;

    // Nobody issues for this signer, so the wait can only end by
    // cancellation.
    let ctx = CancellationToken::new();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        cancel.cancel();
    });

    let err = tokio::time::timeout(
        StdDuration::from_secs(5),
        harness.manager.get_workload_certificate(
            &ctx,
            "example.com/unhandled-signer",
            "n1",
            "p1",
            "u1",
            "certs",
            2,
            "",
        ),
    )
    .await
    .expect("cancellation should end the wait")
    .unwrap_err();

    assert!(matches!(err, WorkloadCertificateError::Cancelled));
}
