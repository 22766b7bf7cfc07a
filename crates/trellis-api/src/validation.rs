//! Validation rules for stored kinds.
//!
//! These are pure functions over object snapshots; the object store runs
//! them on every create and update, after admission and preparation. They
//! return structured field-path errors so callers can correlate a rejection
//! to the offending input.

use crate::certrequest::{CertRequest, ConditionType};
use crate::error::{FieldError, ValidationErrors};
use crate::normalize::normalize;
use crate::signer_name::{validate_bundle_name, validate_signer_name};
use crate::trustbundle::TrustBundle;

/// Validate a TrustBundle at creation.
///
/// Checks signer-name syntax, the name prefix rule, and that the anchor
/// payload is canonical and non-empty. Preparation normalizes the payload
/// before this runs; validation re-checks the invariant so a stored object
/// can never be non-canonical.
pub fn validate_trust_bundle_create(bundle: &TrustBundle) -> Result<(), ValidationErrors> {
    let mut errs = ValidationErrors::new();

    if bundle.metadata.name.is_empty() {
        errs.push(FieldError::required("metadata.name"));
    }
    if !bundle.metadata.namespace.is_empty() {
        errs.push(FieldError::invalid(
            "metadata.namespace",
            "trust bundles are cluster-scoped",
        ));
    }

    if !bundle.spec.signer_name.is_empty() {
        if let Err(msg) = validate_signer_name(&bundle.spec.signer_name) {
            errs.push(FieldError::invalid("spec.signerName", msg));
        }
    }

    if !bundle.metadata.name.is_empty() {
        if let Err(msg) = validate_bundle_name(&bundle.metadata.name, &bundle.spec.signer_name) {
            errs.push(FieldError::invalid("metadata.name", msg));
        }
    }

    match normalize(&bundle.spec.trust_bundle) {
        Err(err) => {
            errs.push(FieldError::invalid(
                "spec.trustBundle",
                format!("contains an invalid block: {}", err),
            ));
        }
        Ok(normalized) => {
            if normalized.is_empty() {
                errs.push(FieldError::invalid(
                    "spec.trustBundle",
                    "at least one trust anchor must be provided",
                ));
            } else if normalized != bundle.spec.trust_bundle {
                errs.push(FieldError::invalid(
                    "spec.trustBundle",
                    "must be in canonicalized form",
                ));
            }
        }
    }

    errs.into_result()
}

/// Validate a TrustBundle update: everything from create, plus signer
/// immutability.
pub fn validate_trust_bundle_update(
    new: &TrustBundle,
    old: &TrustBundle,
) -> Result<(), ValidationErrors> {
    let mut errs = match validate_trust_bundle_create(new) {
        Ok(()) => ValidationErrors::new(),
        Err(errs) => errs,
    };

    if new.spec.signer_name != old.spec.signer_name {
        errs.push(FieldError::forbidden(
            "spec.signerName",
            "updates may not change the signer name",
        ));
    }

    errs.into_result()
}

fn validate_public_key_field(public_key: &str, field: &str, errs: &mut ValidationErrors) {
    if public_key.is_empty() {
        errs.push(FieldError::required(field));
        return;
    }

    match pem::parse_many(public_key) {
        Err(err) => {
            errs.push(FieldError::invalid(field, format!("malformed PEM: {}", err)));
        }
        Ok(blocks) if blocks.is_empty() => {
            errs.push(FieldError::invalid(
                field,
                "must contain at least one PEM public-key block",
            ));
        }
        Ok(blocks) => {
            if let Some(block) = blocks.iter().find(|b| b.tag() != "PUBLIC KEY") {
                errs.push(FieldError::invalid(
                    field,
                    format!("unexpected block type {:?}", block.tag()),
                ));
            }
        }
    }
}

/// Validate a CertRequest at creation.
///
/// Runs after the admission mutator, so the pod-derived fields and the
/// requester must already be populated.
pub fn validate_cert_request_create(req: &CertRequest) -> Result<(), ValidationErrors> {
    let mut errs = ValidationErrors::new();

    if req.metadata.name.is_empty() {
        errs.push(FieldError::required("metadata.name"));
    }
    if req.metadata.namespace.is_empty() {
        errs.push(FieldError::required("metadata.namespace"));
    }

    if req.spec.signer_name.is_empty() {
        errs.push(FieldError::required("spec.signerName"));
    } else if let Err(msg) = validate_signer_name(&req.spec.signer_name) {
        errs.push(FieldError::invalid("spec.signerName", msg));
    }

    for (value, field) in [
        (&req.spec.pod, "spec.pod"),
        (&req.spec.pod_uid, "spec.podUID"),
        (&req.spec.service_account, "spec.serviceAccount"),
        (&req.spec.node, "spec.node"),
        (&req.spec.requester, "spec.requester"),
    ] {
        if value.is_empty() {
            errs.push(FieldError::required(field));
        }
    }

    validate_public_key_field(&req.spec.public_key, "spec.publicKey", &mut errs);

    errs.into_result()
}

/// Validate a CertRequest update against the stored object.
///
/// Every spec field except `public_key` is immutable; `public_key` may
/// change through the re-key flow.
pub fn validate_cert_request_update(
    new: &CertRequest,
    old: &CertRequest,
) -> Result<(), ValidationErrors> {
    let mut errs = match validate_cert_request_create(new) {
        Ok(()) => ValidationErrors::new(),
        Err(errs) => errs,
    };

    let immutable = [
        (&new.spec.signer_name, &old.spec.signer_name, "spec.signerName"),
        (&new.spec.pod, &old.spec.pod, "spec.pod"),
        (&new.spec.pod_uid, &old.spec.pod_uid, "spec.podUID"),
        (
            &new.spec.service_account,
            &old.spec.service_account,
            "spec.serviceAccount",
        ),
        (&new.spec.node, &old.spec.node, "spec.node"),
        (&new.spec.requester, &old.spec.requester, "spec.requester"),
    ];
    for (new_value, old_value, field) in immutable {
        if new_value != old_value {
            errs.push(FieldError::forbidden(field, "field is immutable"));
        }
    }

    errs.into_result()
}

/// Validate a CertRequest status update against the genuine stored object.
pub fn validate_cert_request_status_update(
    new: &CertRequest,
    old: &CertRequest,
) -> Result<(), ValidationErrors> {
    let mut errs = ValidationErrors::new();

    if new.spec != old.spec {
        errs.push(FieldError::forbidden(
            "spec",
            "spec may not change through the status subresource",
        ));
    }

    if !new.status.certificate.is_empty() {
        match pem::parse_many(&new.status.certificate) {
            Err(err) => {
                errs.push(FieldError::invalid(
                    "status.certificate",
                    format!("malformed PEM: {}", err),
                ));
            }
            Ok(blocks) => {
                if blocks.len() != 1 || blocks[0].tag() != "CERTIFICATE" {
                    errs.push(FieldError::invalid(
                        "status.certificate",
                        "must be a single PEM certificate block",
                    ));
                }
            }
        }
    }

    for condition_type in [ConditionType::Failed, ConditionType::Pending] {
        let count = new
            .status
            .conditions
            .iter()
            .filter(|c| c.condition_type == condition_type)
            .count();
        if count > 1 {
            errs.push(FieldError::invalid(
                "status.conditions",
                format!("duplicate condition of type {:?}", condition_type),
            ));
        }
    }

    errs.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certrequest::CertRequestSpec;
    use crate::normalize::encode_certificate_block;
    use crate::trustbundle::TrustBundleSpec;

    fn canonical_bundle() -> String {
        normalize(&encode_certificate_block(&[1, 2, 3])).unwrap()
    }

    fn valid_bundle() -> TrustBundle {
        TrustBundle::new(
            "example.com:foo:v1",
            TrustBundleSpec {
                signer_name: "example.com/foo".to_string(),
                trust_bundle: canonical_bundle(),
            },
        )
    }

    fn public_key_pem() -> String {
        pem::encode(&pem::Pem::new("PUBLIC KEY", vec![4, 5, 6]))
    }

    fn valid_request() -> CertRequest {
        CertRequest::new(
            "n1",
            "kubelet-p1-v1-0",
            CertRequestSpec {
                signer_name: "kubernetes.io/default-workload-certificate".to_string(),
                pod: "p1".to_string(),
                pod_uid: "u1".to_string(),
                service_account: "sa1".to_string(),
                node: "node-a".to_string(),
                requester: "system:node:node-a".to_string(),
                public_key: public_key_pem(),
            },
        )
    }

    #[test]
    fn accepts_valid_bundle() {
        assert!(validate_trust_bundle_create(&valid_bundle()).is_ok());
    }

    #[test]
    fn rejects_non_canonical_bundle() {
        let mut bundle = valid_bundle();
        bundle.spec.trust_bundle = format!("junk\n{}", bundle.spec.trust_bundle);
        let errs = validate_trust_bundle_create(&bundle).unwrap_err();
        assert!(errs.to_string().contains("canonicalized"));
    }

    #[test]
    fn rejects_empty_bundle() {
        let mut bundle = valid_bundle();
        bundle.spec.trust_bundle = String::new();
        let errs = validate_trust_bundle_create(&bundle).unwrap_err();
        assert!(errs.to_string().contains("at least one trust anchor"));
    }

    #[test]
    fn rejects_bad_signer_name() {
        let mut bundle = valid_bundle();
        bundle.spec.signer_name = "invalid".to_string();
        let errs = validate_trust_bundle_create(&bundle).unwrap_err();
        assert!(errs.to_string().contains("spec.signerName"));
    }

    #[test]
    fn rejects_name_without_signer_prefix() {
        let mut bundle = valid_bundle();
        bundle.metadata.name = "not-matching".to_string();
        let errs = validate_trust_bundle_create(&bundle).unwrap_err();
        assert!(errs.to_string().contains("example.com:foo:"));
    }

    #[test]
    fn rejects_signer_change_on_update() {
        let old = valid_bundle();
        let mut new = old.clone();
        new.spec.signer_name = "example.com/bar".to_string();
        // Keep the name consistent with the new signer so only the
        // immutability failure fires.
        new.metadata.name = "example.com:bar:v1".to_string();
        let errs = validate_trust_bundle_update(&new, &old).unwrap_err();
        assert!(errs.to_string().contains("may not change the signer name"));
    }

    #[test]
    fn accepts_valid_request() {
        assert!(validate_cert_request_create(&valid_request()).is_ok());
    }

    #[test]
    fn rejects_unmutated_request() {
        // Before admission runs, serviceAccount/node/requester are blank.
        let mut req = valid_request();
        req.spec.service_account = String::new();
        req.spec.node = String::new();
        req.spec.requester = String::new();
        let errs = validate_cert_request_create(&req).unwrap_err();
        assert_eq!(errs.errors().len(), 3);
    }

    #[test]
    fn two_public_key_blocks_pass_creation() {
        // The exactly-one rule binds at signing time, not here; a request
        // with two well-formed key blocks must survive admission so the
        // signer can record the terminal failure.
        let mut req = valid_request();
        req.spec.public_key = format!("{}{}", public_key_pem(), public_key_pem());
        assert!(validate_cert_request_create(&req).is_ok());
    }

    #[test]
    fn rejects_non_key_block_in_public_key() {
        let mut req = valid_request();
        req.spec.public_key = encode_certificate_block(&[1]);
        let errs = validate_cert_request_create(&req).unwrap_err();
        assert!(errs.to_string().contains("unexpected block type"));
    }

    #[test]
    fn rekey_is_the_only_allowed_spec_update() {
        let old = valid_request();

        let mut rekeyed = old.clone();
        rekeyed.spec.public_key = pem::encode(&pem::Pem::new("PUBLIC KEY", vec![9, 9]));
        assert!(validate_cert_request_update(&rekeyed, &old).is_ok());

        let mut moved = old.clone();
        moved.spec.node = "node-b".to_string();
        let errs = validate_cert_request_update(&moved, &old).unwrap_err();
        assert!(errs.to_string().contains("spec.node: field is immutable"));
    }

    #[test]
    fn status_update_cannot_change_spec() {
        let old = valid_request();
        let mut new = old.clone();
        new.spec.pod = "other".to_string();
        let errs = validate_cert_request_status_update(&new, &old).unwrap_err();
        assert!(errs.to_string().contains("status subresource"));
    }

    #[test]
    fn status_certificate_must_be_single_block() {
        let old = valid_request();
        let mut new = old.clone();
        new.status.certificate = format!(
            "{}{}",
            encode_certificate_block(&[1]),
            encode_certificate_block(&[2])
        );
        let errs = validate_cert_request_status_update(&new, &old).unwrap_err();
        assert!(errs.to_string().contains("single PEM certificate block"));
    }
}
