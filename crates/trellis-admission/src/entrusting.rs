//! Entrusting stage: who may publish trust anchors for a signer.

use std::sync::Arc;

use tracing::debug;
use trellis_api::TrustBundle;
use trellis_store::{
    is_authorized_for_signer_name, AdmissionError, AdmissionPlugin, AdmissionRequest, Authorizer,
    Operation,
};

/// Verb required to publish trust anchors for a signer.
pub const ATTEST_VERB: &str = "attest";

/// Validating stage for [`TrustBundle`] writes.
///
/// A bundle with an empty signer name passes (subject to store-level
/// policy). Otherwise the principal must hold `attest` on the signer.
/// Signer-name changes are rejected here as well as in validation, so the
/// permission check can always run against the new object.
pub struct BundleEntrusting {
    authz: Arc<dyn Authorizer>,
}

impl BundleEntrusting {
    /// A stage backed by the given authorizer.
    pub fn new(authz: Arc<dyn Authorizer>) -> Self {
        Self { authz }
    }
}

impl AdmissionPlugin<TrustBundle> for BundleEntrusting {
    fn validate(
        &self,
        req: &AdmissionRequest,
        new: &TrustBundle,
        old: Option<&TrustBundle>,
    ) -> Result<(), AdmissionError> {
        if req.operation == Operation::Update {
            if let Some(old) = old {
                if old.spec.signer_name != new.spec.signer_name {
                    return Err(AdmissionError::forbidden("changing signerName is forbidden"));
                }
            }
        }

        if new.spec.signer_name.is_empty() {
            return Ok(());
        }

        if !is_authorized_for_signer_name(
            self.authz.as_ref(),
            &req.principal,
            ATTEST_VERB,
            &new.spec.signer_name,
        ) {
            debug!(
                bundle = %new.metadata.name,
                signer = %new.spec.signer_name,
                principal = %req.principal.name,
                "denying trust bundle write: principal may not attest this signer"
            );
            return Err(AdmissionError::forbidden(format!(
                "user not permitted to attest signerName {:?}",
                new.spec.signer_name
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_api::TrustBundleSpec;
    use trellis_store::{PolicyAuthorizer, Principal, SIGNERS_RESOURCE};

    fn bundle(signer: &str) -> TrustBundle {
        TrustBundle::new(
            if signer.is_empty() {
                "plain".to_string()
            } else {
                format!("{}:v1", signer.replace('/', ":"))
            },
            TrustBundleSpec {
                signer_name: signer.to_string(),
                trust_bundle: String::new(),
            },
        )
    }

    fn stage_with_grant(principal: &str, signer: &str) -> BundleEntrusting {
        let authz = PolicyAuthorizer::new();
        authz.allow(principal, ATTEST_VERB, SIGNERS_RESOURCE, signer);
        BundleEntrusting::new(Arc::new(authz))
    }

    #[test]
    fn empty_signer_passes_without_authority() {
        let stage = BundleEntrusting::new(Arc::new(PolicyAuthorizer::new()));
        let req = AdmissionRequest::create(Principal::new("anyone"));
        stage.validate(&req, &bundle(""), None).unwrap();
    }

    #[test]
    fn attest_authority_is_required_on_create() {
        let stage = stage_with_grant("producer", "example.com/foo");

        let ok = AdmissionRequest::create(Principal::new("producer"));
        stage.validate(&ok, &bundle("example.com/foo"), None).unwrap();

        let denied = AdmissionRequest::create(Principal::new("stranger"));
        let err = stage
            .validate(&denied, &bundle("example.com/foo"), None)
            .unwrap_err();
        assert!(err.message.contains("not permitted to attest"));
    }

    #[test]
    fn signer_change_is_rejected_even_for_authorized_principals() {
        let stage = stage_with_grant("producer", "example.com/*");

        let old = bundle("example.com/foo");
        let new = bundle("example.com/bar");
        let req = AdmissionRequest::update(Principal::new("producer"));
        let err = stage.validate(&req, &new, Some(&old)).unwrap_err();
        assert!(err.message.contains("changing signerName is forbidden"));
    }

    #[test]
    fn update_rechecks_attest_authority() {
        let stage = stage_with_grant("producer", "example.com/foo");

        let old = bundle("example.com/foo");
        let req = AdmissionRequest::update(Principal::new("someone-else"));
        let err = stage.validate(&req, &old, Some(&old)).unwrap_err();
        assert!(err.message.contains("not permitted to attest"));
    }
}
