//! Per-kind preparation and validation strategies wired into the store's
//! write path.
//!
//! A strategy runs after admission and before persistence. Preparation may
//! mutate the object into its stored form (trust-bundle canonicalization
//! happens here); validation then re-checks every invariant so a
//! non-canonical object can never be persisted.

use trellis_api::normalize::normalize;
use trellis_api::validation;
use trellis_api::{CertRequest, FieldError, TrustBundle, ValidationErrors};

/// Create/update behavior for one stored kind.
pub trait Strategy<T>: Send + Sync {
    /// Mutate an incoming object into its stored form before create.
    fn prepare_for_create(&self, obj: &mut T) -> Result<(), ValidationErrors> {
        let _ = obj;
        Ok(())
    }

    /// Validate an object at create.
    fn validate_create(&self, obj: &T) -> Result<(), ValidationErrors>;

    /// Mutate an incoming object into its stored form before update.
    fn prepare_for_update(&self, new: &mut T, old: &T) -> Result<(), ValidationErrors> {
        let _ = (new, old);
        Ok(())
    }

    /// Validate an update against the stored object.
    fn validate_update(&self, new: &T, old: &T) -> Result<(), ValidationErrors>;

    /// Validate a status-subresource update against the stored object.
    fn validate_status_update(&self, new: &T, old: &T) -> Result<(), ValidationErrors> {
        let _ = (new, old);
        Ok(())
    }
}

/// Strategy for [`TrustBundle`]: canonicalize in preparation, re-check in
/// validation.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrustBundleStrategy;

impl TrustBundleStrategy {
    fn canonicalize(bundle: &mut TrustBundle) -> Result<(), ValidationErrors> {
        match normalize(&bundle.spec.trust_bundle) {
            Ok(normalized) => {
                bundle.spec.trust_bundle = normalized;
                Ok(())
            }
            Err(err) => Err(FieldError::invalid(
                "spec.trustBundle",
                format!("contains an invalid block: {}", err),
            )
            .into()),
        }
    }
}

impl Strategy<TrustBundle> for TrustBundleStrategy {
    fn prepare_for_create(&self, obj: &mut TrustBundle) -> Result<(), ValidationErrors> {
        Self::canonicalize(obj)
    }

    fn validate_create(&self, obj: &TrustBundle) -> Result<(), ValidationErrors> {
        validation::validate_trust_bundle_create(obj)
    }

    fn prepare_for_update(
        &self,
        new: &mut TrustBundle,
        _old: &TrustBundle,
    ) -> Result<(), ValidationErrors> {
        Self::canonicalize(new)
    }

    fn validate_update(&self, new: &TrustBundle, old: &TrustBundle) -> Result<(), ValidationErrors> {
        validation::validate_trust_bundle_update(new, old)
    }
}

/// Strategy for [`CertRequest`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CertRequestStrategy;

impl Strategy<CertRequest> for CertRequestStrategy {
    fn validate_create(&self, obj: &CertRequest) -> Result<(), ValidationErrors> {
        validation::validate_cert_request_create(obj)
    }

    fn validate_update(&self, new: &CertRequest, old: &CertRequest) -> Result<(), ValidationErrors> {
        validation::validate_cert_request_update(new, old)
    }

    fn validate_status_update(
        &self,
        new: &CertRequest,
        old: &CertRequest,
    ) -> Result<(), ValidationErrors> {
        validation::validate_cert_request_status_update(new, old)
    }
}
