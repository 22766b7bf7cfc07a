//! Node-side trust-anchor queries.
//!
//! Consumers ask for trust anchors either by bundle name or by signer.
//! By-signer queries union the PEM blocks of every matching bundle keyed by
//! DER bytes, which removes accidental duplication across overlapping
//! bundles without trusting their individual canonicalization state.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;

use trellis_api::normalize::encode_certificate_block;
use trellis_api::{ObjectKey, TrustBundle};
use trellis_store::{Cache, LabelSelector};

/// Errors from trust-anchor queries.
#[derive(Debug, Error)]
pub enum TrustAnchorError {
    /// The bundle cache has not completed its initial list.
    #[error("trust bundle cache has not yet synced")]
    NotSynced,

    /// No bundle with the given name exists.
    #[error("trust bundle {0:?} not found")]
    NotFound(String),

    /// The feature is disabled in this deployment.
    #[error("trust bundles are not supported in this configuration")]
    Unsupported,
}

/// Node-local interface for reading trust anchors.
pub trait TrustAnchors: Send + Sync {
    /// The stored (already canonical) bundle with the given name.
    fn trust_anchors_by_name(&self, name: &str) -> Result<String, TrustAnchorError>;

    /// The deduplicated union of every bundle matching `signer_name` and
    /// the label selector, re-encoded as canonical PEM.
    fn trust_anchors_by_signer(
        &self,
        signer_name: &str,
        selector: &LabelSelector,
    ) -> Result<String, TrustAnchorError>;
}

/// [`TrustAnchors`] backed by a watch cache over trust bundles.
pub struct TrustAnchorManager {
    bundles: Arc<Cache<TrustBundle>>,
}

impl TrustAnchorManager {
    /// A manager reading from the given cache. The cache's lifecycle is
    /// owned by the caller.
    pub fn new(bundles: Arc<Cache<TrustBundle>>) -> Self {
        Self { bundles }
    }

    fn ensure_synced(&self) -> Result<(), TrustAnchorError> {
        if !self.bundles.has_synced() {
            return Err(TrustAnchorError::NotSynced);
        }
        Ok(())
    }
}

impl TrustAnchors for TrustAnchorManager {
    fn trust_anchors_by_name(&self, name: &str) -> Result<String, TrustAnchorError> {
        self.ensure_synced()?;

        let bundle = self
            .bundles
            .get(&ObjectKey::named(name))
            .ok_or_else(|| TrustAnchorError::NotFound(name.to_string()))?;
        Ok(bundle.spec.trust_bundle)
    }

    fn trust_anchors_by_signer(
        &self,
        signer_name: &str,
        selector: &LabelSelector,
    ) -> Result<String, TrustAnchorError> {
        self.ensure_synced()?;

        let mut anchors: BTreeSet<Vec<u8>> = BTreeSet::new();
        for bundle in self.bundles.list() {
            if bundle.spec.signer_name != signer_name {
                continue;
            }
            if !selector.matches(&bundle.metadata.labels) {
                continue;
            }
            for block in pem::parse_many(&bundle.spec.trust_bundle).unwrap_or_default() {
                anchors.insert(block.into_contents());
            }
        }

        let mut joined = String::new();
        for der in anchors {
            joined.push_str(&encode_certificate_block(&der));
        }
        Ok(joined)
    }
}

/// Manager variant for deployments with the feature disabled; every call
/// returns a fixed error.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTrustAnchorManager;

impl TrustAnchors for NoopTrustAnchorManager {
    fn trust_anchors_by_name(&self, _name: &str) -> Result<String, TrustAnchorError> {
        Err(TrustAnchorError::Unsupported)
    }

    fn trust_anchors_by_signer(
        &self,
        _signer_name: &str,
        _selector: &LabelSelector,
    ) -> Result<String, TrustAnchorError> {
        Err(TrustAnchorError::Unsupported)
    }
}
