//! Store error taxonomy.

use thiserror::Error;
use trellis_api::ValidationErrors;

use crate::admission::AdmissionError;

/// Errors surfaced by object-store operations.
///
/// Controllers branch on transience: conflicts and sync gaps retry via
/// backoff, policy and validation rejections surface to the caller verbatim.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object with the given key exists.
    #[error("{kind} {key:?} not found")]
    NotFound {
        /// Kind name.
        kind: &'static str,
        /// Rendered object key.
        key: String,
    },

    /// An object with the given key already exists.
    #[error("{kind} {key:?} already exists")]
    AlreadyExists {
        /// Kind name.
        kind: &'static str,
        /// Rendered object key.
        key: String,
    },

    /// The caller's resource version no longer matches the stored object.
    #[error("conflict writing {kind} {key:?}: stale resource version")]
    Conflict {
        /// Kind name.
        kind: &'static str,
        /// Rendered object key.
        key: String,
    },

    /// An admission stage denied the request.
    #[error(transparent)]
    Forbidden(#[from] AdmissionError),

    /// The object failed validation.
    #[error("invalid {kind}: {errors}")]
    Invalid {
        /// Kind name.
        kind: &'static str,
        /// Field-path errors.
        errors: ValidationErrors,
    },

    /// The list selector used a field label the kind does not support.
    #[error("field label {label:?} is not supported for {kind}")]
    UnsupportedFieldLabel {
        /// Kind name.
        kind: &'static str,
        /// The offending field label.
        label: String,
    },

    /// The kind has no status subresource.
    #[error("{0} has no status subresource")]
    NoStatusSubresource(&'static str),
}

impl StoreError {
    /// Whether retrying the same request may succeed without caller changes.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Whether this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_transient() {
        let err = StoreError::Conflict {
            kind: "CertRequest",
            key: "ns/r1".to_string(),
        };
        assert!(err.is_transient());
        assert!(!err.is_not_found());
    }

    #[test]
    fn forbidden_is_terminal() {
        let err = StoreError::Forbidden(AdmissionError::forbidden("no"));
        assert!(!err.is_transient());
    }
}
