//! Structured field-path validation errors.
//!
//! Validation failures name the offending field (e.g. `spec.signerName`) so
//! callers can correlate a rejection to the input that caused it.

use std::fmt;

/// A single validation failure, anchored to the field that caused it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct FieldError {
    /// Dotted path of the offending field (e.g. `spec.trustBundle`).
    pub field: String,
    /// Human-readable description of what is wrong.
    pub message: String,
}

impl FieldError {
    /// An invalid-value error for the given field.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// A required-field error.
    pub fn required(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: "is required".to_string(),
        }
    }

    /// A forbidden-mutation error.
    pub fn forbidden(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// An accumulated list of [`FieldError`]s from one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
}

impl ValidationErrors {
    /// An empty error list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one error.
    pub fn push(&mut self, err: FieldError) {
        self.errors.push(err);
    }

    /// Append every error from another list.
    pub fn extend(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    /// Whether no errors were recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// The recorded errors.
    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    /// `Ok(())` when empty, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", rendered.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl From<FieldError> for ValidationErrors {
    fn from(err: FieldError) -> Self {
        Self { errors: vec![err] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_errors() {
        let mut errs = ValidationErrors::new();
        errs.push(FieldError::required("spec.signerName"));
        errs.push(FieldError::invalid("metadata.name", "bad name"));
        assert_eq!(
            errs.to_string(),
            "spec.signerName: is required; metadata.name: bad name"
        );
    }

    #[test]
    fn into_result_roundtrip() {
        assert!(ValidationErrors::new().into_result().is_ok());

        let errs: ValidationErrors = FieldError::required("spec.pod").into();
        assert!(errs.into_result().is_err());
    }
}
