//! Admission framework: pluggable mutation/validation stages run by the
//! object store before any write is persisted.
//!
//! Each stage is a pair of optional pure functions over the object under
//! admission plus read-only cache snapshots. The chain composes stages
//! deterministically: every mutator runs in registration order, then every
//! validator.

use std::sync::Arc;

use thiserror::Error;

use crate::principal::Principal;

/// The store verb an admission call is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Object creation.
    Create,
    /// Object update (main resource or a subresource).
    Update,
}

/// The subresource targeted by a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subresource {
    /// The main resource.
    Main,
    /// The status subresource.
    Status,
}

/// Context for one admission call.
#[derive(Clone, Debug)]
pub struct AdmissionRequest {
    /// The verb being admitted.
    pub operation: Operation,
    /// The subresource being written.
    pub subresource: Subresource,
    /// The authenticated principal making the request.
    pub principal: Principal,
}

impl AdmissionRequest {
    /// Context for a create of the main resource.
    pub fn create(principal: Principal) -> Self {
        Self {
            operation: Operation::Create,
            subresource: Subresource::Main,
            principal,
        }
    }

    /// Context for an update of the main resource.
    pub fn update(principal: Principal) -> Self {
        Self {
            operation: Operation::Update,
            subresource: Subresource::Main,
            principal,
        }
    }

    /// Context for a status-subresource update.
    pub fn update_status(principal: Principal) -> Self {
        Self {
            operation: Operation::Update,
            subresource: Subresource::Status,
            principal,
        }
    }
}

/// A policy denial from an admission stage. Surfaced to the caller verbatim;
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("forbidden: {message}")]
pub struct AdmissionError {
    /// Human-readable reason for the denial.
    pub message: String,
}

impl AdmissionError {
    /// A denial with the given reason.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One admission stage for objects of kind `T`.
///
/// Both hooks default to pass-through; a stage overrides the ones it needs.
pub trait AdmissionPlugin<T>: Send + Sync {
    /// Mutate the incoming object. Runs before any validator.
    fn mutate(
        &self,
        req: &AdmissionRequest,
        new: &mut T,
        old: Option<&T>,
    ) -> Result<(), AdmissionError> {
        let _ = (req, new, old);
        Ok(())
    }

    /// Validate the (already mutated) incoming object.
    fn validate(
        &self,
        req: &AdmissionRequest,
        new: &T,
        old: Option<&T>,
    ) -> Result<(), AdmissionError> {
        let _ = (req, new, old);
        Ok(())
    }
}

/// An ordered chain of admission stages for kind `T`.
pub struct AdmissionChain<T> {
    plugins: Vec<Arc<dyn AdmissionPlugin<T>>>,
}

impl<T> Default for AdmissionChain<T> {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }
}

impl<T> AdmissionChain<T> {
    /// An empty chain (admits everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Stages run in registration order.
    pub fn register(mut self, plugin: Arc<dyn AdmissionPlugin<T>>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Run every mutator, then every validator.
    pub fn admit(
        &self,
        req: &AdmissionRequest,
        new: &mut T,
        old: Option<&T>,
    ) -> Result<(), AdmissionError> {
        for plugin in &self.plugins {
            plugin.mutate(req, new, old)?;
        }
        for plugin in &self.plugins {
            plugin.validate(req, new, old)?;
        }
        Ok(())
    }
}
