//! Admission stages for Trellis.
//!
//! Two stages guard the persisted kinds:
//!
//! - [`BundleEntrusting`] requires the `attest` verb on a signer before a
//!   trust bundle may be published for it, and re-rejects signer changes.
//! - [`WorkloadRestriction`] binds certificate requests to live pods and to
//!   the node identity that created them, and gates status writes behind
//!   the `sign` verb.
//!
//! Stage ordering matters: the restriction mutator must run before its
//! validator (the chain guarantees this), and authorization checks precede
//! content checks inside the validator.

pub mod entrusting;
pub mod restriction;

pub use entrusting::{BundleEntrusting, ATTEST_VERB};
pub use restriction::{WorkloadRestriction, SIGN_VERB};
