//! Object-store plumbing for Trellis: the store interface the core
//! consumes, an in-memory implementation with admission and strategy hooks,
//! informer-style watch caches, and the authorization and clock
//! capabilities threaded through the controllers.

pub mod admission;
pub mod authorizer;
pub mod cache;
pub mod clock;
pub mod error;
pub mod memory;
pub mod object;
pub mod principal;
pub mod strategy;

pub use admission::{
    AdmissionChain, AdmissionError, AdmissionPlugin, AdmissionRequest, Operation, Subresource,
};
pub use authorizer::{
    is_authorized_for_signer_name, AllowAll, Authorizer, PolicyAuthorizer, SIGNERS_RESOURCE,
};
pub use cache::{Cache, PodIndex, PodLookup};
pub use clock::{Clock, FakeClock, SystemClock};
pub use error::StoreError;
pub use memory::{MemoryStore, ObjectStore};
pub use object::{LabelSelector, Selector, StoredObject, WatchEvent};
pub use principal::Principal;
pub use strategy::{CertRequestStrategy, Strategy, TrustBundleStrategy};
