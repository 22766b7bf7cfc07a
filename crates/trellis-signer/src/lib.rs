//! The Trellis signing controller: observes pending certificate requests,
//! issues short-lived workload certificates for the built-in signers, and
//! writes results back through the status subresource.

pub mod controller;
pub mod keypair;
pub mod queue;

pub use controller::{SignController, SignError, SignerStrategy, WorkloadSigner};
pub use keypair::{CaKeyPair, FileKeyPairSource, KeyPairError, KeyPairSource, StaticKeyPairSource};
pub use queue::WorkQueue;
