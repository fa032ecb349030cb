//! Resource Store Adapters
//!
//! Implementations of the `ResourceStore` port:
//! - `kubernetes`: the live cluster through the Kubernetes API
//! - `memory`: an in-process store with optimistic concurrency, used
//!   for controller-level testing

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeStore;
pub use memory::InMemoryStore;
