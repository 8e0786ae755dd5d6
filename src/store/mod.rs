//! Resource Store Adapters
//!
//! Implementations of the [`ResourceStore`](crate::domain::ports::ResourceStore)
//! port: the Kubernetes API for production and an in-memory map for
//! standalone runs and tests.

pub mod cluster;
pub mod memory;

pub use cluster::KubeStore;
pub use memory::MemoryStore;
