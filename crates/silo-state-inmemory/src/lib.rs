//! In-memory implementations of the Silo persistence ports.
//!
//! This crate provides in-memory implementations of the snapshot store and
//! workflow template source defined in the silo-core crate. It is primarily
//! useful for development, testing, and single-node deployments where
//! durable persistence is not required.

pub mod snapshot_store;
pub use snapshot_store::InMemorySnapshotStore;

pub mod template_registry;
pub use template_registry::InMemoryTemplateRegistry;
