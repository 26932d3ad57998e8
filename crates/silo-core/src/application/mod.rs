//! Application services: the per-operation state machine, the process
//! manager that owns the live-operation registry, and the cleanup
//! scheduler that evicts aged completed operations.

/// Retention-based eviction of completed operations
pub mod cleanup;

/// Registry of live operations and operator entry points
pub mod process_manager;

/// Per-operation state machine
pub mod state_machine;
