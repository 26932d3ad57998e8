//!
//! Silo Core - workflow orchestration core for the Silo archiving platform
//!
//! This crate defines the workflow data model, the per-operation state
//! machine, and the process manager that drive long-running archival
//! operations (ingest, audit, traceability) through an asynchronous step
//! distributor, with pause/resume/replay/cancel semantics and crash
//! recovery from persisted snapshots alone.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use std::sync::Arc;

/// Domain layer - core business models, entities, and rules
pub mod domain;

/// Application services - state machine and process manager
pub mod application;

/// Shared value types
pub mod types;

/// Error types
pub mod error;

/// Test doubles (scripted distributor)
#[cfg(feature = "testing")]
pub mod testing;

// Re-export key types
pub use error::ProcessingError;
pub use types::{AlertLevel, Parameters, ServerIdentity};

// Re-export main API types for easy use
pub use application::cleanup::{CleanupConfig, CleanupScheduler};
pub use application::process_manager::{
    ForcedPauseScope, OperationQuery, OperationSummary, ProcessAction, ProcessManager,
    ProcessManagerConfig, RestoreReport,
};
pub use application::state_machine::StateMachine;
pub use domain::operation::{
    Operation, OperationCategory, OperationId, PauseRecover, ProcessState, TemplateId, TenantId,
};
pub use domain::repository::{AlertSink, LogAlertSink, SnapshotStore};
pub use domain::status::StatusCode;
pub use domain::step::{ActionFlag, ActionMarker, OperationStep, StepBehavior, StepHandle, StepId};
pub use domain::template::{StepTemplate, TemplateSource, WorkflowTemplate};

/// Aggregated report the distributor returns for one completed step. The
/// distributor may run many parallel workers for the elements inside a step
/// but reports a single outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    /// Aggregated terminal severity of the step
    pub status: StatusCode,

    /// Elements processed during the attempt (informational)
    pub elements_processed: u64,
}

impl ItemReport {
    /// Report with the given severity and no element accounting
    pub fn of(status: StatusCode) -> Self {
        Self {
            status,
            elements_processed: 0,
        }
    }
}

/// Terminal outcome of one step dispatch; exactly one per attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step ran to a terminal severity
    Completed(ItemReport),

    /// The step stopped in response to a cancel marker
    Cancelled,

    /// The distributor failed outright; treated as FATAL
    Error(String),
}

/// Receiver for intermediate severity updates emitted while a step runs.
/// Implemented by the state machine.
#[async_trait]
pub trait StatusListener: Send + Sync {
    /// Record an intermediate severity for the current step
    async fn on_status_update(&self, status: StatusCode) -> Result<(), ProcessingError>;
}

/// The collaborator that actually executes a step's work.
///
/// Exactly one [`StepOutcome`] is returned per dispatch. Implementations
/// must poll [`StepHandle::action`] and cooperate with `Pause`/`Cancel`
/// markers at their own safe boundaries; there is no hard interrupt.
#[async_trait]
pub trait StepDistributor: Send + Sync {
    /// Execute one step asynchronously
    async fn run(
        &self,
        step: StepHandle,
        params: Parameters,
        updates: Arc<dyn StatusListener>,
    ) -> StepOutcome;
}
