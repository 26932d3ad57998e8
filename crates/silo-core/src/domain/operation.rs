//! The operation aggregate: one archival job instance and its pipeline.

use crate::domain::status::StatusCode;
use crate::domain::step::{OperationStep, StepId};
use crate::error::ProcessingError;
use crate::types::Parameters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value object: operation ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    /// Generate a fresh operation ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value object: tenant ID (logical namespace of an archival organization)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub u32);

/// Value object: workflow template ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub String);

/// Lifecycle state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// A step is executing or about to execute
    Running,
    /// Suspended; resumable through the legal transitions
    Pause,
    /// Finalized; no further transitions
    Completed,
    /// Terminal state applied only by crash recovery when a snapshot's
    /// in-flight status cannot be trusted; accepts no transitions
    Failed,
}

impl ProcessState {
    /// Validate a requested transition against the legality table.
    ///
    /// Resume/Next/Replay request `Running` (legal from `Pause`),
    /// Pause/Shutdown request `Pause` (legal from `Running`), Cancel
    /// requests `Completed` (legal from `Running` or `Pause`). Anything
    /// else is rejected before any mutation.
    pub fn eval_transition(self, requested: ProcessState) -> Result<(), ProcessingError> {
        let legal = matches!(
            (self, requested),
            (ProcessState::Pause, ProcessState::Running)
                | (ProcessState::Running, ProcessState::Pause)
                | (ProcessState::Running, ProcessState::Completed)
                | (ProcessState::Pause, ProcessState::Completed)
        );
        if legal {
            Ok(())
        } else {
            Err(ProcessingError::StateNotAllowed(format!(
                "cannot request {:?} from {:?}",
                requested, self
            )))
        }
    }

    /// True for states that accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Completed | ProcessState::Failed)
    }
}

/// Why an operation is paused; disambiguates operator pauses (resumable on
/// demand) from server-shutdown pauses (auto-resumed at next startup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseRecover {
    /// Not paused for recovery
    None,
    /// Operator-requested pause, or a FATAL outcome awaiting inspection
    ApiPause,
    /// Paused by the server lifecycle; resumed unattended at next startup
    ServerPause,
}

impl Default for PauseRecover {
    fn default() -> Self {
        PauseRecover::None
    }
}

/// Business category of an operation; used only to select cleanup behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationCategory {
    /// Archival package ingest
    Ingest,
    /// Audit of stored holdings
    Audit,
    /// Traceability / secured-log operations
    Traceability,
    /// Referential and master-data updates
    MasterData,
    /// Anything else
    Other,
}

/// Aggregate: one archival job instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique identifier
    pub operation_id: OperationId,

    /// Owning tenant
    pub tenant_id: TenantId,

    /// Template this operation was instantiated from
    pub template_id: TemplateId,

    /// Security/context identifier propagated from the caller
    pub context_id: Option<String>,

    /// Business category (cleanup behavior selector)
    pub category: OperationCategory,

    /// Ordered pipeline; never empty, fixed at creation
    pub steps: Vec<OperationStep>,

    /// Current lifecycle state
    pub state: ProcessState,

    /// State the distributor should converge to
    pub target_state: ProcessState,

    /// Aggregated severity seen so far
    pub status: StatusCode,

    /// Override applied at finalization (e.g. forced KO on cancel)
    pub target_status: Option<StatusCode>,

    /// Why the operation is paused, if it is
    pub pause_recover: PauseRecover,

    /// True when the operation advances one step per Resume/Next
    pub step_by_step: bool,

    /// Free-form parameters handed to the distributor
    pub parameters: Parameters,

    /// Set exactly once, on reaching `Completed`
    pub completed_at: Option<DateTime<Utc>>,

    /// Descriptive metadata: message identifier of the originating request
    pub message_identifier: Option<String>,

    /// Descriptive metadata: producer service
    pub producer_service: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Operation {
    /// Create a new operation over the given (non-empty) pipeline. The
    /// operation starts paused; the caller submits Resume/Next to start it.
    pub fn new(
        operation_id: OperationId,
        tenant_id: TenantId,
        template_id: TemplateId,
        category: OperationCategory,
        steps: Vec<OperationStep>,
        parameters: Parameters,
    ) -> Result<Self, ProcessingError> {
        if steps.is_empty() {
            return Err(ProcessingError::EmptyWorkflow(operation_id.0));
        }
        Ok(Self {
            operation_id,
            tenant_id,
            template_id,
            context_id: None,
            category,
            steps,
            state: ProcessState::Pause,
            target_state: ProcessState::Pause,
            status: StatusCode::Unknown,
            target_status: None,
            pause_recover: PauseRecover::None,
            step_by_step: false,
            parameters,
            completed_at: None,
            message_identifier: None,
            producer_service: None,
            created_at: Utc::now(),
        })
    }

    /// Index of the final step
    pub fn last_index(&self) -> usize {
        self.steps.len() - 1
    }

    /// Flag `index` as the final dispatch target, clearing the flag
    /// everywhere else so exactly one step carries it.
    pub fn flag_last(&mut self, index: usize) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.is_last = i == index;
        }
    }

    /// Record completion. Sets `completed_at` exactly once; a second call
    /// reports whether the operation was already finalized.
    pub fn mark_completed(&mut self) -> bool {
        if self.completed_at.is_some() {
            return false;
        }
        self.state = ProcessState::Completed;
        self.target_state = ProcessState::Completed;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Find a step by ID
    pub fn step(&self, id: &StepId) -> Option<&OperationStep> {
        self.steps.iter().find(|s| &s.id == id)
    }
}
