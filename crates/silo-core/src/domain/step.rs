//! Steps and their shared action markers.

use crate::domain::status::StatusCode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Value object: step ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

/// Whether a failing step halts the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepBehavior {
    /// A failure at or above KO stops the operation
    Blocking,
    /// Failures are recorded but the pipeline continues
    NonBlocking,
}

/// Cooperative action requested on a step.
///
/// The marker is shared between the state machine and the distributor: the
/// state machine escalates it mid-execution (pause, cancel) and the
/// distributor polls it at its own safe boundaries. There is no separate
/// cancellation channel that could desynchronize from persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionMarker {
    /// Neutral: execute normally
    Run,
    /// The step finished and must not be re-entered
    Complete,
    /// Stop at the next safe boundary and leave the operation paused
    Pause,
    /// Stop at the next safe boundary; the operation is being cancelled
    Cancel,
    /// The step was interrupted mid-flight; resume from its checkpoint,
    /// do not re-enter automatically
    Recover,
    /// Re-execute the step from scratch, discarding its previous outcome
    Replay,
}

impl ActionMarker {
    fn as_u8(self) -> u8 {
        match self {
            ActionMarker::Run => 0,
            ActionMarker::Complete => 1,
            ActionMarker::Pause => 2,
            ActionMarker::Cancel => 3,
            ActionMarker::Recover => 4,
            ActionMarker::Replay => 5,
        }
    }

    fn from_u8(raw: u8) -> ActionMarker {
        match raw {
            1 => ActionMarker::Complete,
            2 => ActionMarker::Pause,
            3 => ActionMarker::Cancel,
            4 => ActionMarker::Recover,
            5 => ActionMarker::Replay,
            _ => ActionMarker::Run,
        }
    }
}

impl Default for ActionMarker {
    fn default() -> Self {
        ActionMarker::Run
    }
}

/// Lock-free shared handle on a step's action marker.
///
/// Clones share the same cell, so a marker escalated by the state machine is
/// immediately visible to a distributor polling its own clone. Serializes as
/// the plain [`ActionMarker`]; deserialization creates a fresh cell.
#[derive(Debug)]
pub struct ActionFlag(Arc<AtomicU8>);

impl ActionFlag {
    /// New flag in the neutral position
    pub fn new(marker: ActionMarker) -> Self {
        Self(Arc::new(AtomicU8::new(marker.as_u8())))
    }

    /// Current marker
    pub fn get(&self) -> ActionMarker {
        ActionMarker::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Overwrite the marker
    pub fn set(&self, marker: ActionMarker) {
        self.0.store(marker.as_u8(), Ordering::SeqCst);
    }
}

impl Clone for ActionFlag {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl Default for ActionFlag {
    fn default() -> Self {
        Self::new(ActionMarker::Run)
    }
}

impl PartialEq for ActionFlag {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Serialize for ActionFlag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ActionFlag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(ActionFlag::new(ActionMarker::deserialize(deserializer)?))
    }
}

/// One stage of an operation's pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStep {
    /// Unique identifier within the workflow
    pub id: StepId,

    /// Human-readable step name
    pub name: String,

    /// Blocking or non-blocking behavior on failure
    pub behavior: StepBehavior,

    /// Elements the distributor expects to process (informational)
    pub elements_to_process: u64,

    /// Elements processed so far (informational)
    pub elements_processed: u64,

    /// This step's own severity
    pub status: StatusCode,

    /// Shared cooperative action marker
    pub action: ActionFlag,

    /// Set by the state machine when dispatching the final step
    pub is_last: bool,
}

impl OperationStep {
    /// Create a fresh, untouched step
    pub fn new(id: StepId, name: impl Into<String>, behavior: StepBehavior) -> Self {
        Self {
            id,
            name: name.into(),
            behavior,
            elements_to_process: 0,
            elements_processed: 0,
            status: StatusCode::Unknown,
            action: ActionFlag::default(),
            is_last: false,
        }
    }

    /// True when the step never started (no status, neutral marker)
    pub fn is_untouched(&self) -> bool {
        self.status == StatusCode::Unknown && self.action.get() == ActionMarker::Run
    }
}

/// View of a step handed to the distributor for one dispatch.
///
/// Carries a clone of the shared action flag, so the distributor observes
/// pause/cancel requests without holding any operation lock.
#[derive(Debug, Clone)]
pub struct StepHandle {
    /// Step identifier
    pub id: StepId,

    /// Step name
    pub name: String,

    /// Blocking or non-blocking
    pub behavior: StepBehavior,

    /// Shared action marker to poll at safe boundaries
    pub action: ActionFlag,

    /// Whether this is the final step of the workflow
    pub is_last: bool,
}

impl StepHandle {
    /// Build a handle for the given step
    pub fn for_step(step: &OperationStep) -> Self {
        Self {
            id: step.id.clone(),
            name: step.name.clone(),
            behavior: step.behavior,
            action: step.action.clone(),
            is_last: step.is_last,
        }
    }

    /// Current cooperative action requested on the step
    pub fn action(&self) -> ActionMarker {
        self.action.get()
    }
}
