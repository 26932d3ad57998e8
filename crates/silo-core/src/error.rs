use thiserror::Error;

/// Core error type for the Silo orchestration runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// The requested transition is illegal from the operation's current state
    #[error("State not allowed: {0}")]
    StateNotAllowed(String),

    /// Operation not found in the live registry
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// Workflow template not found
    #[error("Workflow template not found: {0}")]
    TemplateNotFound(String),

    /// A workflow was created without steps
    #[error("Workflow has no steps: {0}")]
    EmptyWorkflow(String),

    /// Snapshot store error (tolerated everywhere but the running-marker write)
    #[error("Snapshot store error: {0}")]
    Persistence(String),

    /// The transient running marker could not be persisted; resuming this
    /// operation after a crash would risk double execution
    #[error("Running marker not persisted for operation {0}")]
    RunningMarkerNotPersisted(String),

    /// Error reported by the step distributor
    #[error("Distributor error: {0}")]
    Distributor(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    Io(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        ProcessingError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ProcessingError {
    fn from(err: std::io::Error) -> Self {
        ProcessingError::Io(err.to_string())
    }
}

impl From<String> for ProcessingError {
    fn from(err: String) -> Self {
        ProcessingError::Other(err)
    }
}

impl From<&str> for ProcessingError {
    fn from(err: &str) -> Self {
        ProcessingError::Other(err.to_string())
    }
}
