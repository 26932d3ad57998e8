//! Workflow templates: ordered step descriptors instantiated per operation.

use crate::domain::operation::{
    Operation, OperationCategory, OperationId, TemplateId, TenantId,
};
use crate::domain::step::{OperationStep, StepBehavior, StepId};
use crate::error::ProcessingError;
use crate::types::Parameters;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Descriptor of one step within a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    /// Step identifier, unique within the template
    pub id: StepId,

    /// Human-readable name
    pub name: String,

    /// Blocking or non-blocking behavior on failure
    pub behavior: StepBehavior,
}

/// An ordered list of step descriptors, loaded by ID and deep-copied into
/// every operation so concurrent operations never share step objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Template identifier
    pub id: TemplateId,

    /// Display name
    pub name: String,

    /// Business category stamped on instantiated operations
    pub category: OperationCategory,

    /// Ordered step descriptors; must not be empty
    pub steps: Vec<StepTemplate>,
}

impl WorkflowTemplate {
    /// Instantiate a fresh operation from this template. Every step gets its
    /// own action flag, so pause/cancel markers on one operation can never
    /// leak into another.
    pub fn instantiate(
        &self,
        operation_id: OperationId,
        tenant_id: TenantId,
        parameters: Parameters,
    ) -> Result<Operation, ProcessingError> {
        let steps = self
            .steps
            .iter()
            .map(|descriptor| {
                OperationStep::new(
                    descriptor.id.clone(),
                    descriptor.name.clone(),
                    descriptor.behavior,
                )
            })
            .collect();
        Operation::new(
            operation_id,
            tenant_id,
            self.id.clone(),
            self.category,
            steps,
            parameters,
        )
    }
}

/// Source of workflow templates, consumed once per initiated operation
#[async_trait]
pub trait TemplateSource: Send + Sync {
    /// Load a template by ID
    async fn load(&self, id: &TemplateId) -> Result<Option<WorkflowTemplate>, ProcessingError>;

    /// List the known template IDs
    async fn list(&self) -> Result<Vec<TemplateId>, ProcessingError>;
}
