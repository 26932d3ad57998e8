//! In-memory workflow template registry with tolerant bulk loading.

use async_trait::async_trait;
use silo_core::domain::template::{TemplateSource, WorkflowTemplate};
use silo_core::{ProcessingError, TemplateId};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// In-memory implementation of the workflow template source.
///
/// Templates are registered individually or loaded in bulk from a JSON
/// array. A malformed definition is logged and skipped without aborting the
/// load of the remaining templates, so one bad file never takes down the
/// whole catalogue. `reload` replaces the catalogue atomically.
pub struct InMemoryTemplateRegistry {
    templates: RwLock<HashMap<TemplateId, WorkflowTemplate>>,
}

impl InMemoryTemplateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Register one template, replacing any previous one with the same ID
    pub async fn register(&self, template: WorkflowTemplate) -> Result<(), ProcessingError> {
        if template.steps.is_empty() {
            return Err(ProcessingError::EmptyWorkflow(template.id.0.clone()));
        }
        self.templates
            .write()
            .await
            .insert(template.id.clone(), template);
        Ok(())
    }

    /// Load templates from a JSON array of definitions. Malformed or empty
    /// definitions are skipped with a warning; returns the number of
    /// templates actually registered.
    pub async fn load_definitions(&self, json: &str) -> Result<usize, ProcessingError> {
        let entries: Vec<serde_json::Value> = serde_json::from_str(json)?;
        let mut registered = 0;
        let mut templates = self.templates.write().await;

        for entry in entries {
            let template: WorkflowTemplate = match serde_json::from_value(entry.clone()) {
                Ok(template) => template,
                Err(err) => {
                    warn!(%err, "skipping malformed workflow template definition");
                    continue;
                }
            };
            if template.steps.is_empty() {
                warn!(template = %template.id.0, "skipping workflow template with no steps");
                continue;
            }
            templates.insert(template.id.clone(), template);
            registered += 1;
        }
        info!(registered, "workflow templates loaded");
        Ok(registered)
    }

    /// Replace the whole catalogue with the definitions in `json`
    pub async fn reload(&self, json: &str) -> Result<usize, ProcessingError> {
        self.templates.write().await.clear();
        self.load_definitions(json).await
    }

    /// Number of registered templates
    pub async fn len(&self) -> usize {
        self.templates.read().await.len()
    }

    /// True when no template is registered
    pub async fn is_empty(&self) -> bool {
        self.templates.read().await.is_empty()
    }
}

impl Default for InMemoryTemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemplateSource for InMemoryTemplateRegistry {
    async fn load(&self, id: &TemplateId) -> Result<Option<WorkflowTemplate>, ProcessingError> {
        Ok(self.templates.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<TemplateId>, ProcessingError> {
        Ok(self.templates.read().await.keys().cloned().collect())
    }
}
