//! Test doubles for exercising the orchestration core without a real
//! execution engine: a scripted distributor and an in-memory template
//! source.

use crate::domain::operation::{OperationCategory, TemplateId};
use crate::domain::status::StatusCode;
use crate::domain::step::{ActionMarker, StepBehavior, StepHandle, StepId};
use crate::domain::template::{StepTemplate, TemplateSource, WorkflowTemplate};
use crate::error::ProcessingError;
use crate::types::Parameters;
use crate::{ItemReport, StatusListener, StepDistributor, StepOutcome};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// Distributor double replaying scripted outcomes per step name.
///
/// Steps without a script complete with OK. Outcomes are consumed in order,
/// so a step can be scripted to fail once and succeed on replay. A cancel
/// marker on the step is honored before running the script, mirroring a
/// cooperative engine.
pub struct ScriptedDistributor {
    outcomes: Mutex<HashMap<String, VecDeque<StepOutcome>>>,
    delay: Option<Duration>,
    dispatched: Mutex<Vec<String>>,
}

impl ScriptedDistributor {
    /// Distributor where every step completes with OK
    pub fn all_ok() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            delay: None,
            dispatched: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long inside every dispatch, to keep a step observably
    /// in-flight for shutdown and cancellation tests
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue an outcome for the named step; consumed in FIFO order
    pub fn script(self, step_name: &str, outcome: StepOutcome) -> Self {
        self.outcomes
            .lock()
            .expect("script poisoned")
            .entry(step_name.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    /// Queue a plain severity outcome for the named step
    pub fn script_status(self, step_name: &str, status: StatusCode) -> Self {
        self.script(step_name, StepOutcome::Completed(ItemReport::of(status)))
    }

    /// Step names dispatched so far, in order
    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().expect("dispatch log poisoned").clone()
    }

    fn next_outcome(&self, step_name: &str) -> StepOutcome {
        self.outcomes
            .lock()
            .expect("script poisoned")
            .get_mut(step_name)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(StepOutcome::Completed(ItemReport::of(StatusCode::Ok)))
    }
}

#[async_trait]
impl StepDistributor for ScriptedDistributor {
    async fn run(
        &self,
        step: StepHandle,
        _params: Parameters,
        updates: Arc<dyn StatusListener>,
    ) -> StepOutcome {
        self.dispatched
            .lock()
            .expect("dispatch log poisoned")
            .push(step.name.clone());

        if step.action() == ActionMarker::Cancel {
            return StepOutcome::Cancelled;
        }
        if let Err(err) = updates.on_status_update(StatusCode::Running).await {
            return StepOutcome::Error(err.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        // Poll again after the work, like an engine checking between chunks
        if step.action() == ActionMarker::Cancel {
            return StepOutcome::Cancelled;
        }
        self.next_outcome(&step.name)
    }
}

/// Template source double holding templates in a map
#[derive(Default)]
pub struct InMemoryTemplates {
    templates: HashMap<TemplateId, WorkflowTemplate>,
}

impl InMemoryTemplates {
    /// Empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template, replacing any previous one with the same ID
    pub fn insert(&mut self, template: WorkflowTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    /// Source pre-loaded with a three-step ingest template named
    /// `DEFAULT_INGEST` (check, store, finalise)
    pub fn with_default_ingest() -> Self {
        let mut source = Self::new();
        source.insert(WorkflowTemplate {
            id: TemplateId("DEFAULT_INGEST".to_string()),
            name: "Default ingest".to_string(),
            category: OperationCategory::Ingest,
            steps: vec![
                StepTemplate {
                    id: StepId("check".to_string()),
                    name: "CHECK_SEDA".to_string(),
                    behavior: StepBehavior::Blocking,
                },
                StepTemplate {
                    id: StepId("store".to_string()),
                    name: "STORE_OBJECTS".to_string(),
                    behavior: StepBehavior::NonBlocking,
                },
                StepTemplate {
                    id: StepId("finalise".to_string()),
                    name: "FINALISE_INGEST".to_string(),
                    behavior: StepBehavior::Blocking,
                },
            ],
        });
        source
    }
}

#[async_trait]
impl TemplateSource for InMemoryTemplates {
    async fn load(&self, id: &TemplateId) -> Result<Option<WorkflowTemplate>, ProcessingError> {
        Ok(self.templates.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<TemplateId>, ProcessingError> {
        Ok(self.templates.keys().cloned().collect())
    }
}
