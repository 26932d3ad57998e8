//! Process manager: the registry of live operations.
//!
//! Owns a concurrency-safe map from operation ID to its state machine,
//! exposes the operator entry points (initiate, submit, query), performs
//! startup recovery from persisted snapshots, and coordinates server
//! shutdown across every in-flight operation.

use crate::application::state_machine::StateMachine;
use crate::domain::operation::{
    Operation, OperationCategory, OperationId, PauseRecover, ProcessState, TemplateId, TenantId,
};
use crate::domain::repository::{AlertSink, SnapshotStore};
use crate::domain::status::StatusCode;
use crate::domain::template::TemplateSource;
use crate::error::ProcessingError;
use crate::types::{Parameters, ServerIdentity};
use crate::StepDistributor;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};

/// Operator-requested transition submitted against a live operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAction {
    /// Run from the current step to the end
    Resume,
    /// Run exactly one step, then pause
    Next,
    /// Re-execute the current step, then pause
    Replay,
    /// Stop at the next safe boundary
    Pause,
    /// Terminate with status forced to at least KO
    Cancel,
}

/// Scope of a forced pause: matching operations have `Resume` downgraded to
/// `Next`, so they advance under operator supervision only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ForcedPauseScope {
    /// Every operation
    All,
    /// Operations of one tenant
    Tenant(TenantId),
    /// Operations of one category
    Category(OperationCategory),
    /// Operations of one category within one tenant
    CategoryForTenant(OperationCategory, TenantId),
}

impl ForcedPauseScope {
    fn matches(&self, tenant: &TenantId, category: OperationCategory) -> bool {
        match self {
            Self::All => true,
            Self::Tenant(t) => t == tenant,
            Self::Category(c) => *c == category,
            Self::CategoryForTenant(c, t) => *c == category && t == tenant,
        }
    }
}

/// Filter for listing operations; empty fields match everything
#[derive(Debug, Clone, Default)]
pub struct OperationQuery {
    /// Match a single operation ID
    pub id: Option<OperationId>,
    /// Restrict to one tenant
    pub tenant: Option<TenantId>,
    /// Match any of these lifecycle states
    pub states: Vec<ProcessState>,
    /// Match any of these aggregated severities
    pub statuses: Vec<StatusCode>,
    /// Match any of these categories
    pub categories: Vec<OperationCategory>,
    /// Restrict to one workflow template
    pub template: Option<TemplateId>,
}

impl OperationQuery {
    fn matches(&self, operation: &Operation) -> bool {
        if let Some(id) = &self.id {
            if *id != operation.operation_id {
                return false;
            }
        }
        if let Some(tenant) = &self.tenant {
            if *tenant != operation.tenant_id {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&operation.state) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&operation.status) {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&operation.category) {
            return false;
        }
        if let Some(template) = &self.template {
            if *template != operation.template_id {
                return false;
            }
        }
        true
    }
}

/// Read-only view of one operation, as returned by queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSummary {
    /// Operation ID
    pub operation_id: OperationId,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Template the operation was instantiated from
    pub template_id: TemplateId,
    /// Business category
    pub category: OperationCategory,
    /// Lifecycle state
    pub state: ProcessState,
    /// Intended end state
    pub target_state: ProcessState,
    /// Aggregated severity
    pub status: StatusCode,
    /// Why the operation is paused, if it is
    pub pause_recover: PauseRecover,
    /// Whether the operation advances one step per Resume/Next
    pub step_by_step: bool,
    /// Name of the most recently started step, if any started
    pub current_step: Option<String>,
    /// When the operation was initiated
    pub created_at: DateTime<Utc>,
    /// When the operation reached COMPLETED
    pub completed_at: Option<DateTime<Utc>>,
}

impl OperationSummary {
    fn from_operation(operation: &Operation) -> Self {
        let current_step = operation
            .steps
            .iter()
            .rev()
            .find(|step| !step.is_untouched())
            .map(|step| step.name.clone());
        Self {
            operation_id: operation.operation_id.clone(),
            tenant_id: operation.tenant_id.clone(),
            template_id: operation.template_id.clone(),
            category: operation.category,
            state: operation.state,
            target_state: operation.target_state,
            status: operation.status,
            pause_recover: operation.pause_recover,
            step_by_step: operation.step_by_step,
            current_step,
            created_at: operation.created_at,
            completed_at: operation.completed_at,
        }
    }
}

/// Outcome of a startup recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Operations re-registered (any state)
    pub registered: usize,
    /// Operations auto-resumed (paused for the previous shutdown)
    pub resumed: usize,
    /// Operations whose in-flight status could not be trusted
    pub marked_failed: usize,
}

/// Process manager configuration
#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    /// Identity this server persists snapshots under
    pub server: ServerIdentity,

    /// Bound on the per-operation shutdown wait
    pub shutdown_grace: Duration,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            server: ServerIdentity::new("silo-processing"),
            shutdown_grace: super::state_machine::DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Registry of live operations and the operator-facing entry points
pub struct ProcessManager {
    config: ProcessManagerConfig,
    machines: DashMap<String, Arc<StateMachine>>,
    distributor: Arc<dyn StepDistributor>,
    store: Arc<dyn SnapshotStore>,
    templates: Arc<dyn TemplateSource>,
    alerts: Arc<dyn AlertSink>,
    forced_pauses: RwLock<HashSet<ForcedPauseScope>>,
}

impl ProcessManager {
    /// Create a manager with an empty registry
    pub fn new(
        config: ProcessManagerConfig,
        distributor: Arc<dyn StepDistributor>,
        store: Arc<dyn SnapshotStore>,
        templates: Arc<dyn TemplateSource>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            machines: DashMap::new(),
            distributor,
            store,
            templates,
            alerts,
            forced_pauses: RwLock::new(HashSet::new()),
        }
    }

    /// Instantiate an operation from a workflow template, persist it, and
    /// register it. The operation starts in PAUSE; a follow-up
    /// [`ProcessAction::Resume`] or [`ProcessAction::Next`] starts execution.
    pub async fn initiate_operation(
        &self,
        tenant: TenantId,
        template_id: &TemplateId,
        parameters: Parameters,
    ) -> Result<OperationSummary, ProcessingError> {
        let template = self
            .templates
            .load(template_id)
            .await?
            .ok_or_else(|| ProcessingError::TemplateNotFound(template_id.0.clone()))?;

        let operation =
            template.instantiate(OperationId::generate(), tenant, parameters)?;
        self.store.save(&self.config.server, &operation).await?;

        let summary = OperationSummary::from_operation(&operation);
        let machine = self.build_machine(operation)?;
        self.machines
            .insert(summary.operation_id.0.clone(), machine);
        info!(
            operation_id = %summary.operation_id,
            template = %template_id.0,
            "operation initiated"
        );
        Ok(summary)
    }

    /// Forward an operator action to the operation's state machine. Keyed by
    /// `(operationId, tenantId)`: a tenant mismatch is indistinguishable
    /// from an unknown operation. Terminal operations reject every action
    /// without mutating anything.
    pub async fn submit(
        &self,
        operation_id: &OperationId,
        tenant: &TenantId,
        action: ProcessAction,
        parameters: Parameters,
    ) -> Result<OperationSummary, ProcessingError> {
        let machine = self.lookup(operation_id, tenant)?;
        if machine.is_done().await {
            return Err(ProcessingError::StateNotAllowed(format!(
                "operation {} is already completed",
                operation_id
            )));
        }

        let action = self.apply_forced_pause(&machine, action);
        match action {
            ProcessAction::Resume => machine.resume(parameters).await?,
            ProcessAction::Next => machine.next(parameters).await?,
            ProcessAction::Replay => machine.replay(parameters).await?,
            ProcessAction::Pause => machine.pause().await?,
            ProcessAction::Cancel => machine.cancel().await?,
        }
        Ok(OperationSummary::from_operation(&machine.snapshot().await))
    }

    /// Pause one operation; shorthand for [`Self::submit`] with
    /// [`ProcessAction::Pause`]
    pub async fn pause(
        &self,
        operation_id: &OperationId,
        tenant: &TenantId,
    ) -> Result<OperationSummary, ProcessingError> {
        self.submit(operation_id, tenant, ProcessAction::Pause, Parameters::new())
            .await
    }

    /// Cancel one operation; shorthand for [`Self::submit`] with
    /// [`ProcessAction::Cancel`]
    pub async fn cancel(
        &self,
        operation_id: &OperationId,
        tenant: &TenantId,
    ) -> Result<OperationSummary, ProcessingError> {
        self.submit(operation_id, tenant, ProcessAction::Cancel, Parameters::new())
            .await
    }

    /// Current view of one operation
    pub async fn get_operation(
        &self,
        operation_id: &OperationId,
        tenant: &TenantId,
    ) -> Result<OperationSummary, ProcessingError> {
        let machine = self.lookup(operation_id, tenant)?;
        Ok(OperationSummary::from_operation(&machine.snapshot().await))
    }

    /// List operations matching the query
    pub async fn list_operations(&self, query: &OperationQuery) -> Vec<OperationSummary> {
        let mut result = Vec::new();
        let machines: Vec<Arc<StateMachine>> = self
            .machines
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for machine in machines {
            let operation = machine.snapshot().await;
            if query.matches(&operation) {
                result.push(OperationSummary::from_operation(&operation));
            }
        }
        result
    }

    /// Number of registered operations
    pub fn operation_count(&self) -> usize {
        self.machines.len()
    }

    // ---- forced pause ----------------------------------------------------

    /// Register a forced-pause scope. Matching operations keep accepting
    /// `Next` but have `Resume` downgraded to `Next`.
    pub fn force_pause(&self, scope: ForcedPauseScope) {
        self.forced_pauses
            .write()
            .expect("forced pause registry poisoned")
            .insert(scope);
    }

    /// Remove a previously registered forced-pause scope
    pub fn lift_forced_pause(&self, scope: &ForcedPauseScope) {
        self.forced_pauses
            .write()
            .expect("forced pause registry poisoned")
            .remove(scope);
    }

    fn apply_forced_pause(&self, machine: &StateMachine, action: ProcessAction) -> ProcessAction {
        if action != ProcessAction::Resume {
            return action;
        }
        let scopes = self
            .forced_pauses
            .read()
            .expect("forced pause registry poisoned");
        let forced = scopes
            .iter()
            .any(|scope| scope.matches(machine.tenant_id(), machine.category()));
        if forced {
            info!(
                operation_id = %machine.operation_id(),
                "forced pause active, resume downgraded to next"
            );
            ProcessAction::Next
        } else {
            action
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Startup recovery: reload every snapshot persisted under this server's
    /// identity. Operations paused for the previous shutdown are rebuilt and
    /// resumed unattended; completed ones are re-registered so they stay
    /// queryable until cleanup; every other non-terminal snapshot cannot be
    /// trusted after an unmanaged crash and is marked failed.
    pub async fn restore_operations(&self) -> Result<RestoreReport, ProcessingError> {
        let snapshots = self.store.load_all(&self.config.server).await?;
        let mut report = RestoreReport::default();

        for (operation_id, mut operation) in snapshots {
            if operation.state.is_terminal() {
                if operation.state == ProcessState::Completed {
                    let machine = self.build_machine(operation)?;
                    self.machines.insert(operation_id.0.clone(), machine);
                    report.registered += 1;
                }
                continue;
            }

            if operation.pause_recover == PauseRecover::ServerPause {
                let step_by_step = operation.step_by_step;
                let parameters = operation.parameters.clone();
                let machine = self.build_machine(operation)?;
                self.machines
                    .insert(operation_id.0.clone(), Arc::clone(&machine));
                report.registered += 1;

                let result = if step_by_step {
                    machine.next(parameters).await
                } else {
                    machine.resume(parameters).await
                };
                match result {
                    Ok(()) => report.resumed += 1,
                    Err(err) => warn!(
                        operation_id = %operation_id,
                        %err,
                        "auto-resume after restart failed"
                    ),
                }
                continue;
            }

            operation.state = ProcessState::Failed;
            operation.status = StatusCode::Unknown;
            self.store.save(&self.config.server, &operation).await?;
            report.marked_failed += 1;
            warn!(
                operation_id = %operation_id,
                "non-recoverable snapshot found at startup, marked failed"
            );
        }

        info!(
            registered = report.registered,
            resumed = report.resumed,
            marked_failed = report.marked_failed,
            "startup recovery finished"
        );
        Ok(report)
    }

    /// Pause every running operation for server shutdown, waiting (bounded,
    /// per operation) until each reaches a safe boundary.
    pub async fn shutdown_all(&self) {
        let machines: Vec<Arc<StateMachine>> = self
            .machines
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(operations = machines.len(), "pausing operations for shutdown");
        futures::future::join_all(machines.iter().map(|machine| machine.shutdown())).await;
    }

    /// Drop a completed operation from the registry and delete its snapshot.
    /// Returns false when the operation is unknown or not yet terminal.
    pub async fn evict(&self, operation_id: &OperationId) -> Result<bool, ProcessingError> {
        let machine = match self.machines.get(&operation_id.0) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Ok(false),
        };
        if !machine.is_done().await {
            return Ok(false);
        }
        self.machines.remove(&operation_id.0);
        self.store.delete(&self.config.server, operation_id).await?;
        info!(operation_id = %operation_id, "completed operation evicted");
        Ok(true)
    }

    fn lookup(
        &self,
        operation_id: &OperationId,
        tenant: &TenantId,
    ) -> Result<Arc<StateMachine>, ProcessingError> {
        let machine = self
            .machines
            .get(&operation_id.0)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ProcessingError::OperationNotFound(operation_id.0.clone()))?;
        if machine.tenant_id() != tenant {
            return Err(ProcessingError::OperationNotFound(operation_id.0.clone()));
        }
        Ok(machine)
    }

    fn build_machine(&self, operation: Operation) -> Result<Arc<StateMachine>, ProcessingError> {
        StateMachine::new(
            operation,
            Arc::clone(&self.distributor),
            Arc::clone(&self.store),
            Arc::clone(&self.alerts),
            self.config.server.clone(),
            self.config.shutdown_grace,
        )
    }
}
