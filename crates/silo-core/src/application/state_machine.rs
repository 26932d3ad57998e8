//! Per-operation state machine.
//!
//! One instance owns each in-flight operation: it computes the recovery
//! point at construction, validates and applies operator transitions
//! (resume/next/replay/pause/shutdown/cancel), dispatches steps to the
//! distributor, and reacts to the distributor's terminal callbacks. Every
//! mutating entry point is serialized on a single per-operation lock, so
//! operator calls never race distributor callbacks.

use crate::domain::operation::{
    Operation, OperationCategory, OperationId, PauseRecover, ProcessState, TenantId,
};
use crate::domain::repository::{AlertSink, SnapshotStore};
use crate::domain::status::StatusCode;
use crate::domain::step::{ActionMarker, StepHandle};
use crate::error::ProcessingError;
use crate::types::{AlertLevel, Parameters, ServerIdentity};
use crate::{ItemReport, StatusListener, StepDistributor, StepOutcome};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Default bound on the shutdown completion wait
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

struct Inner {
    operation: Operation,

    /// Index of the step being (or about to be) executed
    cursor: usize,

    /// Single-fire signals released when the operation reaches PAUSE or
    /// COMPLETED; one per pending `shutdown` call
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

/// Controller for one in-flight operation
pub struct StateMachine {
    operation_id: OperationId,
    tenant_id: TenantId,
    category: OperationCategory,
    /// Handle on the owning Arc, needed to hand the machine to driver tasks
    this: Weak<StateMachine>,
    inner: Mutex<Inner>,
    distributor: Arc<dyn StepDistributor>,
    store: Arc<dyn SnapshotStore>,
    alerts: Arc<dyn AlertSink>,
    server: ServerIdentity,
    shutdown_grace: Duration,
}

impl StateMachine {
    /// Build a state machine over an operation, either brand new or
    /// reconstructed from a persisted snapshot. The recovery point is
    /// computed here, from the persisted step statuses alone.
    pub fn new(
        mut operation: Operation,
        distributor: Arc<dyn StepDistributor>,
        store: Arc<dyn SnapshotStore>,
        alerts: Arc<dyn AlertSink>,
        server: ServerIdentity,
        shutdown_grace: Duration,
    ) -> Result<Arc<Self>, ProcessingError> {
        if operation.steps.is_empty() {
            return Err(ProcessingError::EmptyWorkflow(operation.operation_id.0));
        }
        operation.flag_last(operation.last_index());
        let cursor = Self::recovery_point(&mut operation);
        debug!(
            operation_id = %operation.operation_id,
            cursor,
            "state machine constructed"
        );
        Ok(Arc::new_cyclic(|this| Self {
            operation_id: operation.operation_id.clone(),
            tenant_id: operation.tenant_id.clone(),
            category: operation.category,
            this: this.clone(),
            inner: Mutex::new(Inner {
                operation,
                cursor,
                shutdown_waiters: Vec::new(),
            }),
            distributor,
            store,
            alerts,
            server,
            shutdown_grace,
        }))
    }

    /// Deterministic resume point from persisted data alone.
    ///
    /// A pending cancel forces finalization; an interrupted step (transient
    /// RUNNING or FATAL) is marked for recovery and must not be re-entered
    /// automatically; a blocking failure at/above KO jumps to the final
    /// step; completed steps are skipped. A step that never started ends
    /// the scan untouched.
    fn recovery_point(operation: &mut Operation) -> usize {
        let last = operation.last_index();

        if operation
            .steps
            .iter()
            .any(|s| s.action.get() == ActionMarker::Cancel)
        {
            return last;
        }

        for index in 0..operation.steps.len() {
            let step = &operation.steps[index];
            let marker = step.action.get();

            if step.status == StatusCode::Running || step.status == StatusCode::Fatal {
                step.action.set(ActionMarker::Recover);
                return index;
            }
            if step.behavior == crate::domain::step::StepBehavior::Blocking
                && step.status.at_least(StatusCode::Ko)
                && index != last
            {
                return last;
            }
            if marker == ActionMarker::Complete {
                if index == last {
                    return last;
                }
                continue;
            }
            if marker == ActionMarker::Pause {
                step.action.set(ActionMarker::Recover);
                return index;
            }
            if step.is_untouched() {
                return index;
            }
            // Started (terminal status recorded) but never marked complete
            step.action.set(ActionMarker::Recover);
            return index;
        }
        last
    }

    /// Operation ID owned by this machine
    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    /// Owning tenant
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Business category of the owned operation
    pub fn category(&self) -> OperationCategory {
        self.category
    }

    /// Clone of the current operation state
    pub async fn snapshot(&self) -> Operation {
        self.inner.lock().await.operation.clone()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ProcessState {
        self.inner.lock().await.operation.state
    }

    /// True once the operation reached a terminal state
    pub async fn is_done(&self) -> bool {
        self.inner.lock().await.operation.state.is_terminal()
    }

    /// True when the operation advances one step per Resume/Next
    pub async fn is_step_by_step(&self) -> bool {
        self.inner.lock().await.operation.step_by_step
    }

    /// Why the operation is paused, if it is
    pub async fn pause_recover(&self) -> PauseRecover {
        self.inner.lock().await.operation.pause_recover
    }

    // ---- operator-driven transitions ------------------------------------

    /// PAUSE -> RUNNING; execute from the current step to the end
    pub async fn resume(&self, params: Parameters) -> Result<(), ProcessingError> {
        let mut inner = self.inner.lock().await;
        inner
            .operation
            .state
            .eval_transition(ProcessState::Running)?;
        self.do_running(&mut inner, params, ProcessState::Running)
            .await
    }

    /// PAUSE -> RUNNING for exactly one step, then back to PAUSE
    pub async fn next(&self, params: Parameters) -> Result<(), ProcessingError> {
        let mut inner = self.inner.lock().await;
        inner
            .operation
            .state
            .eval_transition(ProcessState::Running)?;
        self.do_running(&mut inner, params, ProcessState::Pause)
            .await
    }

    /// Re-execute the current step from scratch, discarding its previous
    /// (typically FATAL) outcome, then pause for inspection.
    pub async fn replay(&self, params: Parameters) -> Result<(), ProcessingError> {
        let mut inner = self.inner.lock().await;
        inner
            .operation
            .state
            .eval_transition(ProcessState::Running)?;

        let cursor = inner.cursor;
        inner.operation.steps[cursor].action.set(ActionMarker::Replay);
        self.do_running(&mut inner, params, ProcessState::Pause)
            .await
    }

    async fn do_running(
        &self,
        inner: &mut Inner,
        params: Parameters,
        target: ProcessState,
    ) -> Result<(), ProcessingError> {
        inner.operation.parameters.merge(&params);
        inner.operation.state = ProcessState::Running;
        inner.operation.target_state = target;
        inner.operation.step_by_step = target == ProcessState::Pause;
        inner.operation.pause_recover = PauseRecover::None;
        self.dispatch(inner).await
    }

    /// RUNNING -> PAUSE at the next safe boundary. The intent is persisted
    /// before returning; the transition completes when the current step
    /// reports back.
    pub async fn pause(&self) -> Result<(), ProcessingError> {
        let mut inner = self.inner.lock().await;
        inner.operation.state.eval_transition(ProcessState::Pause)?;
        self.request_pause(&mut inner, PauseRecover::ApiPause).await;
        Ok(())
    }

    /// Pause for server shutdown and wait (bounded) until the operation
    /// actually reaches PAUSE, so the server does not exit mid-step.
    pub async fn shutdown(&self) {
        let waiter = {
            let mut inner = self.inner.lock().await;
            if inner.operation.state != ProcessState::Running {
                None
            } else {
                self.request_pause(&mut inner, PauseRecover::ServerPause)
                    .await;
                let (tx, rx) = oneshot::channel();
                inner.shutdown_waiters.push(tx);
                Some(rx)
            }
        };

        if let Some(rx) = waiter {
            match tokio::time::timeout(self.shutdown_grace, rx).await {
                Ok(_) => {
                    info!(operation_id = %self.operation_id, "operation paused for shutdown")
                }
                Err(_) => self.alerts.alert(
                    AlertLevel::Warning,
                    &format!(
                        "operation {} did not reach PAUSE within {:?}; shutting down anyway",
                        self.operation_id, self.shutdown_grace
                    ),
                ),
            }
        }
    }

    async fn request_pause(&self, inner: &mut Inner, reason: PauseRecover) {
        let cursor = inner.cursor;
        let last = inner.operation.last_index();
        if cursor == last {
            // Nothing after the final step to pause in front of; let it finish
            inner.operation.target_state = ProcessState::Completed;
        } else {
            inner.operation.target_state = ProcessState::Pause;
            inner.operation.pause_recover = reason;
            let marker = inner.operation.steps[cursor].action.get();
            if marker != ActionMarker::Complete && marker != ActionMarker::Cancel {
                inner.operation.steps[cursor].action.set(ActionMarker::Pause);
            }
        }
        self.persist_tolerant(inner).await;
    }

    /// RUNNING or PAUSE -> COMPLETED with status forced to at least KO.
    /// Cooperative while a step is executing; immediate when paused.
    pub async fn cancel(&self) -> Result<(), ProcessingError> {
        let mut inner = self.inner.lock().await;
        inner
            .operation
            .state
            .eval_transition(ProcessState::Completed)?;

        let never_started = inner.operation.status == StatusCode::Unknown;
        inner.operation.target_state = ProcessState::Completed;
        inner.operation.target_status = Some(StatusCode::Ko);
        inner.operation.status = inner.operation.status.merge(StatusCode::Ko);
        self.persist_tolerant(&mut inner).await;

        let cursor = inner.cursor;
        let last = inner.operation.last_index();
        match inner.operation.state {
            ProcessState::Running => {
                if cursor != last {
                    inner.operation.steps[cursor].action.set(ActionMarker::Cancel);
                }
                // On the last step finalization happens naturally
                Ok(())
            }
            ProcessState::Pause => {
                if never_started {
                    self.finalize(&mut inner).await;
                    Ok(())
                } else {
                    inner.operation.state = ProcessState::Running;
                    inner.cursor = last;
                    self.dispatch(&mut inner).await
                }
            }
            _ => Ok(()),
        }
    }

    // ---- dispatch and callbacks -----------------------------------------

    /// Stamp the cursor step RUNNING, persist, and hand it to the
    /// distributor on a fresh task. Failing to persist the RUNNING stamp is
    /// the one persistence failure that escalates: without a durable
    /// "this step is executing" record, a crash could double-execute it.
    fn dispatch<'a>(
        &'a self,
        inner: &'a mut Inner,
    ) -> futures::future::BoxFuture<'a, Result<(), ProcessingError>> {
        Box::pin(self.dispatch_inner(inner))
    }

    async fn dispatch_inner(&self, inner: &mut Inner) -> Result<(), ProcessingError> {
        let cursor = inner.cursor;
        let step = &mut inner.operation.steps[cursor];
        step.status = StatusCode::Running;
        match step.action.get() {
            ActionMarker::Pause => step.action.set(ActionMarker::Recover),
            ActionMarker::Recover | ActionMarker::Replay => {}
            _ => step.action.set(ActionMarker::Run),
        }
        let handle = StepHandle::for_step(step);

        if let Err(err) = self.store.save(&self.server, &inner.operation).await {
            self.alerts.alert(
                AlertLevel::Critical,
                &format!(
                    "running marker for operation {} step {} not persisted: {}",
                    self.operation_id, handle.name, err
                ),
            );
            return Err(ProcessingError::RunningMarkerNotPersisted(
                self.operation_id.0.clone(),
            ));
        }

        info!(
            operation_id = %self.operation_id,
            step = %handle.name,
            is_last = handle.is_last,
            "dispatching step"
        );

        // The machine is always behind an Arc (construction guarantees it),
        // so the upgrade cannot fail while this method runs
        let machine = match self.this.upgrade() {
            Some(machine) => machine,
            None => return Ok(()),
        };
        let distributor = Arc::clone(&self.distributor);
        let params = inner.operation.parameters.clone();
        tokio::spawn(async move {
            let listener: Arc<dyn StatusListener> = machine.clone();
            let outcome = distributor.run(handle, params.clone(), listener).await;
            match outcome {
                StepOutcome::Completed(report) => {
                    if let Err(err) = machine.on_step_completed(report, params).await {
                        warn!(
                            operation_id = %machine.operation_id,
                            %err,
                            "step completion handling failed"
                        );
                    }
                }
                StepOutcome::Cancelled => machine.on_cancelled(params).await,
                StepOutcome::Error(message) => machine.on_error(message).await,
            }
        });
        Ok(())
    }

    /// Terminal callback: the step ran to a terminal severity.
    pub async fn on_step_completed(
        &self,
        report: ItemReport,
        _params: Parameters,
    ) -> Result<(), ProcessingError> {
        let mut inner = self.inner.lock().await;
        let cursor = inner.cursor;
        let last = inner.operation.last_index();

        {
            let step = &mut inner.operation.steps[cursor];
            step.status = step.status.merge(report.status);
            step.elements_processed += report.elements_processed;
        }
        self.fold_into_workflow_status(&mut inner, report.status);

        let step_status = inner.operation.steps[cursor].status;
        debug!(
            operation_id = %self.operation_id,
            step = %inner.operation.steps[cursor].name,
            status = %step_status,
            "step completed"
        );

        if cursor != last {
            inner.operation.steps[cursor].action.set(ActionMarker::Complete);

            let blocking =
                inner.operation.steps[cursor].behavior == crate::domain::step::StepBehavior::Blocking;
            let must_stop = (blocking && step_status.at_least(StatusCode::Ko))
                || step_status.at_least(StatusCode::Fatal);

            if must_stop {
                if step_status.at_least(StatusCode::Fatal) {
                    // Recoverable: the operator inspects and replays
                    self.enter_pause(&mut inner, PauseRecover::ApiPause).await;
                    return Ok(());
                }
                // Blocking KO: jump to the final step for cleanup,
                // preserving the KO outcome
                inner.cursor = last;
                return self.dispatch_or_park(&mut inner).await;
            }

            if inner.operation.target_state == ProcessState::Completed {
                // A cancel arrived mid-flight
                inner.operation.target_status = Some(StatusCode::Ko);
                inner.cursor = last;
                return self.dispatch_or_park(&mut inner).await;
            }

            inner.cursor = cursor + 1;
            if inner.operation.target_state == ProcessState::Pause {
                let reason = inner.operation.pause_recover;
                self.enter_pause(&mut inner, reason).await;
                return Ok(());
            }
            return self.dispatch_or_park(&mut inner).await;
        }

        // Final step: even the terminal step must be replayable after FATAL
        if inner.operation.status.at_least(StatusCode::Fatal) {
            self.enter_pause(&mut inner, PauseRecover::ApiPause).await;
            return Ok(());
        }
        inner.operation.steps[cursor].action.set(ActionMarker::Complete);
        self.finalize(&mut inner).await;
        Ok(())
    }

    /// Terminal callback: the distributor failed outright. Promoted to
    /// FATAL and parked in a recoverable PAUSE.
    pub async fn on_error(&self, message: String) {
        let mut inner = self.inner.lock().await;
        error!(
            operation_id = %self.operation_id,
            "distributor error: {}",
            message
        );
        let cursor = inner.cursor;
        inner.operation.status = inner.operation.status.merge(StatusCode::Fatal);
        inner.operation.steps[cursor].action.set(ActionMarker::Pause);
        // Already in a degraded path: a secondary persistence failure here
        // is logged by enter_pause, nothing more.
        self.enter_pause(&mut inner, PauseRecover::ApiPause).await;
    }

    /// Terminal callback: the step honored a cancel marker. Jump to the
    /// final step for cleanup.
    pub async fn on_cancelled(&self, _params: Parameters) {
        let mut inner = self.inner.lock().await;
        info!(operation_id = %self.operation_id, "step cancelled by distributor");
        let last = inner.operation.last_index();
        if inner.cursor == last {
            self.finalize(&mut inner).await;
            return;
        }
        inner.operation.target_status = Some(StatusCode::Ko);
        inner.cursor = last;
        if let Err(err) = self.dispatch_or_park(&mut inner).await {
            warn!(operation_id = %self.operation_id, %err, "final step dispatch failed");
        }
    }

    // ---- internals -------------------------------------------------------

    /// Aggregate an incoming severity into the workflow status. While the
    /// aggregate is FATAL a replay is in progress: recompute it across the
    /// steps executed so far, so a successful replay supersedes the stale
    /// FATAL.
    fn fold_into_workflow_status(&self, inner: &mut Inner, incoming: StatusCode) {
        if inner.operation.status == StatusCode::Fatal {
            let cursor = inner.cursor;
            let mut recomputed = StatusCode::Unknown;
            for step in &inner.operation.steps[..=cursor] {
                recomputed = recomputed.merge(step.status);
            }
            inner.operation.status = recomputed;
        } else {
            inner.operation.status = inner.operation.status.merge(incoming);
        }
    }

    async fn enter_pause(&self, inner: &mut Inner, reason: PauseRecover) {
        inner.operation.state = ProcessState::Pause;
        inner.operation.target_state = ProcessState::Pause;
        inner.operation.pause_recover = reason;
        self.persist_tolerant(inner).await;
        Self::release_waiters(inner);
    }

    /// Dispatch, downgrading an escalated persistence failure into a parked
    /// FATAL pause when there is no caller left to propagate it to.
    async fn dispatch_or_park(&self, inner: &mut Inner) -> Result<(), ProcessingError> {
        match self.dispatch(inner).await {
            Ok(()) => Ok(()),
            Err(err) => {
                inner.operation.status = inner.operation.status.merge(StatusCode::Fatal);
                self.enter_pause(inner, PauseRecover::ApiPause).await;
                Err(err)
            }
        }
    }

    /// Finalize the operation: apply the status override, set the terminal
    /// state exactly once, persist, and release held resources. Idempotent.
    async fn finalize(&self, inner: &mut Inner) {
        if let Some(forced) = inner.operation.target_status {
            inner.operation.status = inner.operation.status.merge(forced);
        }
        if !inner.operation.mark_completed() {
            return;
        }

        if let Err(err) = self.store.save(&self.server, &inner.operation).await {
            self.alerts.alert(
                AlertLevel::Critical,
                &format!(
                    "finalization snapshot for operation {} not persisted: {}",
                    self.operation_id, err
                ),
            );
        }
        if let Err(err) = self.store.release_container(&inner.operation).await {
            self.alerts.alert(
                AlertLevel::Warning,
                &format!(
                    "workspace container for operation {} not released: {}",
                    self.operation_id, err
                ),
            );
        }
        if let Err(err) = self.store.discard_backup(&self.operation_id).await {
            self.alerts.alert(
                AlertLevel::Warning,
                &format!(
                    "backup artifacts for operation {} not discarded: {}",
                    self.operation_id, err
                ),
            );
        }
        Self::release_waiters(inner);
        info!(
            operation_id = %self.operation_id,
            status = %inner.operation.status,
            "operation completed"
        );
    }

    async fn persist_tolerant(&self, inner: &mut Inner) {
        if let Err(err) = self.store.save(&self.server, &inner.operation).await {
            warn!(
                operation_id = %self.operation_id,
                %err,
                "snapshot not persisted"
            );
            self.alerts.alert(
                AlertLevel::Warning,
                &format!("snapshot for operation {} not persisted: {}", self.operation_id, err),
            );
        }
    }

    fn release_waiters(inner: &mut Inner) {
        for waiter in inner.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

#[async_trait]
impl StatusListener for StateMachine {
    /// Intermediate severity update from the distributor. Persisted after
    /// every update; a failure to persist the transient RUNNING marker
    /// escalates.
    async fn on_status_update(&self, status: StatusCode) -> Result<(), ProcessingError> {
        let mut inner = self.inner.lock().await;
        let cursor = inner.cursor;
        {
            let step = &mut inner.operation.steps[cursor];
            step.status = if status.is_running() {
                StatusCode::Running
            } else {
                step.status.merge(status)
            };
        }
        if status.is_terminal() {
            self.fold_into_workflow_status(&mut inner, status);
        }

        if let Err(err) = self.store.save(&self.server, &inner.operation).await {
            if status.is_running() {
                self.alerts.alert(
                    AlertLevel::Critical,
                    &format!(
                        "running marker for operation {} not persisted: {}",
                        self.operation_id, err
                    ),
                );
                return Err(ProcessingError::RunningMarkerNotPersisted(
                    self.operation_id.0.clone(),
                ));
            }
            warn!(operation_id = %self.operation_id, %err, "status update not persisted");
        }
        Ok(())
    }
}
