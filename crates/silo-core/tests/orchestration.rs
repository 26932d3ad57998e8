//! End-to-end orchestration scenarios driven through the process manager
//! with a scripted distributor and in-memory persistence.

use silo_core::testing::{InMemoryTemplates, ScriptedDistributor};
use silo_core::{
    AlertLevel, CleanupConfig, CleanupScheduler, OperationId, OperationQuery, Parameters,
    PauseRecover, ProcessAction, ProcessManager, ProcessManagerConfig, ProcessState,
    ProcessingError, StatusCode, TemplateId, TenantId,
};
use silo_core::domain::repository::memory::{CollectingAlertSink, MemorySnapshotStore};
use silo_core::{ActionMarker, OperationSummary};
use std::sync::Arc;
use std::time::Duration;

fn ingest() -> TemplateId {
    TemplateId("DEFAULT_INGEST".to_string())
}

fn tenant() -> TenantId {
    TenantId(0)
}

fn manager(
    store: Arc<MemorySnapshotStore>,
    distributor: Arc<ScriptedDistributor>,
) -> Arc<ProcessManager> {
    Arc::new(ProcessManager::new(
        ProcessManagerConfig::default(),
        distributor,
        store,
        Arc::new(InMemoryTemplates::with_default_ingest()),
        Arc::new(CollectingAlertSink::new()),
    ))
}

async fn wait_for_state(
    manager: &ProcessManager,
    id: &OperationId,
    state: ProcessState,
) -> OperationSummary {
    for _ in 0..500 {
        let summary = manager.get_operation(id, &tenant()).await.unwrap();
        if summary.state == state {
            return summary;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("operation never reached {:?}", state);
}

#[tokio::test]
async fn test_resume_runs_all_steps_to_completion() {
    let distributor = Arc::new(ScriptedDistributor::all_ok());
    let manager = manager(Arc::new(MemorySnapshotStore::new()), distributor.clone());

    let op = manager
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await
        .unwrap();

    let done = wait_for_state(&manager, &op.operation_id, ProcessState::Completed).await;
    assert_eq!(done.status, StatusCode::Ok);
    assert!(done.completed_at.is_some());
    assert_eq!(
        distributor.dispatched(),
        vec!["CHECK_SEDA", "STORE_OBJECTS", "FINALISE_INGEST"]
    );
}

#[tokio::test]
async fn test_next_advances_exactly_one_step() {
    let distributor = Arc::new(ScriptedDistributor::all_ok());
    let manager = manager(Arc::new(MemorySnapshotStore::new()), distributor.clone());

    let op = manager
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Next, Parameters::new())
        .await
        .unwrap();

    let paused = wait_for_state(&manager, &op.operation_id, ProcessState::Pause).await;
    assert!(paused.step_by_step);
    assert_eq!(paused.current_step.as_deref(), Some("CHECK_SEDA"));
    assert_eq!(distributor.dispatched(), vec!["CHECK_SEDA"]);

    // Two more Next calls reach the final step, which finalizes
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Next, Parameters::new())
        .await
        .unwrap();
    wait_for_state(&manager, &op.operation_id, ProcessState::Pause).await;
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Next, Parameters::new())
        .await
        .unwrap();

    let done = wait_for_state(&manager, &op.operation_id, ProcessState::Completed).await;
    assert_eq!(done.status, StatusCode::Ok);
}

#[tokio::test]
async fn test_fatal_step_pauses_then_replay_supersedes_fatal() {
    let distributor = Arc::new(
        ScriptedDistributor::all_ok().script_status("STORE_OBJECTS", StatusCode::Fatal),
    );
    let manager = manager(Arc::new(MemorySnapshotStore::new()), distributor.clone());

    let op = manager
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await
        .unwrap();

    let paused = wait_for_state(&manager, &op.operation_id, ProcessState::Pause).await;
    assert_eq!(paused.status, StatusCode::Fatal);
    assert_eq!(paused.pause_recover, PauseRecover::ApiPause);
    assert_eq!(paused.current_step.as_deref(), Some("STORE_OBJECTS"));

    // Replay re-executes the failed step (OK this time), then pauses
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Replay, Parameters::new())
        .await
        .unwrap();
    let replayed = wait_for_state(&manager, &op.operation_id, ProcessState::Pause).await;
    assert_eq!(replayed.status, StatusCode::Ok);

    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await
        .unwrap();
    let done = wait_for_state(&manager, &op.operation_id, ProcessState::Completed).await;
    assert_eq!(done.status, StatusCode::Ok);
    assert_eq!(
        distributor.dispatched(),
        vec![
            "CHECK_SEDA",
            "STORE_OBJECTS",
            "STORE_OBJECTS",
            "FINALISE_INGEST"
        ]
    );
}

#[tokio::test]
async fn test_blocking_ko_jumps_to_final_step() {
    // CHECK_SEDA is blocking; a KO there skips STORE_OBJECTS and goes
    // straight to the final step, preserving the KO outcome
    let distributor =
        Arc::new(ScriptedDistributor::all_ok().script_status("CHECK_SEDA", StatusCode::Ko));
    let manager = manager(Arc::new(MemorySnapshotStore::new()), distributor.clone());

    let op = manager
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await
        .unwrap();

    let done = wait_for_state(&manager, &op.operation_id, ProcessState::Completed).await;
    assert_eq!(done.status, StatusCode::Ko);
    assert_eq!(
        distributor.dispatched(),
        vec!["CHECK_SEDA", "FINALISE_INGEST"]
    );
}

#[tokio::test]
async fn test_cancel_mid_flight_forces_ko_completion() {
    let distributor =
        Arc::new(ScriptedDistributor::all_ok().with_delay(Duration::from_millis(100)));
    let store = Arc::new(MemorySnapshotStore::new());
    let manager = manager(store.clone(), distributor.clone());

    let op = manager
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await
        .unwrap();

    // Let the first step start, then cancel while it is in flight
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.cancel(&op.operation_id, &tenant()).await.unwrap();

    let done = wait_for_state(&manager, &op.operation_id, ProcessState::Completed).await;
    assert!(done.status.at_least(StatusCode::Ko));

    // The distributor honored the marker on step 1 and only the final
    // cleanup step ran afterwards
    assert_eq!(
        distributor.dispatched(),
        vec!["CHECK_SEDA", "FINALISE_INGEST"]
    );
}

#[tokio::test]
async fn test_cancel_before_start_completes_in_place() {
    let manager = manager(
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(ScriptedDistributor::all_ok()),
    );

    let op = manager
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    let done = manager.cancel(&op.operation_id, &tenant()).await.unwrap();

    assert_eq!(done.state, ProcessState::Completed);
    assert!(done.status.at_least(StatusCode::Ko));
}

#[tokio::test]
async fn test_submit_rejected_on_completed_operation() {
    let manager = manager(
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(ScriptedDistributor::all_ok()),
    );

    let op = manager
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    manager.cancel(&op.operation_id, &tenant()).await.unwrap();

    let result = manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await;
    assert!(matches!(result, Err(ProcessingError::StateNotAllowed(_))));
}

#[tokio::test]
async fn test_shutdown_then_restart_auto_resumes() {
    let store = Arc::new(MemorySnapshotStore::new());
    let server = ProcessManagerConfig::default().server;
    let distributor =
        Arc::new(ScriptedDistributor::all_ok().with_delay(Duration::from_millis(80)));
    let first = manager(store.clone(), distributor);

    let op = first
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    first
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await
        .unwrap();

    // Shutdown while the first step is executing; the call blocks until
    // the step reaches a safe boundary
    tokio::time::sleep(Duration::from_millis(20)).await;
    first.shutdown_all().await;

    let persisted = store.snapshot(&server, &op.operation_id).unwrap();
    assert_eq!(persisted.state, ProcessState::Pause);
    assert_eq!(persisted.pause_recover, PauseRecover::ServerPause);

    // A fresh manager over the same store resumes it unattended
    let second = manager(store.clone(), Arc::new(ScriptedDistributor::all_ok()));
    let report = second.restore_operations().await.unwrap();
    assert_eq!(report.resumed, 1);

    let done = wait_for_state(&second, &op.operation_id, ProcessState::Completed).await;
    assert_eq!(done.status, StatusCode::Ok);
}

#[tokio::test]
async fn test_restart_after_crash_marks_operation_failed() {
    let store = Arc::new(MemorySnapshotStore::new());
    let server = ProcessManagerConfig::default().server;
    let distributor =
        Arc::new(ScriptedDistributor::all_ok().with_delay(Duration::from_secs(30)));
    let first = manager(store.clone(), distributor);

    let op = first
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    first
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Drop the first manager without shutdown, simulating a crash; the
    // snapshot is left RUNNING
    drop(first);
    let persisted = store.snapshot(&server, &op.operation_id).unwrap();
    assert_eq!(persisted.state, ProcessState::Running);

    let second = manager(store.clone(), Arc::new(ScriptedDistributor::all_ok()));
    let report = second.restore_operations().await.unwrap();
    assert_eq!(report.marked_failed, 1);
    assert_eq!(report.resumed, 0);

    let persisted = store.snapshot(&server, &op.operation_id).unwrap();
    assert_eq!(persisted.state, ProcessState::Failed);
    assert_eq!(persisted.status, StatusCode::Unknown);
}

#[tokio::test]
async fn test_cleanup_evicts_aged_completed_operations() {
    let store = Arc::new(MemorySnapshotStore::new());
    let server = ProcessManagerConfig::default().server;
    let manager = manager(store.clone(), Arc::new(ScriptedDistributor::all_ok()));

    let op = manager
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await
        .unwrap();
    wait_for_state(&manager, &op.operation_id, ProcessState::Completed).await;

    let scheduler = CleanupScheduler::new(
        Arc::clone(&manager),
        CleanupConfig {
            default_retention: Duration::ZERO,
            ..Default::default()
        },
    );
    let evicted = scheduler.run_once().await;

    assert_eq!(evicted, 1);
    assert_eq!(manager.operation_count(), 0);
    assert!(store.snapshot(&server, &op.operation_id).is_none());
}

#[tokio::test]
async fn test_cleanup_keeps_operations_within_retention() {
    let manager = manager(
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(ScriptedDistributor::all_ok()),
    );

    let op = manager
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await
        .unwrap();
    wait_for_state(&manager, &op.operation_id, ProcessState::Completed).await;

    let scheduler = CleanupScheduler::new(Arc::clone(&manager), CleanupConfig::default());
    assert_eq!(scheduler.run_once().await, 0);
    assert_eq!(manager.operation_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_operations_are_independent() {
    let manager = manager(
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(ScriptedDistributor::all_ok().with_delay(Duration::from_millis(5))),
    );

    let mut ids = Vec::new();
    for i in 0..10 {
        let op = manager
            .initiate_operation(TenantId(i % 3), &ingest(), Parameters::new())
            .await
            .unwrap();
        manager
            .submit(
                &op.operation_id,
                &TenantId(i % 3),
                ProcessAction::Resume,
                Parameters::new(),
            )
            .await
            .unwrap();
        ids.push((op.operation_id, TenantId(i % 3)));
    }

    for (id, tenant) in ids {
        for _ in 0..500 {
            let summary = manager.get_operation(&id, &tenant).await.unwrap();
            if summary.state == ProcessState::Completed {
                assert_eq!(summary.status, StatusCode::Ok);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let summary = manager.get_operation(&id, &tenant).await.unwrap();
        assert_eq!(summary.state, ProcessState::Completed);
    }

    let completed = manager
        .list_operations(&OperationQuery {
            states: vec![ProcessState::Completed],
            ..Default::default()
        })
        .await;
    assert_eq!(completed.len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operator_calls_never_interleave_with_callbacks() {
    let store = Arc::new(MemorySnapshotStore::new());
    let server = ProcessManagerConfig::default().server;
    let manager = manager(
        store.clone(),
        Arc::new(ScriptedDistributor::all_ok().with_delay(Duration::from_millis(3))),
    );

    let op = manager
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await
        .unwrap();

    // Hammer the operation with pause/resume while callbacks are firing;
    // illegal transitions are rejected, never partially applied
    for _ in 0..50 {
        let _ = manager.pause(&op.operation_id, &tenant()).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        let _ = manager
            .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
            .await;
        let summary = manager.get_operation(&op.operation_id, &tenant()).await.unwrap();
        if summary.state == ProcessState::Completed {
            break;
        }
    }

    // Drive to completion if a pause won the last race
    for _ in 0..200 {
        let summary = manager.get_operation(&op.operation_id, &tenant()).await.unwrap();
        match summary.state {
            ProcessState::Completed => break,
            ProcessState::Pause => {
                let _ = manager
                    .submit(
                        &op.operation_id,
                        &tenant(),
                        ProcessAction::Resume,
                        Parameters::new(),
                    )
                    .await;
            }
            _ => {}
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let persisted = store.snapshot(&server, &op.operation_id).unwrap();
    assert_eq!(persisted.state, ProcessState::Completed);
    assert!(persisted.completed_at.is_some());
    // No non-final step may be left with a pending pause/cancel marker
    for step in persisted.steps.iter().filter(|s| !s.is_last) {
        let marker = step.action.get();
        assert!(
            marker != ActionMarker::Pause && marker != ActionMarker::Cancel,
            "step {} left with pending marker {:?}",
            step.name,
            marker
        );
    }
}

#[tokio::test]
async fn test_shutdown_timeout_raises_alert() {
    let store = Arc::new(MemorySnapshotStore::new());
    let alerts = Arc::new(CollectingAlertSink::new());
    let manager = Arc::new(ProcessManager::new(
        ProcessManagerConfig {
            shutdown_grace: Duration::from_millis(30),
            ..Default::default()
        },
        Arc::new(ScriptedDistributor::all_ok().with_delay(Duration::from_secs(30))),
        store,
        Arc::new(InMemoryTemplates::with_default_ingest()),
        alerts.clone(),
    ));

    let op = manager
        .initiate_operation(tenant(), &ingest(), Parameters::new())
        .await
        .unwrap();
    manager
        .submit(&op.operation_id, &tenant(), ProcessAction::Resume, Parameters::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The step never finishes within the grace period; shutdown proceeds
    // anyway and raises an alert
    manager.shutdown_all().await;
    let raised = alerts.alerts();
    assert!(raised
        .iter()
        .any(|(level, message)| *level == AlertLevel::Warning && message.contains("PAUSE")));
}
