//! Collaborator ports consumed by the orchestration core.
//!
//! This module defines the persistence and alerting contracts the core
//! requires from its environment. External crates implement these traits to
//! provide durable storage; the `memory` module provides in-memory doubles
//! for tests.

use crate::domain::operation::{Operation, OperationId};
use crate::error::ProcessingError;
use crate::types::{AlertLevel, ServerIdentity};
use async_trait::async_trait;
use std::collections::HashMap;

/// Durable snapshot store for workflow state, keyed by server identity and
/// operation ID. Per-operation read/write is atomic; no cross-operation
/// transactions are required.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist the operation snapshot
    async fn save(&self, server: &ServerIdentity, operation: &Operation)
        -> Result<(), ProcessingError>;

    /// Load every snapshot owned by the server (startup only)
    async fn load_all(
        &self,
        server: &ServerIdentity,
    ) -> Result<HashMap<OperationId, Operation>, ProcessingError>;

    /// Delete one snapshot
    async fn delete(
        &self,
        server: &ServerIdentity,
        operation_id: &OperationId,
    ) -> Result<(), ProcessingError>;

    /// Free any transient workspace holdings tied to the operation
    async fn release_container(&self, operation: &Operation) -> Result<(), ProcessingError>;

    /// Best-effort removal of temporary backup artifacts for the operation
    async fn discard_backup(&self, operation_id: &OperationId) -> Result<(), ProcessingError>;
}

/// Fire-and-forget operator notification; never throws, never blocks.
pub trait AlertSink: Send + Sync {
    /// Raise an alert
    fn alert(&self, level: AlertLevel, message: &str);
}

/// Default alert sink backed by structured logging
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Info => tracing::info!(target: "silo::alerts", "{}", message),
            AlertLevel::Warning => tracing::warn!(target: "silo::alerts", "{}", message),
            AlertLevel::Critical => tracing::error!(target: "silo::alerts", "{}", message),
        }
    }
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory snapshot store keyed by `(server, operation)`. Saves can be
    /// made to fail on demand to exercise the persistence-failure paths.
    #[derive(Default)]
    pub struct MemorySnapshotStore {
        snapshots: DashMap<(String, String), Operation>,
        failing_saves: AtomicUsize,
    }

    impl MemorySnapshotStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `n` saves fail with a persistence error
        pub fn fail_next_saves(&self, n: usize) {
            self.failing_saves.store(n, Ordering::SeqCst);
        }

        /// Direct read of a persisted snapshot
        pub fn snapshot(
            &self,
            server: &ServerIdentity,
            operation_id: &OperationId,
        ) -> Option<Operation> {
            self.snapshots
                .get(&(server.0.clone(), operation_id.0.clone()))
                .map(|entry| entry.clone())
        }

        /// Number of snapshots held for the server
        pub fn count(&self, server: &ServerIdentity) -> usize {
            self.snapshots
                .iter()
                .filter(|entry| entry.key().0 == server.0)
                .count()
        }
    }

    #[async_trait]
    impl SnapshotStore for MemorySnapshotStore {
        async fn save(
            &self,
            server: &ServerIdentity,
            operation: &Operation,
        ) -> Result<(), ProcessingError> {
            let remaining = self.failing_saves.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_saves.store(remaining - 1, Ordering::SeqCst);
                return Err(ProcessingError::Persistence(
                    "injected save failure".to_string(),
                ));
            }
            self.snapshots.insert(
                (server.0.clone(), operation.operation_id.0.clone()),
                operation.clone(),
            );
            Ok(())
        }

        async fn load_all(
            &self,
            server: &ServerIdentity,
        ) -> Result<HashMap<OperationId, Operation>, ProcessingError> {
            let mut result = HashMap::new();
            for entry in self.snapshots.iter() {
                if entry.key().0 == server.0 {
                    result.insert(OperationId(entry.key().1.clone()), entry.value().clone());
                }
            }
            Ok(result)
        }

        async fn delete(
            &self,
            server: &ServerIdentity,
            operation_id: &OperationId,
        ) -> Result<(), ProcessingError> {
            self.snapshots
                .remove(&(server.0.clone(), operation_id.0.clone()));
            Ok(())
        }

        async fn release_container(&self, _operation: &Operation) -> Result<(), ProcessingError> {
            Ok(())
        }

        async fn discard_backup(&self, _operation_id: &OperationId) -> Result<(), ProcessingError> {
            Ok(())
        }
    }

    /// Alert sink collecting messages for assertions
    #[derive(Default)]
    pub struct CollectingAlertSink {
        alerts: Mutex<Vec<(AlertLevel, String)>>,
    }

    impl CollectingAlertSink {
        /// Create an empty sink
        pub fn new() -> Self {
            Self::default()
        }

        /// Alerts raised so far
        pub fn alerts(&self) -> Vec<(AlertLevel, String)> {
            self.alerts.lock().expect("alert sink poisoned").clone()
        }
    }

    impl AlertSink for CollectingAlertSink {
        fn alert(&self, level: AlertLevel, message: &str) {
            self.alerts
                .lock()
                .expect("alert sink poisoned")
                .push((level, message.to_string()));
        }
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::memory::*;
    use super::*;
    use crate::domain::operation::{OperationCategory, TemplateId, TenantId};
    use crate::domain::step::{OperationStep, StepBehavior, StepId};
    use crate::types::Parameters;

    fn operation(id: &str) -> Operation {
        Operation::new(
            OperationId(id.to_string()),
            TenantId(0),
            TemplateId("INGEST".to_string()),
            OperationCategory::Ingest,
            vec![OperationStep::new(
                StepId("only".to_string()),
                "ONLY",
                StepBehavior::Blocking,
            )],
            Parameters::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = MemorySnapshotStore::new();
        let server = ServerIdentity::new("node-1");
        let op = operation("op-1");

        store.save(&server, &op).await.unwrap();
        let loaded = store.load_all(&server).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&op.operation_id], op);

        store.delete(&server, &op.operation_id).await.unwrap();
        assert!(store.load_all(&server).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_namespacing() {
        let store = MemorySnapshotStore::new();
        let op = operation("op-1");

        store
            .save(&ServerIdentity::new("node-1"), &op)
            .await
            .unwrap();

        let other = store.load_all(&ServerIdentity::new("node-2")).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_injected_save_failure() {
        let store = MemorySnapshotStore::new();
        let server = ServerIdentity::new("node-1");
        let op = operation("op-1");

        store.fail_next_saves(1);
        assert!(store.save(&server, &op).await.is_err());
        // Next save succeeds
        assert!(store.save(&server, &op).await.is_ok());
    }

    #[test]
    fn test_collecting_alert_sink() {
        let sink = CollectingAlertSink::new();
        sink.alert(AlertLevel::Warning, "shutdown wait timed out");

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, AlertLevel::Warning);
        assert!(alerts[0].1.contains("timed out"));
    }
}
