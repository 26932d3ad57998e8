//! In-memory snapshot store with per-server namespaces.

use async_trait::async_trait;
use silo_core::domain::repository::SnapshotStore;
use silo_core::{Operation, OperationId, ProcessingError, ServerIdentity};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory implementation of the snapshot store.
///
/// Snapshots are namespaced by server identity, mirroring the ownership
/// model of the durable store: each operation is persisted under exactly one
/// server and only that server's startup recovery sees it. Workspace
/// container and backup bookkeeping is tracked so that finalization-time
/// release and discard are observable in tests.
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, HashMap<String, Operation>>>,
    containers: RwLock<HashSet<String>>,
    backups: RwLock<HashSet<String>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            containers: RwLock::new(HashSet::new()),
            backups: RwLock::new(HashSet::new()),
        }
    }

    /// Whether a workspace container is currently held for the operation
    pub async fn has_container(&self, operation_id: &OperationId) -> bool {
        self.containers.read().await.contains(&operation_id.0)
    }

    /// Whether backup artifacts are currently held for the operation
    pub async fn has_backup(&self, operation_id: &OperationId) -> bool {
        self.backups.read().await.contains(&operation_id.0)
    }

    /// Number of snapshots held for the server
    pub async fn count(&self, server: &ServerIdentity) -> usize {
        self.snapshots
            .read()
            .await
            .get(&server.0)
            .map(|ops| ops.len())
            .unwrap_or(0)
    }
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(
        &self,
        server: &ServerIdentity,
        operation: &Operation,
    ) -> Result<(), ProcessingError> {
        let mut snapshots = self.snapshots.write().await;
        snapshots
            .entry(server.0.clone())
            .or_default()
            .insert(operation.operation_id.0.clone(), operation.clone());
        drop(snapshots);

        // A save implies a live workspace container and a backup copy
        self.containers
            .write()
            .await
            .insert(operation.operation_id.0.clone());
        self.backups
            .write()
            .await
            .insert(operation.operation_id.0.clone());
        debug!(operation_id = %operation.operation_id, server = %server.0, "snapshot saved");
        Ok(())
    }

    async fn load_all(
        &self,
        server: &ServerIdentity,
    ) -> Result<HashMap<OperationId, Operation>, ProcessingError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(&server.0)
            .map(|ops| {
                ops.values()
                    .map(|op| (op.operation_id.clone(), op.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(
        &self,
        server: &ServerIdentity,
        operation_id: &OperationId,
    ) -> Result<(), ProcessingError> {
        let mut snapshots = self.snapshots.write().await;
        if let Some(ops) = snapshots.get_mut(&server.0) {
            ops.remove(&operation_id.0);
        }
        Ok(())
    }

    async fn release_container(&self, operation: &Operation) -> Result<(), ProcessingError> {
        self.containers
            .write()
            .await
            .remove(&operation.operation_id.0);
        debug!(operation_id = %operation.operation_id, "container released");
        Ok(())
    }

    async fn discard_backup(&self, operation_id: &OperationId) -> Result<(), ProcessingError> {
        self.backups.write().await.remove(&operation_id.0);
        Ok(())
    }
}
