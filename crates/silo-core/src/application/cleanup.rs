//! Retention-based eviction of completed operations.
//!
//! Completed operations stay in the registry (and in the snapshot store) so
//! operators can query their outcome, then age out after a per-category
//! retention window.

use crate::application::process_manager::{OperationQuery, ProcessManager};
use crate::domain::operation::{OperationCategory, ProcessState};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cleanup pass scheduling and retention windows
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Time between eviction passes
    pub interval: Duration,

    /// Retention window applied when no category override matches
    pub default_retention: Duration,

    /// Per-category retention overrides
    pub overrides: HashMap<OperationCategory, Duration>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            default_retention: Duration::from_secs(3600),
            overrides: HashMap::new(),
        }
    }
}

impl CleanupConfig {
    /// Retention window for a category
    pub fn retention_for(&self, category: OperationCategory) -> Duration {
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or(self.default_retention)
    }
}

/// Periodic task evicting completed operations past their retention window
pub struct CleanupScheduler {
    manager: Arc<ProcessManager>,
    config: CleanupConfig,
}

impl CleanupScheduler {
    /// Create a scheduler over the given manager
    pub fn new(manager: Arc<ProcessManager>, config: CleanupConfig) -> Self {
        Self { manager, config }
    }

    /// Run eviction passes forever on a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            // The first tick fires immediately; skip it so a fresh start
            // does not race startup recovery
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = self.run_once().await;
                if evicted > 0 {
                    info!(evicted, "cleanup pass finished");
                }
            }
        })
    }

    /// One eviction pass; returns the number of operations evicted
    pub async fn run_once(&self) -> usize {
        let completed = self
            .manager
            .list_operations(&OperationQuery {
                states: vec![ProcessState::Completed],
                ..Default::default()
            })
            .await;

        let now = Utc::now();
        let mut evicted = 0;
        for summary in completed {
            let completed_at = match summary.completed_at {
                Some(ts) => ts,
                None => continue,
            };
            let retention = self.config.retention_for(summary.category);
            let age = (now - completed_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age < retention {
                continue;
            }
            match self.manager.evict(&summary.operation_id).await {
                Ok(true) => {
                    debug!(operation_id = %summary.operation_id, "operation evicted");
                    evicted += 1;
                }
                Ok(false) => {}
                Err(err) => warn!(
                    operation_id = %summary.operation_id,
                    %err,
                    "eviction failed"
                ),
            }
        }
        evicted
    }
}
