use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use weft_types::Checkpoint;

/// Append-only history of checkpoints per execution thread. The sync
/// layer never mutates existing records; forks grow the DAG by
/// appending checkpoints whose parent points at an interior node.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Full checkpoint DAG for a thread, most-recent-first. Every
    /// implementation and caller relies on this ordering.
    async fn history(&self, thread_id: &str) -> anyhow::Result<Vec<Checkpoint>>;

    async fn append(&self, checkpoint: Checkpoint) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    inner: Arc<RwLock<HashMap<String, Vec<Checkpoint>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn history(&self, thread_id: &str) -> anyhow::Result<Vec<Checkpoint>> {
        let guard = self.inner.read().await;
        let mut checkpoints = guard.get(thread_id).cloned().unwrap_or_default();
        checkpoints.reverse();
        Ok(checkpoints)
    }

    async fn append(&self, checkpoint: Checkpoint) -> anyhow::Result<()> {
        let mut guard = self.inner.write().await;
        guard
            .entry(checkpoint.config.thread_id.clone())
            .or_default()
            .push(checkpoint);
        Ok(())
    }
}
