use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use weft_types::StateMap;
use weft_wire::{RunMode, TaskSendParams};

use crate::{AppCheckpoint, ClientError, ThreadReplica, WeftClient};

/// Ties the transport to a replica for one thread: run, resume, fork,
/// replay and stop against the remote task manager, folding the
/// resulting event stream into the local view.
pub struct ThreadSession {
    client: WeftClient,
    thread_id: String,
    task_id: Option<String>,
    replica: ThreadReplica,
}

impl ThreadSession {
    pub fn new(client: WeftClient, thread_id: impl Into<String>) -> Self {
        Self {
            client,
            thread_id: thread_id.into(),
            task_id: None,
            replica: ThreadReplica::new(),
        }
    }

    pub fn replica(&self) -> &ThreadReplica {
        &self.replica
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// Start a fresh run and fold its stream until the server closes
    /// it or `abort` fires. An abort stops the transport read and
    /// leaves the replica in whatever partial state it reached.
    pub async fn run(
        &mut self,
        initial_state: StateMap,
        abort: CancellationToken,
    ) -> Result<(), ClientError> {
        self.replica.reset();
        let params = TaskSendParams::run(
            Uuid::new_v4().to_string(),
            self.thread_id.clone(),
            initial_state,
        );
        self.stream_into_replica(params, abort).await
    }

    /// Re-enter the thread's paused run with a resume value.
    pub async fn resume(
        &mut self,
        value: Value,
        abort: CancellationToken,
    ) -> Result<(), ClientError> {
        let task_id = self
            .task_id
            .clone()
            .ok_or_else(|| ClientError::Decode("no task to resume".into()))?;
        let mut params = TaskSendParams::run(task_id, self.thread_id.clone(), StateMap::new());
        params.mode = RunMode::Resume;
        params.state = None;
        params.resume = Some(value);
        self.stream_into_replica(params, abort).await
    }

    /// Branch from an interior checkpoint: truncate the local view to
    /// and including that entry, then re-run with the overlaid state.
    pub async fn fork(
        &mut self,
        checkpoint_id: &str,
        state: StateMap,
        abort: CancellationToken,
    ) -> Result<(), ClientError> {
        if !self.replica.truncate_at(checkpoint_id) {
            return Err(ClientError::Decode(format!(
                "unknown checkpoint: {checkpoint_id}"
            )));
        }
        let mut params = TaskSendParams::run(
            Uuid::new_v4().to_string(),
            self.thread_id.clone(),
            StateMap::new(),
        );
        params.mode = RunMode::Fork;
        params.state = Some(state);
        params.checkpoint_id = Some(checkpoint_id.to_string());
        self.stream_into_replica(params, abort).await
    }

    /// Re-execute forward from a checkpoint without altering state.
    pub async fn replay(
        &mut self,
        checkpoint_id: &str,
        abort: CancellationToken,
    ) -> Result<(), ClientError> {
        if !self.replica.truncate_at(checkpoint_id) {
            return Err(ClientError::Decode(format!(
                "unknown checkpoint: {checkpoint_id}"
            )));
        }
        let mut params = TaskSendParams::run(
            Uuid::new_v4().to_string(),
            self.thread_id.clone(),
            StateMap::new(),
        );
        params.mode = RunMode::Replay;
        params.state = None;
        params.checkpoint_id = Some(checkpoint_id.to_string());
        self.stream_into_replica(params, abort).await
    }

    /// Ask the server to stop the active run. Cooperative: the engine
    /// halts before its next checkpoint, and anything already in
    /// flight still arrives on open streams.
    pub async fn stop(&mut self) -> Result<(), ClientError> {
        let task_id = self
            .task_id
            .clone()
            .ok_or_else(|| ClientError::Decode("no task to stop".into()))?;
        self.client.cancel_task(&task_id).await?;
        Ok(())
    }

    /// Rebuild the replica from the thread's stored history, selecting
    /// one branch by the most-recent-first parent walk.
    pub async fn restore(&mut self) -> Result<&[AppCheckpoint], ClientError> {
        let history = self.client.get_history(&self.thread_id).await?;
        self.replica.restore_from_history(&history);
        Ok(self.replica.checkpoints())
    }

    async fn stream_into_replica(
        &mut self,
        params: TaskSendParams,
        abort: CancellationToken,
    ) -> Result<(), ClientError> {
        let mut stream = self.client.send_subscribe(&params, abort).await?;
        self.task_id = Some(params.id.clone());
        // one event at a time, fully applied before the next is read
        while let Some(event) = stream.next_event().await {
            match event {
                Ok(result) => self.replica.apply_event(result.event),
                Err(err @ ClientError::Rpc { .. }) => {
                    tracing::warn!(error = %err, "server reported a stream error");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
