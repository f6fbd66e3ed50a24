use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use weft_types::{Checkpoint, EngineNotification, StateMap};

/// How the engine enters the computation graph for one run.
#[derive(Debug, Clone)]
pub enum EngineInput {
    /// Start fresh against an initial state.
    Run { state: StateMap },
    /// Continue a paused run with the observer-supplied value.
    Resume { value: Value },
    /// Branch from an interior checkpoint with `state` overlaid onto
    /// the checkpoint's values.
    Fork {
        checkpoint: Checkpoint,
        state: StateMap,
    },
    /// Re-execute forward from a checkpoint using its original values.
    Replay { checkpoint: Checkpoint },
}

#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub thread_id: String,
    pub input: EngineInput,
}

/// Handle the engine uses to surface notifications to the task
/// manager. Sends never block; a closed channel means the run's pump
/// is gone and the notification is dropped.
#[derive(Clone)]
pub struct EngineEmitter {
    tx: mpsc::UnboundedSender<EngineNotification>,
}

impl EngineEmitter {
    pub fn new(tx: mpsc::UnboundedSender<EngineNotification>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, notification: EngineNotification) {
        let _ = self.tx.send(notification);
    }
}

/// The execution host seam. Implementations run the computation graph
/// step by step and emit notifications as they go.
///
/// Cancellation contract: `cancel` is checked cooperatively between
/// steps. An implementation must stop before emitting its next
/// checkpoint or completion notification once the token is cancelled;
/// a notification already emitted stays in flight and is delivered.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Output modes this engine can produce; requests declaring
    /// incompatible accepted modes are rejected before a task exists.
    fn supported_output_modes(&self) -> Vec<String> {
        vec!["text".to_string()]
    }

    /// Run or continue the computation until it completes, pauses on an
    /// interrupt, fails, or observes cancellation. Pausing and
    /// cancellation both return `Ok`; a returned error is treated the
    /// same as an emitted `Failed` notification.
    async fn run(
        &self,
        request: EngineRequest,
        emitter: EngineEmitter,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Scripted stand-in engine: replays a fixed notification sequence with
/// an optional inter-step delay, honoring the cooperative-cancel
/// contract. Used by tests and by the demo binary.
pub struct ScriptedEngine {
    steps: Vec<EngineNotification>,
    step_delay: std::time::Duration,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<EngineNotification>) -> Self {
        Self {
            steps,
            step_delay: std::time::Duration::ZERO,
        }
    }

    pub fn with_step_delay(mut self, delay: std::time::Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn run(
        &self,
        _request: EngineRequest,
        emitter: EngineEmitter,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        for step in &self.steps {
            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
            emitter.emit(step.clone());
        }
        Ok(())
    }
}
