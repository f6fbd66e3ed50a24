use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use weft_types::{
    lineage_of, Checkpoint, EngineNotification, StateMap, Task, TaskError, TaskState, TaskStatus,
};
use weft_wire::{
    modalities_compatible, RunMode, StreamEvent, TaskSendParams, TaskStreamResult,
};

use crate::{
    CancellationRegistry, CheckpointStore, EngineEmitter, EngineInput, EngineRequest,
    EventTranslator, ExecutionEngine, PushNotifier, StreamEnvelope, SubscriberRegistry,
    Subscription,
};

/// Owns task lifecycle: admits run/resume/fork/replay requests, runs
/// the execution engine in the background per task, translates its
/// notifications into protocol events, fans them out to subscribers,
/// and delivers out-of-band push notifications.
#[derive(Clone)]
pub struct TaskManager {
    engine: Arc<dyn ExecutionEngine>,
    store: Arc<dyn CheckpointStore>,
    notifier: Arc<PushNotifier>,
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    threads: Arc<RwLock<HashMap<String, String>>>,
    stopping: Arc<RwLock<HashSet<String>>>,
    history_cache: Arc<RwLock<HashMap<String, Vec<Checkpoint>>>>,
    push_configs: Arc<RwLock<HashMap<String, weft_wire::PushNotificationConfig>>>,
    subscribers: SubscriberRegistry,
    cancellations: CancellationRegistry,
}

impl TaskManager {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        store: Arc<dyn CheckpointStore>,
        notifier: PushNotifier,
    ) -> Self {
        Self {
            engine,
            store,
            notifier: Arc::new(notifier),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            threads: Arc::new(RwLock::new(HashMap::new())),
            stopping: Arc::new(RwLock::new(HashSet::new())),
            history_cache: Arc::new(RwLock::new(HashMap::new())),
            push_configs: Arc::new(RwLock::new(HashMap::new())),
            subscribers: SubscriberRegistry::new(),
            cancellations: CancellationRegistry::new(),
        }
    }

    pub fn supported_output_modes(&self) -> Vec<String> {
        self.engine.supported_output_modes()
    }

    pub fn supports_push(&self) -> bool {
        self.notifier.supports_push()
    }

    pub fn jwks(&self) -> Value {
        self.notifier.jwks()
    }

    /// Start a fresh run for a thread. Returns as soon as the engine is
    /// dispatched; progress is observed through subscriptions.
    ///
    /// Concurrent runs on the same thread are not serialized: a second
    /// run rebinds the thread to a new task and resets fan-out state,
    /// and an engine still draining for the old task publishes into
    /// queues that no longer exist. Last writer wins.
    pub async fn run(
        &self,
        thread_id: &str,
        initial_state: StateMap,
    ) -> Result<String, TaskError> {
        let params = TaskSendParams::run(Uuid::new_v4().to_string(), thread_id, initial_state);
        Ok(self.send(params).await?.id)
    }

    /// Re-enter a paused run. Valid only while the task is
    /// `input-required`.
    pub async fn resume(&self, thread_id: &str, value: Value) -> Result<String, TaskError> {
        let task_id = self.bound_task(thread_id).await?;
        let mut params = TaskSendParams::run(task_id, thread_id, StateMap::new());
        params.mode = RunMode::Resume;
        params.state = None;
        params.resume = Some(value);
        Ok(self.send(params).await?.id)
    }

    /// Branch from an interior checkpoint with `state` overlaid,
    /// discarding the truncated descendants from the thread's known
    /// history.
    pub async fn fork(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        state: StateMap,
    ) -> Result<String, TaskError> {
        let mut params =
            TaskSendParams::run(Uuid::new_v4().to_string(), thread_id, StateMap::new());
        params.mode = RunMode::Fork;
        params.state = Some(state);
        params.checkpoint_id = Some(checkpoint_id.to_string());
        Ok(self.send(params).await?.id)
    }

    /// Re-execute forward from a checkpoint using its original values.
    pub async fn replay(&self, thread_id: &str, checkpoint_id: &str) -> Result<String, TaskError> {
        let mut params =
            TaskSendParams::run(Uuid::new_v4().to_string(), thread_id, StateMap::new());
        params.mode = RunMode::Replay;
        params.state = None;
        params.checkpoint_id = Some(checkpoint_id.to_string());
        Ok(self.send(params).await?.id)
    }

    /// Admit a send request and dispatch the engine without opening a
    /// subscription (`tasks/send`).
    pub async fn send(&self, params: TaskSendParams) -> Result<Task, TaskError> {
        let (task, input) = self.admit(&params).await?;
        self.spawn_execution(task.clone(), input).await;
        Ok(task)
    }

    /// Admit a send request with a subscription attached before the
    /// engine is dispatched, so no event can be missed
    /// (`tasks/sendSubscribe`).
    pub async fn send_subscribe(
        &self,
        params: TaskSendParams,
    ) -> Result<(Task, Subscription), TaskError> {
        let (task, input) = self.admit(&params).await?;
        let subscription = self.subscribers.subscribe(&task.id).await;
        self.spawn_execution(task.clone(), input).await;
        Ok((task, subscription))
    }

    /// Attach to an existing task's stream without re-running it. On a
    /// task already in a terminal state the subscription closes
    /// immediately. Subscribing happens before the status check so a
    /// run finishing concurrently cannot leave the queue open forever.
    pub async fn open_subscription(&self, task_id: &str) -> Result<Subscription, TaskError> {
        let subscription = self.subscribers.subscribe(task_id).await;
        let status = {
            let tasks = self.tasks.read().await;
            tasks.get(task_id).map(|task| task.status.state)
        };
        match status {
            None => {
                self.subscribers
                    .unsubscribe(task_id, subscription.id)
                    .await;
                Err(TaskError::TaskNotFound(task_id.to_string()))
            }
            Some(state) if state.is_terminal() => {
                self.subscribers.close_one(task_id, subscription.id).await;
                Ok(subscription)
            }
            Some(_) => Ok(subscription),
        }
    }

    pub async fn close_subscription(&self, task_id: &str, subscription_id: u64) {
        self.subscribers.unsubscribe(task_id, subscription_id).await;
    }

    /// Cooperatively stop the thread's active run. The engine halts
    /// before emitting its next checkpoint or completion notification;
    /// an event already in flight is still delivered. When no run can
    /// be signalled the transient stopping state is reverted and the
    /// failure surfaced.
    pub async fn stop(&self, thread_id: &str) -> Result<(), TaskError> {
        let task_id = self.bound_task(thread_id).await?;
        {
            let tasks = self.tasks.read().await;
            let task = tasks
                .get(&task_id)
                .ok_or_else(|| TaskError::TaskNotFound(task_id.clone()))?;
            if task.status.state.is_terminal() {
                return Err(TaskError::TaskNotCancelable(task_id.clone()));
            }
        }
        self.stopping.write().await.insert(task_id.clone());
        if !self.cancellations.cancel(&task_id).await {
            self.stopping.write().await.remove(&task_id);
            return Err(TaskError::TaskNotCancelable(task_id));
        }
        info!(thread = thread_id, task = %task_id, "stop signalled");
        Ok(())
    }

    /// `tasks/cancel`: stop the run owning this task id.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, TaskError> {
        let thread_id = {
            let tasks = self.tasks.read().await;
            tasks
                .get(task_id)
                .ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()))?
                .thread_id
                .clone()
        };
        let bound = self.bound_task(&thread_id).await?;
        if bound != task_id {
            return Err(TaskError::TaskNotCancelable(task_id.to_string()));
        }
        self.stop(&thread_id).await?;
        self.get_task(task_id, None).await
    }

    pub async fn get_task(
        &self,
        task_id: &str,
        history_length: Option<usize>,
    ) -> Result<Task, TaskError> {
        let tasks = self.tasks.read().await;
        tasks
            .get(task_id)
            .map(|task| task.with_history_trimmed(history_length))
            .ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()))
    }

    /// Whether a stop is pending for the task (transient sub-state of
    /// `working`).
    pub async fn is_stopping(&self, task_id: &str) -> bool {
        self.stopping.read().await.contains(task_id)
    }

    /// Full checkpoint DAG for a thread, most-recent-first, cached
    /// until invalidated by a new run.
    pub async fn get_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, TaskError> {
        if thread_id.trim().is_empty() {
            return Err(TaskError::InvalidInput("threadId is required".into()));
        }
        if let Some(cached) = self.history_cache.read().await.get(thread_id) {
            return Ok(cached.clone());
        }
        let history = self
            .store
            .history(thread_id)
            .await
            .map_err(|err| TaskError::Storage(err.to_string()))?;
        self.history_cache
            .write()
            .await
            .insert(thread_id.to_string(), history.clone());
        Ok(history)
    }

    /// Latest checkpoint for a thread, if any.
    pub async fn get_state(&self, thread_id: &str) -> Result<Option<Checkpoint>, TaskError> {
        Ok(self.get_history(thread_id).await?.into_iter().next())
    }

    /// Register a webhook for a task after verifying URL ownership.
    pub async fn set_push_notification(
        &self,
        task_id: &str,
        config: weft_wire::PushNotificationConfig,
    ) -> Result<(), TaskError> {
        if !self.notifier.supports_push() {
            return Err(TaskError::PushNotificationUnsupported);
        }
        self.notifier.verify_url(&config.url).await?;
        self.push_configs
            .write()
            .await
            .insert(task_id.to_string(), config);
        Ok(())
    }

    pub async fn get_push_notification(
        &self,
        task_id: &str,
    ) -> Result<Option<weft_wire::PushNotificationConfig>, TaskError> {
        Ok(self.push_configs.read().await.get(task_id).cloned())
    }

    /// Best-effort push delivery: sign and POST, log and continue on
    /// any failure. Retry policy belongs to the receiver's side.
    pub async fn notify(&self, task_id: &str, payload: &Value) {
        let config = self.push_configs.read().await.get(task_id).cloned();
        let Some(config) = config else {
            return;
        };
        if let Err(err) = self.notifier.send(&config.url, payload).await {
            warn!(task = task_id, error = %err, "push notification delivery failed");
        }
    }

    async fn bound_task(&self, thread_id: &str) -> Result<String, TaskError> {
        self.threads
            .read()
            .await
            .get(thread_id)
            .cloned()
            .ok_or_else(|| TaskError::TaskNotFound(thread_id.to_string()))
    }

    fn validate(&self, params: &TaskSendParams) -> Result<(), TaskError> {
        if params.thread_id.trim().is_empty() {
            return Err(TaskError::InvalidInput("threadId is required".into()));
        }
        if params.id.trim().is_empty() {
            return Err(TaskError::InvalidInput("task id is required".into()));
        }
        let supported = self.engine.supported_output_modes();
        if !modalities_compatible(&params.accepted_output_modes, &supported) {
            return Err(TaskError::UnsupportedOutputMode {
                requested: params.accepted_output_modes.clone(),
                supported,
            });
        }
        Ok(())
    }

    async fn admit(&self, params: &TaskSendParams) -> Result<(Task, EngineInput), TaskError> {
        self.validate(params)?;
        if let Some(push) = &params.push_notification {
            self.set_push_notification(&params.id, push.clone()).await?;
        }
        let input = self.prepare_input(params).await?;
        let task = self.upsert_task(params).await;
        if let Ok(payload) = serde_json::to_value(&task) {
            self.notify(&task.id, &payload).await;
        }
        Ok((task, input))
    }

    async fn prepare_input(&self, params: &TaskSendParams) -> Result<EngineInput, TaskError> {
        match params.mode {
            RunMode::Run => {
                self.history_cache.write().await.remove(&params.thread_id);
                Ok(EngineInput::Run {
                    state: params.state.clone().unwrap_or_default(),
                })
            }
            RunMode::Resume => {
                let tasks = self.tasks.read().await;
                let task = tasks
                    .get(&params.id)
                    .ok_or_else(|| TaskError::TaskNotFound(params.id.clone()))?;
                if task.status.state != TaskState::InputRequired {
                    return Err(TaskError::InvalidInput(
                        "task is not awaiting input".into(),
                    ));
                }
                let value = params
                    .resume
                    .clone()
                    .ok_or_else(|| TaskError::InvalidInput("resume value is required".into()))?;
                Ok(EngineInput::Resume { value })
            }
            RunMode::Fork | RunMode::Replay => {
                let checkpoint_id = params
                    .checkpoint_id
                    .clone()
                    .ok_or_else(|| TaskError::InvalidInput("checkpointId is required".into()))?;
                let history = self.get_history(&params.thread_id).await?;
                let target = history
                    .iter()
                    .find(|cp| cp.config.checkpoint_id == checkpoint_id)
                    .cloned()
                    .ok_or_else(|| {
                        TaskError::InvalidInput(format!("unknown checkpoint: {checkpoint_id}"))
                    })?;
                // Truncate the known branch at the fork point; the
                // discarded descendants stay in the store's DAG but no
                // longer belong to this thread's working lineage.
                let lineage = lineage_of(&history, &target);
                self.history_cache
                    .write()
                    .await
                    .insert(params.thread_id.clone(), lineage);
                if params.mode == RunMode::Fork {
                    Ok(EngineInput::Fork {
                        checkpoint: target,
                        state: params.state.clone().unwrap_or_default(),
                    })
                } else {
                    Ok(EngineInput::Replay { checkpoint: target })
                }
            }
        }
    }

    async fn upsert_task(&self, params: &TaskSendParams) -> Task {
        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.entry(params.id.clone()).or_insert_with(|| {
                let mut task = Task::new(&params.id, &params.thread_id);
                task.session_id = params.session_id.clone();
                task.accepted_output_modes = params.accepted_output_modes.clone();
                task
            });
            task.advance(TaskStatus::new(TaskState::Working));
            task.clone()
        };
        let prior = self
            .threads
            .write()
            .await
            .insert(params.thread_id.clone(), params.id.clone());
        if let Some(prior_id) = prior {
            if prior_id != params.id {
                // Reset fan-out state for the thread: queues of the
                // superseded task get the close sentinel.
                self.subscribers.close(&prior_id).await;
            }
        }
        task
    }

    /// The cancel token is registered before either task is spawned,
    /// so a `stop` issued right after admission always finds it.
    async fn spawn_execution(&self, task: Task, input: EngineInput) {
        let cancel = self.cancellations.create(&task.id).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = EngineEmitter::new(tx);
        let engine = Arc::clone(&self.engine);
        let request = EngineRequest {
            thread_id: task.thread_id.clone(),
            input,
        };
        {
            let emitter = emitter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.run(request, emitter.clone(), cancel).await {
                    emitter.emit(EngineNotification::Failed {
                        message: err.to_string(),
                    });
                }
            });
        }
        drop(emitter);
        let manager = self.clone();
        tokio::spawn(async move { manager.pump(task, rx, cancel).await });
    }

    /// Drain engine notifications for one run: persist checkpoints,
    /// translate, and fan out. Events are held back by one so the last
    /// can carry `final = true`; the channel closing (engine finished,
    /// paused or halted) flushes it.
    async fn pump(
        &self,
        task: Task,
        mut rx: mpsc::UnboundedReceiver<EngineNotification>,
        cancel: CancellationToken,
    ) {
        let task_id = task.id.clone();
        let mut translator = EventTranslator::new();
        let mut pending: Option<StreamEvent> = None;
        let mut failed = false;
        let mut interrupted = false;
        while let Some(notification) = rx.recv().await {
            match &notification {
                EngineNotification::Checkpoint(checkpoint) => {
                    if let Err(err) = self.store.append(checkpoint.clone()).await {
                        error!(task = %task_id, error = %err, "failed to persist checkpoint");
                    }
                    let mut cache = self.history_cache.write().await;
                    if let Some(history) = cache.get_mut(&task.thread_id) {
                        history.insert(0, checkpoint.clone());
                    }
                    // a later checkpoint resolves any pending interrupt
                    interrupted = false;
                }
                EngineNotification::Interrupted(_) => interrupted = true,
                EngineNotification::Failed { .. } => failed = true,
                _ => {}
            }
            let event = translator.translate(notification);
            if let Some(prev) = pending.replace(event) {
                self.publish(&task_id, prev, false).await;
            }
        }

        let stopped = cancel.is_cancelled();
        if let Some(last) = pending.take() {
            self.publish(&task_id, last, true).await;
        }
        let final_state = if failed {
            TaskState::Failed
        } else if stopped {
            TaskState::Canceled
        } else if interrupted {
            TaskState::InputRequired
        } else {
            TaskState::Completed
        };
        self.update_status(&task_id, final_state).await;
        self.subscribers.close(&task_id).await;
        self.cancellations.remove(&task_id).await;
        self.stopping.write().await.remove(&task_id);
    }

    async fn publish(&self, task_id: &str, event: StreamEvent, is_final: bool) {
        self.subscribers
            .publish(
                task_id,
                StreamEnvelope::Event(TaskStreamResult {
                    task_id: task_id.to_string(),
                    is_final,
                    event,
                }),
            )
            .await;
    }

    async fn update_status(&self, task_id: &str, state: TaskState) {
        let task = {
            let mut tasks = self.tasks.write().await;
            tasks.get_mut(task_id).map(|task| {
                task.advance(TaskStatus::new(state));
                task.clone()
            })
        };
        if let Some(task) = task {
            if let Ok(payload) = serde_json::to_value(&task) {
                self.notify(task_id, &payload).await;
            }
        }
    }
}
