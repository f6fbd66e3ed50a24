use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Canceled,
    Failed,
}

impl TaskState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Canceled | TaskState::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    pub timestamp: DateTime<Utc>,
}

impl TaskStatus {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(state: TaskState, message: Message) -> Self {
        Self {
            state,
            message: Some(message),
            timestamp: Utc::now(),
        }
    }
}

/// One logical unit of work bound to a thread. Mutated only by the task
/// manager; observers receive clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<TaskStatus>,
    #[serde(rename = "acceptedOutputModes", default)]
    pub accepted_output_modes: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            session_id: None,
            status: TaskStatus::new(TaskState::Submitted),
            history: Vec::new(),
            accepted_output_modes: Vec::new(),
        }
    }

    /// Push the current status into history and replace it.
    pub fn advance(&mut self, status: TaskStatus) {
        let prior = std::mem::replace(&mut self.status, status);
        self.history.push(prior);
    }

    /// Copy with history trimmed to the most recent `len` entries, the
    /// shape handed back by `tasks/get`.
    pub fn with_history_trimmed(&self, len: Option<usize>) -> Task {
        let mut task = self.clone();
        if let Some(len) = len {
            let keep = task.history.len().saturating_sub(len);
            task.history.drain(..keep);
        }
        task
    }
}
