use thiserror::Error;

/// Protocol-level failure taxonomy. Synchronous rejections
/// (`InvalidInput`, `UnsupportedOutputMode`, `TaskNotFound`,
/// `TaskNotCancelable`) never create or mutate a task; execution
/// failures are terminal for the task; delivery failures are isolated
/// to one subscriber or one notification attempt.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unsupported output modes {requested:?}, supported {supported:?}")]
    UnsupportedOutputMode {
        requested: Vec<String>,
        supported: Vec<String>,
    },
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("task cannot be canceled: {0}")]
    TaskNotCancelable(String),
    #[error("push notifications are not supported")]
    PushNotificationUnsupported,
    #[error("push notification url failed verification: {0}")]
    PushUrlUnverified(String),
    #[error("engine execution failed: {0}")]
    EngineExecution(String),
    #[error("notification delivery failed: {0}")]
    NotificationDelivery(String),
    #[error("checkpoint store failure: {0}")]
    Storage(String),
}

impl TaskError {
    /// JSON-RPC error code for the wire envelope.
    pub fn code(&self) -> i64 {
        match self {
            TaskError::InvalidInput(_) | TaskError::PushUrlUnverified(_) => -32602,
            TaskError::UnsupportedOutputMode { .. } => -32005,
            TaskError::TaskNotFound(_) => -32001,
            TaskError::TaskNotCancelable(_) => -32002,
            TaskError::PushNotificationUnsupported => -32003,
            TaskError::EngineExecution(_)
            | TaskError::NotificationDelivery(_)
            | TaskError::Storage(_) => -32603,
        }
    }
}
