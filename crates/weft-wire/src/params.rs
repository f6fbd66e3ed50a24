use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::PushNotificationConfig;
use weft_types::StateMap;

/// How a send request enters the execution graph.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Fresh run against an initial state.
    #[default]
    Run,
    /// Re-enter a paused run with a resume value.
    Resume,
    /// Branch from an interior checkpoint with overridden state.
    Fork,
    /// Re-execute forward from a checkpoint without altering state.
    Replay,
}

/// Params for `tasks/send` and `tasks/sendSubscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSendParams {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Value>,
    #[serde(rename = "checkpointId", default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(rename = "acceptedOutputModes", default)]
    pub accepted_output_modes: Vec<String>,
    #[serde(
        rename = "pushNotification",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub push_notification: Option<PushNotificationConfig>,
    #[serde(rename = "historyLength", default, skip_serializing_if = "Option::is_none")]
    pub history_length: Option<usize>,
}

impl TaskSendParams {
    pub fn run(id: impl Into<String>, thread_id: impl Into<String>, state: StateMap) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            session_id: None,
            mode: RunMode::Run,
            state: Some(state),
            resume: None,
            checkpoint_id: None,
            accepted_output_modes: Vec::new(),
            push_notification: None,
            history_length: None,
        }
    }
}

/// Params for `tasks/get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueryParams {
    pub id: String,
    #[serde(rename = "historyLength", default, skip_serializing_if = "Option::is_none")]
    pub history_length: Option<usize>,
}

/// Params for `tasks/cancel` and `tasks/resubscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdParams {
    pub id: String,
}

/// Params for `tasks/pushNotification/set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPushNotificationParams {
    pub id: String,
    #[serde(rename = "pushNotificationConfig")]
    pub push_notification_config: PushNotificationConfig,
}
