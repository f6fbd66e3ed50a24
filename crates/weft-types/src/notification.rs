use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Checkpoint, InterruptValue, MessageChunk, StateMap};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamUpdateStatus {
    Started,
    Running,
    Completed,
    Failed,
}

/// Engine-level progress note for long-running steps. Updates with the
/// same id replace each other on the observer side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamUpdate {
    pub id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub update_type: Option<String>,
    pub status: StreamUpdateStatus,
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "completedSteps", skip_serializing_if = "Option::is_none")]
    pub completed_steps: Option<u32>,
    #[serde(rename = "totalSteps", skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Internal emission from the execution engine, one per notable moment
/// of a run. The task manager translates each into exactly one outward
/// protocol event.
#[derive(Debug, Clone)]
pub enum EngineNotification {
    /// A new checkpoint was produced at a step boundary.
    Checkpoint(Checkpoint),
    /// Token/tool-arg fragment for one message, attributed to the node
    /// that produced it.
    MessageChunk {
        node_name: String,
        chunk: MessageChunk,
    },
    /// Progress note outside the state graph.
    StreamUpdate(StreamUpdate),
    /// Partial-state patch outside checkpoint boundaries.
    Custom(StateMap),
    /// The engine paused and wants observer input before continuing.
    Interrupted(Vec<InterruptValue>),
    /// Unrecoverable step failure; the run is over.
    Failed { message: String },
}
