use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::StateMap;

/// Address of one checkpoint inside one thread's DAG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointConfig {
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "checkpointNs", default)]
    pub checkpoint_ns: String,
    #[serde(rename = "checkpointId")]
    pub checkpoint_id: String,
}

impl CheckpointConfig {
    pub fn new(thread_id: impl Into<String>, checkpoint_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: checkpoint_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub step: i64,
    /// Per-node partial state produced by the step that created this
    /// checkpoint. A node name may map to an object, or to an array of
    /// objects when the node ran multiple instances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writes: Option<StateMap>,
    #[serde(default, skip_serializing_if = "StateMap::is_empty")]
    pub parents: StateMap,
}

/// Value attached by the engine when it pauses for observer input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptValue {
    pub value: Value,
}

/// Immutable snapshot taken at a step boundary. Checkpoints form an
/// append-only DAG via `parent_config`; a linear history is the chain
/// from root to a leaf whose `next` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub config: CheckpointConfig,
    #[serde(rename = "parentConfig", skip_serializing_if = "Option::is_none")]
    pub parent_config: Option<CheckpointConfig>,
    #[serde(default)]
    pub values: StateMap,
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default)]
    pub metadata: CheckpointMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupts: Vec<InterruptValue>,
}

impl Checkpoint {
    /// A checkpoint with empty `next` closes its branch.
    pub fn is_branch_tip(&self) -> bool {
        self.next.is_empty()
    }
}

/// Walk the single parent chain starting at `tip`, returning the
/// lineage most-recent-first. Sibling forks off the chain are skipped.
/// With more than two sibling forks, selecting the tip by recency may
/// not match the branch a caller intends to resume; callers wanting a
/// specific branch must pass its own tip.
pub fn lineage_of(history: &[Checkpoint], tip: &Checkpoint) -> Vec<Checkpoint> {
    let by_id: std::collections::HashMap<&str, &Checkpoint> = history
        .iter()
        .map(|cp| (cp.config.checkpoint_id.as_str(), cp))
        .collect();
    let mut lineage = vec![tip.clone()];
    let mut cursor = tip.parent_config.as_ref();
    while let Some(parent) = cursor {
        match by_id.get(parent.checkpoint_id.as_str()) {
            Some(found) => {
                lineage.push((*found).clone());
                cursor = found.parent_config.as_ref();
            }
            None => break,
        }
    }
    lineage
}
