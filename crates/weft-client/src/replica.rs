use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::{debug, warn};

use weft_types::{
    lineage_of, Checkpoint, CheckpointConfig, Message, MessageRole, StateMap, StreamUpdate,
    ToolCall, ToolCallChunk,
};
use weft_wire::{MessageChunkEvent, StreamEvent};

use crate::state_diff;

/// Locally materialized view of one pending node of the remote step.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSlot {
    pub name: String,
    pub state: StateMap,
}

/// Reconstructed view of one pending step of the remote execution.
/// Opened when a checkpoint with outstanding work arrives, finalized by
/// the next checkpoint, and only ever removed when a fork or replay
/// truncates the replica's history.
#[derive(Debug, Clone)]
pub struct AppCheckpoint {
    pub nodes: Vec<NodeSlot>,
    /// State at checkpoint creation, the diff baseline.
    pub state_initial: StateMap,
    /// Current state, mutated in place as updates arrive.
    pub state: StateMap,
    /// Non-symmetric "what's new" diff computed at finalization.
    pub state_diff: StateMap,
    pub checkpoint_config: CheckpointConfig,
    /// Pending interruption; present only on the most recent entry and
    /// cleared once a later checkpoint resolves it.
    pub interrupt_value: Option<Value>,
    pub error: bool,
    pub finalized: bool,
}

/// Client-side reconciliation engine: folds the protocol event stream
/// into an ordered checkpoint view, a flat message list and a progress
/// map. Single-threaded by construction: one event is fully applied
/// before the next is read.
#[derive(Debug, Default)]
pub struct ThreadReplica {
    checkpoints: Vec<AppCheckpoint>,
    messages: Vec<Message>,
    progress: BTreeMap<String, StreamUpdate>,
    chunk_seqs: HashMap<String, u64>,
    tool_arg_buffers: HashMap<String, String>,
    parse_failures: u64,
    interrupts_resolved: u64,
}

impl ThreadReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoints(&self) -> &[AppCheckpoint] {
        &self.checkpoints
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn progress(&self) -> &BTreeMap<String, StreamUpdate> {
        &self.progress
    }

    /// Count of tool-argument and message-list fragments that failed
    /// to parse and were retained raw. The merge contract is
    /// best-effort by design; this makes the failure mode observable.
    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    pub fn interrupts_resolved(&self) -> u64 {
        self.interrupts_resolved
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold one inbound protocol event into the replica.
    pub fn apply_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Checkpoint(checkpoint) => self.apply_checkpoint(checkpoint),
            StreamEvent::MessageChunk(chunk) => self.apply_message_chunk(chunk),
            StreamEvent::StreamUpdate(update) => {
                self.progress.insert(update.id.clone(), update);
            }
            StreamEvent::Custom(patch) => self.apply_custom(&patch),
            StreamEvent::Interrupt(values) => {
                if let (Some(last), Some(first)) = (self.checkpoints.last_mut(), values.first()) {
                    // only the first element is honored
                    last.interrupt_value = Some(first.value.clone());
                }
            }
            StreamEvent::Error(err) => {
                warn!(message = %err.message, "execution error reported on stream");
                if let Some(last) = self.checkpoints.last_mut() {
                    last.error = true;
                }
            }
        }
    }

    /// Rebuild the replica from a thread's stored history: select one
    /// branch by walking the parent chain from the most recent
    /// checkpoint, then fold that lineage oldest-first through the
    /// same per-checkpoint logic as live streaming. History is
    /// expected most-recent-first.
    pub fn restore_from_history(&mut self, history: &[Checkpoint]) {
        self.reset();
        let Some(tip) = history.first() else {
            return;
        };
        let lineage = lineage_of(history, tip);
        for checkpoint in lineage.iter().rev() {
            self.apply_checkpoint(checkpoint.clone());
        }
    }

    /// Truncate to and including the entry whose config matches the
    /// target id, discarding later entries. Returns false when the id
    /// is not part of the replica's history.
    pub fn truncate_at(&mut self, checkpoint_id: &str) -> bool {
        match self
            .checkpoints
            .iter()
            .position(|cp| cp.checkpoint_config.checkpoint_id == checkpoint_id)
        {
            Some(pos) => {
                self.checkpoints.truncate(pos + 1);
                true
            }
            None => false,
        }
    }

    fn apply_checkpoint(&mut self, checkpoint: Checkpoint) {
        if let Some(open) = self.checkpoints.last_mut().filter(|cp| !cp.finalized) {
            open.state = checkpoint.values.clone();
            open.state_diff = state_diff(&open.state_initial, &checkpoint.values);
            if let Some(writes) = &checkpoint.metadata.writes {
                apply_node_writes(&mut open.nodes, writes);
            }
            if open.interrupt_value.take().is_some() {
                self.interrupts_resolved += 1;
                debug!(
                    checkpoint = %open.checkpoint_config.checkpoint_id,
                    "pending interrupt resolved"
                );
            }
            open.finalized = true;
        }
        if let Some(messages) = checkpoint.values.get("messages") {
            self.overwrite_messages(messages);
        }
        if !checkpoint.next.is_empty() {
            let interrupt_value = checkpoint.interrupts.first().map(|i| i.value.clone());
            self.checkpoints.push(AppCheckpoint {
                nodes: checkpoint
                    .next
                    .iter()
                    .map(|name| NodeSlot {
                        name: name.clone(),
                        state: StateMap::new(),
                    })
                    .collect(),
                state_initial: checkpoint.values.clone(),
                state: checkpoint.values.clone(),
                state_diff: StateMap::new(),
                checkpoint_config: checkpoint.config.clone(),
                interrupt_value,
                error: false,
                finalized: false,
            });
        }
    }

    /// The checkpoint's own message list is authoritative: replace
    /// wholesale, never merge.
    fn overwrite_messages(&mut self, value: &Value) {
        match serde_json::from_value::<Vec<Message>>(value.clone()) {
            Ok(messages) => self.messages = messages,
            Err(err) => {
                self.parse_failures += 1;
                warn!(error = %err, "authoritative message list could not be decoded");
            }
        }
    }

    fn apply_message_chunk(&mut self, event: MessageChunkEvent) {
        let chunk = event.message_chunk;
        if let Some(seq) = chunk.seq {
            if let Some(&last) = self.chunk_seqs.get(&chunk.id) {
                if seq <= last {
                    debug!(message = %chunk.id, seq, "duplicate chunk dropped");
                    return;
                }
            }
            self.chunk_seqs.insert(chunk.id.clone(), seq);
        }
        let position = self.messages.iter().position(|m| m.id == chunk.id);
        match position {
            None => {
                let mut message =
                    Message::with_id(chunk.id.clone(), MessageRole::Ai, chunk.content_delta);
                for fragment in &chunk.tool_call_chunks {
                    merge_tool_fragment(
                        &mut message.tool_calls,
                        &mut self.tool_arg_buffers,
                        &mut self.parse_failures,
                        fragment,
                    );
                }
                self.messages.push(message);
            }
            Some(pos) => {
                let message = &mut self.messages[pos];
                message.content.push_str(&chunk.content_delta);
                for fragment in &chunk.tool_call_chunks {
                    merge_tool_fragment(
                        &mut message.tool_calls,
                        &mut self.tool_arg_buffers,
                        &mut self.parse_failures,
                        fragment,
                    );
                }
            }
        }
    }

    /// Broadcast semantics: every pending node is assumed to share the
    /// patched fields.
    fn apply_custom(&mut self, patch: &StateMap) {
        let Some(last) = self.checkpoints.last_mut() else {
            return;
        };
        for (key, value) in patch {
            last.state.insert(key.clone(), value.clone());
        }
        for node in &mut last.nodes {
            for (key, value) in patch {
                node.state.insert(key.clone(), value.clone());
            }
        }
    }
}

fn shallow_merge(target: &mut StateMap, patch: &StateMap) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

/// Apply per-node writes onto pending node slots by name. A node name
/// mapping to an array is index-aligned across slots with that name;
/// an object write lands on every matching slot.
fn apply_node_writes(nodes: &mut [NodeSlot], writes: &StateMap) {
    for (name, value) in writes {
        let slots: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| &node.name == name)
            .map(|(idx, _)| idx)
            .collect();
        if slots.is_empty() {
            continue;
        }
        match value {
            Value::Array(items) => {
                for (slot, item) in slots.iter().zip(items.iter()) {
                    if let Value::Object(map) = item {
                        shallow_merge(&mut nodes[*slot].state, map);
                    }
                }
            }
            Value::Object(map) => {
                for slot in slots {
                    shallow_merge(&mut nodes[slot].state, map);
                }
            }
            _ => {}
        }
    }
}

/// Best-effort tool-argument merging, matching the upstream contract:
/// string fragments accumulate per call and are parsed only once they
/// form a complete JSON value, then shallow-merged into the running
/// args. Parse failures are swallowed, the raw text retained, and the
/// failure counted.
fn merge_tool_fragment(
    tool_calls: &mut Vec<ToolCall>,
    buffers: &mut HashMap<String, String>,
    parse_failures: &mut u64,
    fragment: &ToolCallChunk,
) {
    let position = if let Some(id) = &fragment.id {
        match tool_calls.iter().position(|call| &call.id == id) {
            Some(pos) => Some(pos),
            None => {
                tool_calls.push(ToolCall {
                    id: id.clone(),
                    name: fragment.name.clone().unwrap_or_default(),
                    args: Value::Null,
                });
                Some(tool_calls.len() - 1)
            }
        }
    } else if let Some(index) = fragment.index {
        let idx = index as usize;
        (idx < tool_calls.len()).then_some(idx)
    } else if !tool_calls.is_empty() {
        Some(tool_calls.len() - 1)
    } else {
        None
    };
    let Some(pos) = position else {
        return;
    };
    let call = &mut tool_calls[pos];
    if let Some(name) = &fragment.name {
        if !name.is_empty() {
            call.name = name.clone();
        }
    }
    let Some(args_fragment) = &fragment.args else {
        return;
    };
    let buffer = buffers.entry(call.id.clone()).or_default();
    buffer.push_str(args_fragment);
    match serde_json::from_str::<Value>(buffer) {
        Ok(Value::Object(parsed)) => match &mut call.args {
            Value::Object(existing) => shallow_merge(existing, &parsed),
            _ => call.args = Value::Object(parsed),
        },
        Ok(other) => call.args = other,
        Err(_) => {
            *parse_failures += 1;
            if call.args.is_null() {
                call.args = Value::String(buffer.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::{InterruptValue, MessageChunk};

    fn state(value: Value) -> StateMap {
        value.as_object().expect("object").clone()
    }

    fn checkpoint(id: &str, parent: Option<&str>, next: &[&str], values: Value) -> Checkpoint {
        Checkpoint {
            config: CheckpointConfig::new("thread-1", id),
            parent_config: parent.map(|p| CheckpointConfig::new("thread-1", p)),
            values: state(values),
            next: next.iter().map(|s| s.to_string()).collect(),
            metadata: Default::default(),
            interrupts: Vec::new(),
        }
    }

    fn chunk_event(id: &str, delta: &str, seq: Option<u64>) -> StreamEvent {
        StreamEvent::MessageChunk(MessageChunkEvent {
            node_name: "respond".into(),
            message_chunk: MessageChunk {
                id: id.into(),
                content_delta: delta.into(),
                tool_call_chunks: Vec::new(),
                seq,
            },
        })
    }

    fn tool_chunk_event(
        message_id: &str,
        seq: u64,
        fragment: ToolCallChunk,
    ) -> StreamEvent {
        StreamEvent::MessageChunk(MessageChunkEvent {
            node_name: "respond".into(),
            message_chunk: MessageChunk {
                id: message_id.into(),
                content_delta: String::new(),
                tool_call_chunks: vec![fragment],
                seq: Some(seq),
            },
        })
    }

    #[test]
    fn streamed_run_reconciles_into_one_finalized_checkpoint() {
        let mut replica = ThreadReplica::new();
        let u1 = json!({"id": "u1", "type": "human", "content": "hi"});
        replica.apply_event(StreamEvent::Checkpoint(checkpoint(
            "c0",
            None,
            &["respond"],
            json!({"messages": [u1]}),
        )));
        replica.apply_event(chunk_event("a1", "He", Some(0)));
        replica.apply_event(chunk_event("a1", "llo", Some(1)));
        replica.apply_event(StreamEvent::Checkpoint(checkpoint(
            "c1",
            Some("c0"),
            &[],
            json!({"messages": [u1, {"id": "a1", "type": "ai", "content": "Hello"}]}),
        )));

        assert_eq!(replica.checkpoints().len(), 1);
        assert!(replica.checkpoints()[0].finalized);
        let messages = replica.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "u1");
        assert_eq!(messages[1].id, "a1");
        assert_eq!(messages[1].content, "Hello");
        // the diff reports only the new assistant message
        let diff = &replica.checkpoints()[0].state_diff;
        assert_eq!(
            diff["messages"],
            json!([{"id": "a1", "type": "ai", "content": "Hello"}])
        );
    }

    #[test]
    fn sequenced_chunk_replay_is_idempotent() {
        let mut replica = ThreadReplica::new();
        replica.apply_event(chunk_event("a1", "He", Some(0)));
        replica.apply_event(chunk_event("a1", "He", Some(0)));
        replica.apply_event(chunk_event("a1", "llo", Some(1)));
        assert_eq!(replica.messages()[0].content, "Hello");
    }

    #[test]
    fn unsequenced_chunks_apply_unconditionally() {
        // producers that do not number chunks keep the upstream
        // at-least-once behavior
        let mut replica = ThreadReplica::new();
        replica.apply_event(chunk_event("a1", "He", None));
        replica.apply_event(chunk_event("a1", "He", None));
        assert_eq!(replica.messages()[0].content, "HeHe");
    }

    #[test]
    fn finalized_count_matches_checkpoints_with_pending_predecessors() {
        let mut replica = ThreadReplica::new();
        replica.apply_event(StreamEvent::Checkpoint(checkpoint(
            "c0",
            None,
            &["plan"],
            json!({}),
        )));
        replica.apply_event(StreamEvent::Checkpoint(checkpoint(
            "c1",
            Some("c0"),
            &["respond"],
            json!({}),
        )));
        replica.apply_event(StreamEvent::Checkpoint(checkpoint(
            "c2",
            Some("c1"),
            &[],
            json!({}),
        )));
        let finalized = replica
            .checkpoints()
            .iter()
            .filter(|cp| cp.finalized)
            .count();
        assert_eq!(finalized, 2);
        assert_eq!(replica.checkpoints().len(), 2);
    }

    #[test]
    fn node_writes_are_index_aligned_for_arrays() {
        let mut replica = ThreadReplica::new();
        replica.apply_event(StreamEvent::Checkpoint(checkpoint(
            "c0",
            None,
            &["search", "search", "plan"],
            json!({}),
        )));
        let mut closing = checkpoint("c1", Some("c0"), &[], json!({}));
        closing.metadata.writes = Some(state(json!({
            "search": [{"hits": 3}, {"hits": 7}],
            "plan": {"steps": 2}
        })));
        replica.apply_event(StreamEvent::Checkpoint(closing));

        let nodes = &replica.checkpoints()[0].nodes;
        assert_eq!(nodes[0].state["hits"], json!(3));
        assert_eq!(nodes[1].state["hits"], json!(7));
        assert_eq!(nodes[2].state["steps"], json!(2));
    }

    #[test]
    fn tool_argument_fragments_merge_best_effort() {
        let mut replica = ThreadReplica::new();
        replica.apply_event(tool_chunk_event(
            "a1",
            0,
            ToolCallChunk {
                id: Some("call-1".into()),
                name: Some("web_search".into()),
                args: Some("{\"query".into()),
                index: Some(0),
            },
        ));
        // incomplete json so far: swallowed, retained raw, counted
        assert_eq!(replica.parse_failures(), 1);
        assert_eq!(
            replica.messages()[0].tool_calls[0].args,
            json!("{\"query")
        );

        replica.apply_event(tool_chunk_event(
            "a1",
            1,
            ToolCallChunk {
                id: Some("call-1".into()),
                name: None,
                args: Some("\": \"rust\"}".into()),
                index: Some(0),
            },
        ));
        let call = &replica.messages()[0].tool_calls[0];
        assert_eq!(call.name, "web_search");
        assert_eq!(call.args, json!({"query": "rust"}));
        assert_eq!(replica.parse_failures(), 1);
    }

    #[test]
    fn custom_patch_broadcasts_to_state_and_every_node() {
        let mut replica = ThreadReplica::new();
        replica.apply_event(StreamEvent::Checkpoint(checkpoint(
            "c0",
            None,
            &["search", "plan"],
            json!({}),
        )));
        replica.apply_event(StreamEvent::Custom(state(json!({"phase": "gathering"}))));
        let last = &replica.checkpoints()[0];
        assert_eq!(last.state["phase"], json!("gathering"));
        assert!(last
            .nodes
            .iter()
            .all(|node| node.state["phase"] == json!("gathering")));
    }

    #[test]
    fn interrupt_attaches_and_resolves_on_the_next_checkpoint() {
        let mut replica = ThreadReplica::new();
        let mut paused = checkpoint("c0", None, &["approve"], json!({}));
        paused.interrupts = vec![InterruptValue {
            value: json!({"question": "continue?"}),
        }];
        replica.apply_event(StreamEvent::Checkpoint(paused));
        assert_eq!(
            replica.checkpoints()[0].interrupt_value,
            Some(json!({"question": "continue?"}))
        );

        replica.apply_event(StreamEvent::Checkpoint(checkpoint(
            "c1",
            Some("c0"),
            &[],
            json!({}),
        )));
        assert_eq!(replica.checkpoints()[0].interrupt_value, None);
        assert_eq!(replica.interrupts_resolved(), 1);
    }

    #[test]
    fn error_event_marks_the_last_checkpoint_without_clearing_state() {
        let mut replica = ThreadReplica::new();
        replica.apply_event(StreamEvent::Checkpoint(checkpoint(
            "c0",
            None,
            &["respond"],
            json!({"plan": "draft"}),
        )));
        replica.apply_event(StreamEvent::Error(weft_wire::StreamErrorEvent {
            message: "step exploded".into(),
        }));
        let last = &replica.checkpoints()[0];
        assert!(last.error);
        assert_eq!(last.state["plan"], json!("draft"));
    }

    #[test]
    fn restore_walks_a_single_lineage_and_skips_sibling_forks() {
        let u1 = json!({"id": "u1", "type": "human", "content": "hi"});
        let history = vec![
            checkpoint(
                "c2",
                Some("c1"),
                &[],
                json!({"messages": [u1, {"id": "a1", "type": "ai", "content": "Hello"}]}),
            ),
            checkpoint("c1b", Some("c0"), &["other"], json!({"messages": []})),
            checkpoint("c1", Some("c0"), &["respond"], json!({"messages": [u1]})),
            checkpoint("c0", None, &["plan"], json!({})),
        ];
        let mut replica = ThreadReplica::new();
        replica.restore_from_history(&history);

        assert_eq!(replica.checkpoints().len(), 2);
        assert_eq!(
            replica.checkpoints()[0].checkpoint_config.checkpoint_id,
            "c0"
        );
        assert_eq!(
            replica.checkpoints()[1].checkpoint_config.checkpoint_id,
            "c1"
        );
        // messages seeded from the last checkpoint carrying them
        assert_eq!(replica.messages().len(), 2);
        assert_eq!(replica.messages()[1].content, "Hello");
    }

    #[test]
    fn restore_then_truncate_at_the_tip_changes_nothing() {
        let mut pending = checkpoint("c1", Some("c0"), &["approve"], json!({}));
        pending.interrupts = vec![InterruptValue {
            value: json!("confirm"),
        }];
        let history = vec![pending, checkpoint("c0", None, &["plan"], json!({}))];
        let mut replica = ThreadReplica::new();
        replica.restore_from_history(&history);

        let before = replica.checkpoints().len();
        assert!(replica.truncate_at("c1"));
        assert_eq!(replica.checkpoints().len(), before);
        assert_eq!(
            replica.checkpoints().last().and_then(|cp| cp.interrupt_value.clone()),
            Some(json!("confirm"))
        );
    }

    #[test]
    fn unparsable_authoritative_messages_are_swallowed_and_counted() {
        let mut replica = ThreadReplica::new();
        replica.apply_event(chunk_event("a1", "Hi", Some(0)));
        replica.apply_event(StreamEvent::Checkpoint(checkpoint(
            "c0",
            None,
            &[],
            json!({"messages": "not a list"}),
        )));
        assert_eq!(replica.parse_failures(), 1);
        assert_eq!(replica.messages().len(), 1);
    }

    #[test]
    fn progress_updates_upsert_by_id() {
        let mut replica = ThreadReplica::new();
        let update = |status: &str| {
            serde_json::from_value::<StreamUpdate>(json!({
                "id": "search-1",
                "status": status,
                "title": "Searching",
                "message": ""
            }))
            .expect("update")
        };
        replica.apply_event(StreamEvent::StreamUpdate(update("running")));
        replica.apply_event(StreamEvent::StreamUpdate(update("completed")));
        assert_eq!(replica.progress().len(), 1);
        assert_eq!(
            serde_json::to_value(&replica.progress()["search-1"].status).expect("status"),
            json!("completed")
        );
    }
}
