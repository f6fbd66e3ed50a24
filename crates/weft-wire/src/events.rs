use serde::{Deserialize, Serialize};

use weft_types::{Checkpoint, InterruptValue, MessageChunk, StateMap, StreamUpdate};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageChunkEvent {
    #[serde(rename = "nodeName")]
    pub node_name: String,
    #[serde(rename = "messageChunk")]
    pub message_chunk: MessageChunk,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamErrorEvent {
    pub message: String,
}

/// Outward protocol event, one per internal engine notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Checkpoint(Checkpoint),
    MessageChunk(MessageChunkEvent),
    StreamUpdate(StreamUpdate),
    Custom(StateMap),
    Interrupt(Vec<InterruptValue>),
    Error(StreamErrorEvent),
}

/// Streaming response `result` payload: one event plus its task binding
/// and the final marker. `final = true` tags the logically last event
/// for the task; the close sentinel is delivered out of band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStreamResult {
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(flatten)]
    pub event: StreamEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::CheckpointConfig;

    #[test]
    fn stream_result_flattens_event_tag() {
        let result = TaskStreamResult {
            task_id: "t1".into(),
            is_final: false,
            event: StreamEvent::MessageChunk(MessageChunkEvent {
                node_name: "respond".into(),
                message_chunk: MessageChunk {
                    id: "a1".into(),
                    content_delta: "He".into(),
                    tool_call_chunks: Vec::new(),
                    seq: Some(0),
                },
            }),
        };
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["taskId"], "t1");
        assert_eq!(value["final"], false);
        assert_eq!(value["event"], "message_chunk");
        assert_eq!(value["data"]["messageChunk"]["contentDelta"], "He");
    }

    #[test]
    fn checkpoint_event_round_trips() {
        let checkpoint = Checkpoint {
            config: CheckpointConfig::new("thread-1", "cp-1"),
            parent_config: None,
            values: StateMap::new(),
            next: vec!["respond".into()],
            metadata: Default::default(),
            interrupts: Vec::new(),
        };
        let result = TaskStreamResult {
            task_id: "t1".into(),
            is_final: true,
            event: StreamEvent::Checkpoint(checkpoint),
        };
        let raw = serde_json::to_string(&result).expect("serialize");
        let back: TaskStreamResult = serde_json::from_str(&raw).expect("decode");
        assert!(back.is_final);
        match back.event {
            StreamEvent::Checkpoint(cp) => assert_eq!(cp.config.checkpoint_id, "cp-1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn interrupt_event_decodes_single_element_array() {
        let raw = json!({
            "taskId": "t1",
            "final": true,
            "event": "interrupt",
            "data": [{"value": {"question": "continue?"}}]
        });
        let result: TaskStreamResult = serde_json::from_value(raw).expect("decode");
        match result.event {
            StreamEvent::Interrupt(values) => assert_eq!(values.len(), 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
