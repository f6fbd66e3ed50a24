use std::collections::HashMap;

use weft_types::EngineNotification;
use weft_wire::{MessageChunkEvent, StreamErrorEvent, StreamEvent};

/// Maps each internal engine notification to exactly one outward
/// protocol event. Stateful only for chunk sequencing: message chunks
/// get a monotonically increasing per-message `seq` so replicas can
/// drop duplicates on replay.
#[derive(Default)]
pub struct EventTranslator {
    chunk_seqs: HashMap<String, u64>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, notification: EngineNotification) -> StreamEvent {
        match notification {
            EngineNotification::Checkpoint(checkpoint) => StreamEvent::Checkpoint(checkpoint),
            EngineNotification::MessageChunk {
                node_name,
                mut chunk,
            } => {
                let seq = self.chunk_seqs.entry(chunk.id.clone()).or_insert(0);
                chunk.seq = Some(*seq);
                *seq += 1;
                StreamEvent::MessageChunk(MessageChunkEvent {
                    node_name,
                    message_chunk: chunk,
                })
            }
            EngineNotification::StreamUpdate(update) => StreamEvent::StreamUpdate(update),
            EngineNotification::Custom(state) => StreamEvent::Custom(state),
            EngineNotification::Interrupted(values) => StreamEvent::Interrupt(values),
            EngineNotification::Failed { message } => {
                StreamEvent::Error(StreamErrorEvent { message })
            }
        }
    }
}
