use std::collections::VecDeque;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use weft_types::{Checkpoint, Task};
use weft_wire::{
    methods, AgentCard, JsonRpcError, JsonRpcRequest, JsonRpcResponse, SseFrameDecoder, SseRecord,
    TaskIdParams, TaskQueryParams, TaskSendParams, TaskStreamResult,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("protocol error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("stream ended without the close sentinel")]
    UnexpectedEof,
}

impl From<JsonRpcError> for ClientError {
    fn from(err: JsonRpcError) -> Self {
        ClientError::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

/// One decoded record from a streaming response.
#[derive(Debug)]
pub enum DecodedRecord {
    Event(TaskStreamResult),
    /// An error envelope delivered on the stream.
    RpcError(JsonRpcError),
    Close,
}

/// Decodes framed transport records into protocol events. Malformed
/// records are never fatal: they are skipped and counted so tests and
/// operators can observe them.
#[derive(Default)]
pub struct RecordDecoder {
    frames: SseFrameDecoder,
    skipped: u64,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DecodedRecord> {
        let mut records = Vec::new();
        for record in self.frames.feed(bytes) {
            match record {
                SseRecord::Close => records.push(DecodedRecord::Close),
                SseRecord::Data(payload) => match decode_stream_record(&payload) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        self.skipped += 1;
                        warn!(error = %err, "skipping malformed stream record");
                    }
                },
            }
        }
        records
    }
}

fn decode_stream_record(payload: &str) -> Result<DecodedRecord, ClientError> {
    let envelope: JsonRpcResponse =
        serde_json::from_str(payload).map_err(|err| ClientError::Decode(err.to_string()))?;
    if let Some(error) = envelope.error {
        return Ok(DecodedRecord::RpcError(error));
    }
    let result = envelope
        .result
        .ok_or_else(|| ClientError::Decode("record carries neither result nor error".into()))?;
    let event: TaskStreamResult =
        serde_json::from_value(result).map_err(|err| ClientError::Decode(err.to_string()))?;
    Ok(DecodedRecord::Event(event))
}

/// Live event stream for one streaming request. The read loop may
/// suspend indefinitely awaiting the next framed record; cancellation
/// is caller-driven through the abort token and leaves the consumer's
/// replica in whatever partial state it reached.
pub struct EventStream {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: RecordDecoder,
    queued: VecDeque<DecodedRecord>,
    abort: CancellationToken,
    closed: bool,
    clean_close: bool,
}

impl EventStream {
    fn new(
        bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            bytes,
            decoder: RecordDecoder::new(),
            queued: VecDeque::new(),
            abort,
            closed: false,
            clean_close: false,
        }
    }

    /// Whether the stream ended with the deliberate close sentinel, as
    /// opposed to the connection dying or the caller aborting.
    pub fn closed_cleanly(&self) -> bool {
        self.clean_close
    }

    pub fn records_skipped(&self) -> u64 {
        self.decoder.skipped()
    }

    /// Next protocol event, or `None` once the stream is over. A
    /// connection dying before the sentinel surfaces `UnexpectedEof`
    /// first so callers can distinguish the two closures.
    pub async fn next_event(&mut self) -> Option<Result<TaskStreamResult, ClientError>> {
        loop {
            match self.queued.pop_front() {
                Some(DecodedRecord::Event(event)) => return Some(Ok(event)),
                Some(DecodedRecord::RpcError(error)) => return Some(Err(error.into())),
                Some(DecodedRecord::Close) => {
                    self.closed = true;
                    self.clean_close = true;
                    return None;
                }
                None => {}
            }
            if self.closed {
                return None;
            }
            tokio::select! {
                _ = self.abort.cancelled() => {
                    self.closed = true;
                    return None;
                }
                chunk = self.bytes.next() => match chunk {
                    None => {
                        self.closed = true;
                        return Some(Err(ClientError::UnexpectedEof));
                    }
                    Some(Err(err)) => {
                        self.closed = true;
                        return Some(Err(err.into()));
                    }
                    Some(Ok(bytes)) => {
                        self.queued.extend(self.decoder.feed(&bytes));
                    }
                },
            }
        }
    }
}

/// HTTP transport for the sync protocol: JSON-RPC calls plus the
/// streaming subscription and the history/state GET surface.
pub struct WeftClient {
    http: reqwest::Client,
    base_url: String,
}

impl WeftClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    pub async fn agent_card(&self) -> Result<AgentCard, ClientError> {
        let url = format!("{}/.well-known/agent.json", self.base_url);
        Ok(self.http.get(url).send().await?.json().await?)
    }

    pub async fn get_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, ClientError> {
        let url = format!("{}/history", self.base_url);
        Ok(self
            .http
            .get(url)
            .query(&[("thread_id", thread_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Latest checkpoint for the thread, if it has any history.
    pub async fn get_state(&self, thread_id: &str) -> Result<Option<Checkpoint>, ClientError> {
        let url = format!("{}/state", self.base_url);
        Ok(self
            .http
            .get(url)
            .query(&[("thread_id", thread_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    pub async fn send(&self, params: &TaskSendParams) -> Result<Task, ClientError> {
        let result = self.call(methods::SEND, serde_json::to_value(params).unwrap_or_default()).await?;
        serde_json::from_value(result).map_err(|err| ClientError::Decode(err.to_string()))
    }

    pub async fn get_task(
        &self,
        task_id: &str,
        history_length: Option<usize>,
    ) -> Result<Task, ClientError> {
        let params = TaskQueryParams {
            id: task_id.to_string(),
            history_length,
        };
        let result = self
            .call(methods::GET, serde_json::to_value(&params).unwrap_or_default())
            .await?;
        serde_json::from_value(result).map_err(|err| ClientError::Decode(err.to_string()))
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, ClientError> {
        let params = TaskIdParams {
            id: task_id.to_string(),
        };
        let result = self
            .call(methods::CANCEL, serde_json::to_value(&params).unwrap_or_default())
            .await?;
        serde_json::from_value(result).map_err(|err| ClientError::Decode(err.to_string()))
    }

    /// Open a streaming subscription for a send request. The returned
    /// stream suspends awaiting records until the sentinel, a transport
    /// failure, or an abort.
    pub async fn send_subscribe(
        &self,
        params: &TaskSendParams,
        abort: CancellationToken,
    ) -> Result<EventStream, ClientError> {
        let request = JsonRpcRequest::new(
            Value::from(uuid::Uuid::new_v4().to_string()),
            methods::SEND_SUBSCRIBE,
            serde_json::to_value(params).unwrap_or_default(),
        );
        let response = self
            .http
            .post(format!("{}/", self.base_url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(EventStream::new(bytes, abort))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let request = JsonRpcRequest::new(
            Value::from(uuid::Uuid::new_v4().to_string()),
            method,
            params,
        );
        let envelope: JsonRpcResponse = self
            .http
            .post(format!("{}/", self.base_url))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        if let Some(error) = envelope.error {
            return Err(error.into());
        }
        envelope
            .result
            .ok_or_else(|| ClientError::Decode("response carries neither result nor error".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: &Value) -> String {
        format!("data: {value}\n\n")
    }

    #[test]
    fn decoder_yields_events_and_close() {
        let mut decoder = RecordDecoder::new();
        let record = json!({
            "jsonrpc": "2.0",
            "id": "r1",
            "result": {
                "taskId": "t1",
                "final": false,
                "event": "custom",
                "data": {"phase": "planning"}
            }
        });
        let wire = format!("{}data: [DONE]\n\n", frame(&record));
        let records = decoder.feed(wire.as_bytes());
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], DecodedRecord::Event(event) if event.task_id == "t1"));
        assert!(matches!(records[1], DecodedRecord::Close));
        assert_eq!(decoder.skipped(), 0);
    }

    #[test]
    fn malformed_record_is_skipped_and_later_records_survive() {
        let mut decoder = RecordDecoder::new();
        let good = json!({
            "jsonrpc": "2.0",
            "id": "r1",
            "result": {"taskId": "t1", "final": true, "event": "interrupt", "data": []}
        });
        let wire = format!("data: {{not json\n\n{}", frame(&good));
        let records = decoder.feed(wire.as_bytes());
        assert_eq!(records.len(), 1);
        assert!(matches!(&records[0], DecodedRecord::Event(event) if event.is_final));
        assert_eq!(decoder.skipped(), 1);
    }

    #[test]
    fn error_envelope_surfaces_as_rpc_error() {
        let mut decoder = RecordDecoder::new();
        let record = json!({
            "jsonrpc": "2.0",
            "id": "r1",
            "error": {"code": -32603, "message": "boom"}
        });
        let records = decoder.feed(frame(&record).as_bytes());
        assert!(matches!(
            &records[0],
            DecodedRecord::RpcError(error) if error.code == -32603
        ));
    }
}
