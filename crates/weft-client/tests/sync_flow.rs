use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use weft_client::{ThreadSession, WeftClient};
use weft_core::{InMemoryCheckpointStore, PushNotifier, ScriptedEngine, TaskManager};
use weft_server::AppState;
use weft_types::{
    Checkpoint, CheckpointConfig, EngineNotification, MessageChunk, StateMap,
};
use weft_wire::{AgentCapabilities, AgentCard};

fn agent_card() -> AgentCard {
    AgentCard {
        name: "weft-test".into(),
        description: None,
        url: "http://127.0.0.1/".into(),
        version: "0.2.1".into(),
        capabilities: AgentCapabilities {
            streaming: true,
            push_notifications: false,
        },
        skills: Vec::new(),
    }
}

fn state_map(value: serde_json::Value) -> StateMap {
    value.as_object().expect("object").clone()
}

fn checkpoint(id: &str, parent: Option<&str>, next: &[&str], values: serde_json::Value) -> Checkpoint {
    Checkpoint {
        config: CheckpointConfig::new("thread-1", id),
        parent_config: parent.map(|p| CheckpointConfig::new("thread-1", p)),
        values: state_map(values),
        next: next.iter().map(|s| s.to_string()).collect(),
        metadata: Default::default(),
        interrupts: Vec::new(),
    }
}

fn chunk(id: &str, delta: &str) -> EngineNotification {
    EngineNotification::MessageChunk {
        node_name: "respond".into(),
        chunk: MessageChunk {
            id: id.into(),
            content_delta: delta.into(),
            tool_call_chunks: Vec::new(),
            seq: None,
        },
    }
}

async fn start_server(engine: ScriptedEngine) -> SocketAddr {
    let manager = TaskManager::new(
        Arc::new(engine),
        Arc::new(InMemoryCheckpointStore::new()),
        PushNotifier::disabled(),
    );
    let state = AppState::new(manager, agent_card());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, weft_server::app_router(state))
            .await
            .expect("serve");
    });
    addr
}

fn scripted_run() -> ScriptedEngine {
    let u1 = json!({"id": "u1", "type": "human", "content": "hi"});
    ScriptedEngine::new(vec![
        EngineNotification::Checkpoint(checkpoint(
            "c0",
            None,
            &["respond"],
            json!({"messages": [u1]}),
        )),
        chunk("a1", "He"),
        chunk("a1", "llo"),
        EngineNotification::Checkpoint(checkpoint(
            "c1",
            Some("c0"),
            &[],
            json!({"messages": [u1, {"id": "a1", "type": "ai", "content": "Hello"}]}),
        )),
    ])
}

#[tokio::test]
async fn run_streams_into_a_consistent_replica() {
    let addr = start_server(scripted_run()).await;
    let client = WeftClient::new(format!("http://{addr}"));
    let mut session = ThreadSession::new(client, "thread-1");

    session
        .run(
            state_map(json!({"messages": [{"id": "u1", "type": "human", "content": "hi"}]})),
            CancellationToken::new(),
        )
        .await
        .expect("run");

    let messages = session.replica().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].id, "a1");
    assert_eq!(messages[1].content, "Hello");

    let checkpoints = session.replica().checkpoints();
    assert_eq!(checkpoints.len(), 1);
    assert!(checkpoints[0].finalized);
}

#[tokio::test]
async fn restore_rebuilds_the_replica_from_stored_history() {
    let addr = start_server(scripted_run()).await;
    let client = WeftClient::new(format!("http://{addr}"));
    let mut session = ThreadSession::new(client, "thread-1");

    session
        .run(state_map(json!({"messages": []})), CancellationToken::new())
        .await
        .expect("run");

    // a second session restoring from history converges on the same view
    let client = WeftClient::new(format!("http://{addr}"));
    let mut restored = ThreadSession::new(client, "thread-1");
    let checkpoints = restored.restore().await.expect("restore");
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].checkpoint_config.checkpoint_id, "c0");
    assert_eq!(restored.replica().messages().len(), 2);
    assert_eq!(restored.replica().messages()[1].content, "Hello");
}

#[tokio::test]
async fn abort_stops_the_read_loop_without_rollback() {
    let engine = scripted_run().with_step_delay(Duration::from_millis(150));
    let addr = start_server(engine).await;
    let client = WeftClient::new(format!("http://{addr}"));
    let mut session = ThreadSession::new(client, "thread-1");

    let abort = CancellationToken::new();
    {
        let abort = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            abort.cancel();
        });
    }
    session
        .run(state_map(json!({"messages": []})), abort)
        .await
        .expect("aborted run still returns cleanly");

    // the replica keeps whatever partial state it reached
    assert!(session.replica().checkpoints().len() <= 1);
    assert!(session.task_id().is_some());
    // the server-side run keeps going until stopped or done; stopping
    // here races run completion, so only the signal itself is attempted
    let _ = session.stop().await;
}
