use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use weft_core::{
    EngineEmitter, EngineInput, EngineRequest, ExecutionEngine, InMemoryCheckpointStore, Jwk,
    PushNotifier, PushSigner, TaskManager, DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT,
};
use weft_server::{serve, AppState};
use weft_types::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, EngineNotification, MessageChunk, StateMap,
};
use weft_wire::{AgentCapabilities, AgentCard, AgentSkill};

#[derive(Parser, Debug)]
#[command(name = "weft-engine")]
#[command(about = "Headless Weft checkpoint-sync backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        /// RSA private key (PEM) used to sign push notifications.
        /// Without it, push notifications are advertised as
        /// unsupported.
        #[arg(long, env = "WEFT_PUSH_KEY_PEM")]
        push_key_pem: Option<PathBuf>,
        /// Public JWK matching the signing key, served from the JWKS
        /// endpoint.
        #[arg(long, env = "WEFT_PUSH_JWK")]
        push_jwk: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            hostname,
            port,
            push_key_pem,
            push_jwk,
        } => {
            let notifier = build_notifier(push_key_pem, push_jwk)?;
            let manager = TaskManager::new(
                Arc::new(EchoEngine),
                Arc::new(InMemoryCheckpointStore::new()),
                notifier,
            );
            let card = AgentCard {
                name: "Weft Echo Agent".to_string(),
                description: Some("Stand-in execution host that echoes its input".to_string()),
                url: format!("http://{hostname}:{port}/"),
                version: env!("CARGO_PKG_VERSION").to_string(),
                capabilities: AgentCapabilities {
                    streaming: true,
                    push_notifications: manager.supports_push(),
                },
                skills: vec![AgentSkill {
                    id: "echo".to_string(),
                    name: "echo".to_string(),
                    description: Some("Echoes the latest user message".to_string()),
                    input_modes: vec!["text".to_string()],
                    output_modes: vec!["text".to_string()],
                }],
            };
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid listen address")?;
            info!(%addr, "starting weft engine");
            serve(AppState::new(manager, card), addr).await
        }
    }
}

fn build_notifier(
    key_pem: Option<PathBuf>,
    jwk_path: Option<PathBuf>,
) -> anyhow::Result<PushNotifier> {
    match (key_pem, jwk_path) {
        (Some(key_pem), Some(jwk_path)) => {
            let pem = std::fs::read(&key_pem)
                .with_context(|| format!("reading {}", key_pem.display()))?;
            let jwk: Jwk = serde_json::from_slice(
                &std::fs::read(&jwk_path)
                    .with_context(|| format!("reading {}", jwk_path.display()))?,
            )
            .context("parsing push jwk")?;
            let signer = PushSigner::from_rsa_pem(&pem, jwk).context("loading push signing key")?;
            Ok(PushNotifier::with_signer(signer))
        }
        (None, None) => Ok(PushNotifier::disabled()),
        _ => anyhow::bail!("--push-key-pem and --push-jwk must be provided together"),
    }
}

/// Minimal built-in execution host so the server runs end-to-end
/// without an external graph: one open checkpoint, a chunked echo
/// reply, one terminal checkpoint. Honors the cooperative-cancel
/// contract between steps.
struct EchoEngine;

impl EchoEngine {
    fn reply_text(state: &StateMap) -> String {
        let prompt = state
            .get("messages")
            .and_then(|v| v.as_array())
            .and_then(|messages| messages.last())
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .unwrap_or("");
        format!("echo: {prompt}")
    }

    fn checkpoint(
        thread_id: &str,
        parent: Option<&CheckpointConfig>,
        values: StateMap,
        next: Vec<String>,
        step: i64,
    ) -> Checkpoint {
        Checkpoint {
            config: CheckpointConfig::new(thread_id, Uuid::new_v4().to_string()),
            parent_config: parent.cloned(),
            values,
            next,
            metadata: CheckpointMetadata {
                source: Some(if step == 0 { "input" } else { "loop" }.to_string()),
                step,
                writes: None,
                parents: StateMap::new(),
            },
            interrupts: Vec::new(),
        }
    }
}

#[async_trait]
impl ExecutionEngine for EchoEngine {
    async fn run(
        &self,
        request: EngineRequest,
        emitter: EngineEmitter,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let thread_id = request.thread_id;
        let (seed_values, parent, step) = match request.input {
            EngineInput::Run { state } => (state, None, 0),
            EngineInput::Resume { value } => {
                let mut state = StateMap::new();
                state.insert("resume".to_string(), value);
                (state, None, 0)
            }
            EngineInput::Fork { checkpoint, state } => {
                let mut values = checkpoint.values.clone();
                for (key, value) in state {
                    values.insert(key, value);
                }
                (values, Some(checkpoint.config), checkpoint.metadata.step)
            }
            EngineInput::Replay { checkpoint } => (
                checkpoint.values.clone(),
                Some(checkpoint.config),
                checkpoint.metadata.step,
            ),
        };

        let open = Self::checkpoint(
            &thread_id,
            parent.as_ref(),
            seed_values.clone(),
            vec!["respond".to_string()],
            step,
        );
        let open_config = open.config.clone();
        emitter.emit(EngineNotification::Checkpoint(open));

        let reply = Self::reply_text(&seed_values);
        let reply_id = Uuid::new_v4().to_string();
        let chars: Vec<char> = reply.chars().collect();
        for piece in chars.chunks(6) {
            if cancel.is_cancelled() {
                return Ok(());
            }
            emitter.emit(EngineNotification::MessageChunk {
                node_name: "respond".to_string(),
                chunk: MessageChunk {
                    id: reply_id.clone(),
                    content_delta: piece.iter().collect(),
                    tool_call_chunks: Vec::new(),
                    seq: None,
                },
            });
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        if cancel.is_cancelled() {
            return Ok(());
        }
        let mut final_values = seed_values;
        let reply_message: Value = json!({
            "id": reply_id,
            "type": "ai",
            "content": reply
        });
        let messages = final_values
            .entry("messages".to_string())
            .or_insert_with(|| json!([]));
        match messages.as_array_mut() {
            Some(messages) => messages.push(reply_message),
            None => *messages = json!([reply_message]),
        }
        emitter.emit(EngineNotification::Checkpoint(Self::checkpoint(
            &thread_id,
            Some(&open_config),
            final_values,
            Vec::new(),
            step + 1,
        )));
        Ok(())
    }
}
