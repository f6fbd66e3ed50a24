use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use weft_core::{StreamEnvelope, Subscription};
use weft_types::TaskError;
use weft_wire::{
    methods, JsonRpcError, JsonRpcRequest, JsonRpcResponse, TaskIdParams, TaskPushNotificationParams,
    TaskQueryParams, TaskSendParams, CLOSE_SENTINEL,
};

use crate::AppState;

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(process_request))
        .route("/.well-known/agent.json", get(agent_card))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/history", get(thread_history))
        .route("/state", get(thread_state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "weft server listening");
    axum::serve(listener, app_router(state)).await?;
    Ok(())
}

async fn agent_card(State(state): State<AppState>) -> Json<weft_wire::AgentCard> {
    Json(state.card.clone())
}

async fn jwks(State(state): State<AppState>) -> Json<Value> {
    Json(state.manager.jwks())
}

#[derive(Debug, Deserialize)]
struct ThreadQuery {
    thread_id: Option<String>,
}

async fn thread_history(
    State(state): State<AppState>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<Value>, StatusCode> {
    let thread_id = query.thread_id.ok_or(StatusCode::BAD_REQUEST)?;
    let history = state
        .manager
        .get_history(&thread_id)
        .await
        .map_err(task_error_status)?;
    serde_json::to_value(history)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn thread_state(
    State(state): State<AppState>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<Value>, StatusCode> {
    let thread_id = query.thread_id.ok_or(StatusCode::BAD_REQUEST)?;
    let snapshot = state
        .manager
        .get_state(&thread_id)
        .await
        .map_err(task_error_status)?;
    serde_json::to_value(snapshot)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn task_error_status(err: TaskError) -> StatusCode {
    match err {
        TaskError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        TaskError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Single JSON-RPC endpoint. Streaming methods negotiate a framed
/// record stream when the request accepts `text/event-stream`;
/// everything else gets one JSON envelope.
async fn process_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let raw: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "request body is not json");
            return json_failure(None, JsonRpcError::parse_error());
        }
    };
    let request: JsonRpcRequest = match serde_json::from_value(raw.clone()) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "request envelope rejected");
            return json_failure(raw.get("id").cloned(), JsonRpcError::invalid_request());
        }
    };
    let id = request.id.clone();
    match request.method.as_str() {
        methods::SEND => {
            let params: TaskSendParams = match decode_params(request.params) {
                Ok(params) => params,
                Err(error) => return json_failure(id, error),
            };
            match state.manager.send(params).await {
                Ok(task) => json_success(id, &task),
                Err(err) => json_failure(id, JsonRpcError::from(&err)),
            }
        }
        methods::SEND_SUBSCRIBE => {
            let params: TaskSendParams = match decode_params(request.params) {
                Ok(params) => params,
                Err(error) => return json_failure(id, error),
            };
            if !accepts_event_stream(&headers) {
                // the server declines streaming; same admission path,
                // single envelope back
                return match state.manager.send(params).await {
                    Ok(task) => json_success(id, &task),
                    Err(err) => json_failure(id, JsonRpcError::from(&err)),
                };
            }
            match state.manager.send_subscribe(params).await {
                Ok((_, subscription)) => event_stream_response(id, subscription),
                Err(err) => json_failure(id, JsonRpcError::from(&err)),
            }
        }
        methods::RESUBSCRIBE => {
            let params: TaskIdParams = match decode_params(request.params) {
                Ok(params) => params,
                Err(error) => return json_failure(id, error),
            };
            if !accepts_event_stream(&headers) {
                return json_failure(
                    id,
                    JsonRpcError::new(-32004, "resubscription requires a streaming client"),
                );
            }
            match state.manager.open_subscription(&params.id).await {
                Ok(subscription) => event_stream_response(id, subscription),
                Err(err) => json_failure(id, JsonRpcError::from(&err)),
            }
        }
        methods::GET => {
            let params: TaskQueryParams = match decode_params(request.params) {
                Ok(params) => params,
                Err(error) => return json_failure(id, error),
            };
            match state.manager.get_task(&params.id, params.history_length).await {
                Ok(task) => json_success(id, &task),
                Err(err) => json_failure(id, JsonRpcError::from(&err)),
            }
        }
        methods::CANCEL => {
            let params: TaskIdParams = match decode_params(request.params) {
                Ok(params) => params,
                Err(error) => return json_failure(id, error),
            };
            match state.manager.cancel(&params.id).await {
                Ok(task) => json_success(id, &task),
                Err(err) => json_failure(id, JsonRpcError::from(&err)),
            }
        }
        methods::PUSH_NOTIFICATION_SET => {
            let params: TaskPushNotificationParams = match decode_params(request.params) {
                Ok(params) => params,
                Err(error) => return json_failure(id, error),
            };
            match state
                .manager
                .set_push_notification(&params.id, params.push_notification_config.clone())
                .await
            {
                Ok(()) => json_success(id, &params),
                Err(err) => json_failure(id, JsonRpcError::from(&err)),
            }
        }
        methods::PUSH_NOTIFICATION_GET => {
            let params: TaskIdParams = match decode_params(request.params) {
                Ok(params) => params,
                Err(error) => return json_failure(id, error),
            };
            match state.manager.get_push_notification(&params.id).await {
                Ok(config) => json_success(id, &config),
                Err(err) => json_failure(id, JsonRpcError::from(&err)),
            }
        }
        other => json_failure(id, JsonRpcError::method_not_found(other)),
    }
}

fn decode_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, JsonRpcError> {
    serde_json::from_value(params)
        .map_err(|err| JsonRpcError::new(-32602, format!("Invalid params: {err}")))
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("text/event-stream"))
        .unwrap_or(false)
}

fn json_success<T: serde::Serialize>(id: Option<Value>, result: &T) -> Response {
    match serde_json::to_value(result) {
        Ok(value) => Json(JsonRpcResponse::success(id, value)).into_response(),
        Err(err) => {
            warn!(error = %err, "failed to encode result");
            json_failure(id, JsonRpcError::internal("failed to encode result"))
        }
    }
}

fn json_failure(id: Option<Value>, error: JsonRpcError) -> Response {
    Json(JsonRpcResponse::failure(id, error)).into_response()
}

fn event_stream_response(request_id: Option<Value>, subscription: Subscription) -> Response {
    Sse::new(subscription_stream(request_id, subscription))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
        .into_response()
}

/// Render a subscription queue as framed records. Each protocol event
/// rides in its own JSON-RPC envelope; the close sentinel is the last
/// record before the stream ends.
fn subscription_stream(
    request_id: Option<Value>,
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut rx = subscription.rx;
        while let Some(envelope) = rx.recv().await {
            match envelope {
                StreamEnvelope::Event(result) => {
                    let payload = match serde_json::to_value(&result) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(error = %err, "failed to encode stream event");
                            continue;
                        }
                    };
                    let response = JsonRpcResponse::success(request_id.clone(), payload);
                    match serde_json::to_string(&response) {
                        Ok(data) => yield Ok(Event::default().data(data)),
                        Err(err) => warn!(error = %err, "failed to encode stream record"),
                    }
                }
                StreamEnvelope::Close => {
                    yield Ok(Event::default().data(CLOSE_SENTINEL));
                    break;
                }
            }
        }
    }
}
