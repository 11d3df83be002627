use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::conversation::{ConversationSnapshot, ConversationStore};
use crate::events::{DisengageReason, EngagementEvent};
use crate::inbound::{InboundRouter, RouteOutcome};
use crate::message::InboundMessage;
use crate::runtime::BackendRuntime;

#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<ConversationStore>,
    pub router: Arc<InboundRouter>,
    pub self_id: String,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    self_id: String,
    active_conversations: usize,
}

#[derive(Debug, Serialize)]
struct RouteResponse {
    outcome: RouteOutcome,
}

#[derive(Debug, Serialize)]
struct DisengageResponse {
    disengaged: bool,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<EngagementEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("MURMUR_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8797".to_string())
        .parse::<SocketAddr>()
        .context("Invalid MURMUR_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        store: runtime.store.clone(),
        router: runtime.router.clone(),
        self_id: runtime.engine.self_id().to_string(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    runtime.spawn_schedulers();

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Murmur backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/events/messages", post(ingest_message))
        .route("/conversations", get(list_conversations))
        .route("/conversations/:channel_id", get(get_conversation))
        .route(
            "/conversations/:channel_id/disengage",
            post(disengage_conversation),
        )
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<EngagementEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_engagement_event(&event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_engagement_event(event: &EngagementEvent) -> ApiEventEnvelope {
    let mut payload = serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(fields) = payload.as_object_mut() {
        fields.remove("event_type");
    }
    ApiEventEnvelope {
        event_type: event.kind().to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("MURMUR_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("MURMUR_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "MURMUR_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid MURMUR_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if auth_value.trim() != format!("Bearer {}", token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        self_id: state.self_id.clone(),
        active_conversations: state.store.len(),
    })
}

async fn ingest_message(
    State(state): State<Arc<ServerState>>,
    Json(message): Json<InboundMessage>,
) -> Json<RouteResponse> {
    let outcome = state.router.route(&message);
    tracing::debug!("Inbound {} in {}: {:?}", message.id, message.channel_id, outcome);
    Json(RouteResponse { outcome })
}

async fn list_conversations(
    State(state): State<Arc<ServerState>>,
) -> Json<Vec<ConversationSnapshot>> {
    Json(state.store.list())
}

async fn get_conversation(
    State(state): State<Arc<ServerState>>,
    Path(channel_id): Path<String>,
) -> Result<Json<ConversationSnapshot>, (StatusCode, String)> {
    state
        .store
        .get(&channel_id)
        .map(Json)
        .ok_or_else(|| not_found(&channel_id))
}

async fn disengage_conversation(
    State(state): State<Arc<ServerState>>,
    Path(channel_id): Path<String>,
) -> Result<Json<DisengageResponse>, (StatusCode, String)> {
    if !state.store.disengage(&channel_id, DisengageReason::Operator) {
        return Err(not_found(&channel_id));
    }
    Ok(Json(DisengageResponse { disengaged: true }))
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Websocket client lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn not_found(channel_id: &str) -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("no conversation in channel '{}'", channel_id),
    )
}
