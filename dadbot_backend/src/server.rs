use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::{AgentStores, BotEvent, DadAgent};
use crate::error::ApiError;
use crate::runtime::BackendRuntime;
use crate::store::{JournalEntry, Message as StoredMessage};
use crate::webhook::{self, TwilioWebhook};

pub const DEFAULT_ORIGIN: &str = "web-client";
const SIMULATOR_JOURNAL_LIMIT: usize = 5;

#[derive(Clone)]
pub struct ServerState {
    pub agent: Arc<DadAgent>,
    pub stores: AgentStores,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn required(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.into()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    from: Option<String>,
}

impl ChatRequest {
    fn validated(&self) -> Result<(&str, &str), ApiError> {
        let message = self.message.trim();
        if message.is_empty() {
            return Err(ApiError::Validation("message cannot be empty".to_string()));
        }
        Ok((message, origin_or_default(self.from.as_deref())))
    }
}

#[derive(Debug, Serialize)]
struct SimulatorResponse {
    response: String,
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    from: Option<String>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    messages: Vec<StoredMessage>,
    journal_entries: Vec<JournalEntry>,
}

#[derive(Debug, Serialize)]
struct TestChatResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    success: bool,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<BotEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("DADBOT_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid DADBOT_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        agent: runtime.agent.clone(),
        stores: runtime.stores.clone(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);

    if runtime.webhook.is_none() {
        tracing::warn!("Twilio is not configured; {} is disabled", webhook::WEBHOOK_PATH);
    }
    let app = build_app(state, runtime.webhook.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Dad bot backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

/// `/v1` behind bearer auth, plus the Twilio webhook (signed, so no bearer).
pub fn build_app(state: Arc<ServerState>, webhook: Option<Arc<TwilioWebhook>>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/simulator", get(simulator_history).post(simulator_send))
        .route("/test-chat", post(test_chat))
        .route("/journal/:id", delete(delete_journal_entry))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let app = Router::new().nest("/v1", protected);
    match webhook {
        Some(webhook) => app.merge(webhook::router(webhook)),
        None => app,
    }
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<BotEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let _ = ws_events.send(map_bot_event(event));
        }
    });
}

fn map_bot_event(event: BotEvent) -> ApiEventEnvelope {
    match event {
        BotEvent::ReplyGenerated {
            conversation_id,
            origin_id,
            content,
        } => envelope(
            "reply_generated",
            serde_json::json!({
                "conversation_id": conversation_id,
                "origin_id": origin_id,
                "content": content,
            }),
        ),
        BotEvent::JournalWritten(entry) => envelope(
            "journal_written",
            serde_json::json!({
                "id": entry.id,
                "conversation_id": entry.conversation_id,
                "content": entry.content,
                "created_at": entry.created_at,
            }),
        ),
        BotEvent::Error(message) => envelope("error", serde_json::json!({ "message": message })),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("DADBOT_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("DADBOT_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "DADBOT_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all /v1 routes are unauthenticated");
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
            "Invalid DADBOT_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
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

    let Some(auth_value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|raw| raw.to_str().ok())
    else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if auth_value.trim() != format!("Bearer {}", token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

fn origin_or_default(from: Option<&str>) -> &str {
    from.map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or(DEFAULT_ORIGIN)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn simulator_send(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<SimulatorResponse>, ApiError> {
    let (message, origin) = body.validated()?;
    let exchange = state.agent.handle_inbound(origin, message).await?;
    Ok(Json(SimulatorResponse {
        response: exchange.reply,
        conversation_id: exchange.conversation_id,
    }))
}

async fn simulator_history(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let origin = origin_or_default(query.from.as_deref());
    let user = state.stores.directory.get_or_create_user(origin)?;
    let conversation = state.stores.directory.get_or_create_conversation(&user.id)?;

    Ok(Json(HistoryResponse {
        messages: state.stores.messages.list_messages(&conversation.id)?,
        journal_entries: state
            .stores
            .journal
            .recent_entries(&conversation.id, SIMULATOR_JOURNAL_LIMIT)?,
    }))
}

async fn test_chat(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<TestChatResponse>, ApiError> {
    let (message, origin) = body.validated()?;
    Ok(Json(TestChatResponse {
        response: state.agent.reply_once(origin, message).await,
    }))
}

async fn delete_journal_entry(
    State(state): State<Arc<ServerState>>,
    Path(entry_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state.stores.journal.delete_entry(&entry_id)?;
    tracing::info!("Deleted journal entry {}", entry_id);
    Ok(Json(DeleteResponse { success: true }))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::database::BotDatabase;
    use crate::store::{Directory, JournalStore};
    use crate::test_support::ScriptedEngine;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    struct Harness {
        db: Arc<BotDatabase>,
        engine: Arc<ScriptedEngine>,
        app: Router,
    }

    fn harness(auth: BackendAuthConfig) -> Harness {
        let db = Arc::new(BotDatabase::open_in_memory().expect("db"));
        let engine = Arc::new(ScriptedEngine::replying("Love you, kid."));
        let stores = AgentStores::from_database(db.clone());
        let agent = DadAgent::from_config(stores.clone(), engine.clone(), &BotConfig::default())
            .expect("agent");
        let (ws_events, _) = broadcast::channel(16);
        let state = Arc::new(ServerState {
            agent: Arc::new(agent),
            stores,
            auth,
            ws_events,
        });
        Harness {
            db,
            engine,
            app: build_app(state, None),
        }
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(&headers, &BackendAuthConfig::required("token-123")).is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        let auth = BackendAuthConfig::required("token-123");
        assert!(authorize(&HeaderMap::new(), &auth).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(authorize(&headers, &auth).is_err());
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert!(matches!(parse_auth_mode(None).unwrap(), AuthMode::Required));
        assert!(matches!(
            parse_auth_mode(Some("off".to_string())).unwrap(),
            AuthMode::Disabled
        ));
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }

    #[test]
    fn journal_event_envelope_carries_the_entry() {
        let entry = JournalEntry {
            id: "j1".to_string(),
            conversation_id: "c1".to_string(),
            content: "He got the job.".to_string(),
            created_at: Utc::now(),
        };
        let envelope = map_bot_event(BotEvent::JournalWritten(entry));
        assert_eq!(envelope.event_type, "journal_written");
        assert_eq!(envelope.payload["id"], "j1");
        assert_eq!(envelope.payload["content"], "He got the job.");
        assert!(envelope.emitted_at <= Utc::now());
    }

    #[tokio::test]
    async fn v1_routes_require_the_bearer_token() {
        let h = harness(BackendAuthConfig::required("secret"));

        let (status, _) = call(
            &h.app,
            Request::get("/v1/health").body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(
            &h.app,
            Request::get("/v1/health")
                .header(header::AUTHORIZATION, "Bearer secret")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn simulator_round_trip_and_history() {
        let h = harness(BackendAuthConfig::disabled());

        let (status, body) = call(
            &h.app,
            post_json("/v1/simulator", serde_json::json!({ "message": "Hi Dad" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "Love you, kid.");
        let conversation_id = body["conversation_id"].as_str().expect("id").to_string();

        let user = h.db.get_or_create_user(DEFAULT_ORIGIN).expect("user");
        let conversation = h.db.get_or_create_conversation(&user.id).expect("conv");
        assert_eq!(conversation.id, conversation_id);

        let (status, history) = call(
            &h.app,
            Request::get("/v1/simulator").body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let messages = history["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["direction"], "INCOMING");
        assert_eq!(messages[0]["content"], "Hi Dad");
        assert_eq!(messages[1]["direction"], "OUTGOING");
        assert!(history["journal_entries"]
            .as_array()
            .expect("entries")
            .is_empty());
    }

    #[tokio::test]
    async fn history_is_scoped_by_origin() {
        let h = harness(BackendAuthConfig::disabled());
        call(
            &h.app,
            post_json(
                "/v1/simulator",
                serde_json::json!({ "message": "yo", "from": "+15550001111" }),
            ),
        )
        .await;

        let (_, other) = call(
            &h.app,
            Request::get("/v1/simulator?from=someone-else")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert!(other["messages"].as_array().expect("messages").is_empty());

        let (_, own) = call(
            &h.app,
            Request::get("/v1/simulator?from=%2B15550001111")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(own["messages"].as_array().expect("messages").len(), 2);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let h = harness(BackendAuthConfig::disabled());
        let (status, _) = call(
            &h.app,
            post_json("/v1/simulator", serde_json::json!({ "message": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(h.engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_chat_replies_without_persisting() {
        let h = harness(BackendAuthConfig::disabled());
        let (status, body) = call(
            &h.app,
            post_json("/v1/test-chat", serde_json::json!({ "message": "quick q" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "Love you, kid.");

        let user = h.db.get_or_create_user(DEFAULT_ORIGIN).expect("user");
        let conversations = h.db.list_conversations_for_user(&user.id).expect("list");
        assert!(conversations.is_empty());
    }

    #[tokio::test]
    async fn delete_journal_entry_then_404() {
        let h = harness(BackendAuthConfig::disabled());
        let user = h.db.get_or_create_user(DEFAULT_ORIGIN).expect("user");
        let conversation = h.db.get_or_create_conversation(&user.id).expect("conv");
        let entry = h
            .db
            .create_entry(&conversation.id, "A good week.")
            .expect("entry");

        let uri = format!("/v1/journal/{}", entry.id);
        let (status, body) = call(
            &h.app,
            Request::delete(uri.as_str()).body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = call(
            &h.app,
            Request::delete(uri.as_str()).body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
