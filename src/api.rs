use anyhow::{Context, Result};
use flume::Sender;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header as ws_header;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message;

use dadbot_backend::store::{JournalEntry, Message as StoredMessage};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SimulatorReply {
    pub response: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorHistory {
    pub messages: Vec<StoredMessage>,
    pub journal_entries: Vec<JournalEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendEvent {
    ReplyGenerated {
        conversation_id: String,
        origin_id: String,
        content: String,
    },
    JournalWritten {
        id: String,
        content: String,
    },
    Error(String),
}

#[derive(Debug, Deserialize)]
struct ApiEventEnvelope {
    event_type: String,
    payload: Value,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    from: &'a str,
}

#[derive(Debug, Deserialize)]
struct TestChatResponse {
    response: String,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base = std::env::var("DADBOT_BACKEND_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
        let token = std::env::var("DADBOT_BACKEND_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self::new(base, token)
    }

    pub fn new(base_url: String, token: Option<String>) -> Self {
        let normalized_base = normalize_base_url(&base_url);
        let ws_url = normalize_ws_url(&normalized_base);

        Self {
            http: reqwest::Client::new(),
            base_url: normalized_base,
            ws_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn send_message(&self, from: &str, message: &str) -> Result<SimulatorReply> {
        self.request(reqwest::Method::POST, "/v1/simulator")
            .json(&ChatRequest { message, from })
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/simulator failed")?
            .json::<SimulatorReply>()
            .await
            .context("Failed to decode simulator reply")
    }

    pub async fn history(&self, from: &str) -> Result<SimulatorHistory> {
        let response = self
            .request(reqwest::Method::GET, "/v1/simulator")
            .query(&[("from", from)])
            .send()
            .await?
            .error_for_status()
            .context("GET /v1/simulator failed")?;

        let body = response
            .text()
            .await
            .context("Failed to read history payload")?;
        serde_json::from_str::<SimulatorHistory>(&body).context(format!(
            "Failed to decode history. Payload preview: {}",
            body.chars().take(500).collect::<String>()
        ))
    }

    pub async fn test_chat(&self, from: &str, message: &str) -> Result<String> {
        let response = self
            .request(reqwest::Method::POST, "/v1/test-chat")
            .json(&ChatRequest { message, from })
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/test-chat failed")?
            .json::<TestChatResponse>()
            .await
            .context("Failed to decode test-chat reply")?;
        Ok(response.response)
    }

    pub async fn delete_journal_entry(&self, id: &str) -> Result<()> {
        self.request(reqwest::Method::DELETE, &format!("/v1/journal/{}", id))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("DELETE /v1/journal/{} failed", id))?;
        Ok(())
    }

    pub async fn stream_events_forever(self, tx: Sender<FrontendEvent>) {
        loop {
            match self.stream_events_once(&tx).await {
                Ok(()) => {
                    tracing::info!("Event stream disconnected; reconnecting in 2s");
                }
                Err(error) => {
                    tracing::warn!("Event stream failed: {}; reconnecting in 2s", error);
                }
            }
            if tx.is_disconnected() {
                return;
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn stream_events_once(&self, tx: &Sender<FrontendEvent>) -> Result<()> {
        let ws_endpoint = format!("{}/v1/ws/events", self.ws_url);
        let mut request = ws_endpoint
            .into_client_request()
            .context("Invalid websocket endpoint URL")?;

        if let Some(token) = self.token.as_deref() {
            let value = WsHeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid bearer token for websocket auth")?;
            request
                .headers_mut()
                .insert(ws_header::AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to connect websocket event stream")?;
        let (_write, mut read) = stream.split();

        while let Some(message) = read.next().await {
            let text = match message.context("Websocket read error")? {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            if let Some(event) = parse_event_envelope(&text)? {
                if tx.send(event).is_err() {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

fn parse_event_envelope(text: &str) -> Result<Option<FrontendEvent>> {
    let envelope =
        serde_json::from_str::<ApiEventEnvelope>(text).context("Malformed event envelope")?;
    Ok(map_event(envelope))
}

fn map_event(envelope: ApiEventEnvelope) -> Option<FrontendEvent> {
    let field = |name: &str| {
        envelope
            .payload
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    match envelope.event_type.as_str() {
        "reply_generated" => Some(FrontendEvent::ReplyGenerated {
            conversation_id: field("conversation_id"),
            origin_id: field("origin_id"),
            content: field("content"),
        }),
        "journal_written" => Some(FrontendEvent::JournalWritten {
            id: field("id"),
            content: field("content"),
        }),
        "error" => Some(FrontendEvent::Error(field("message"))),
        other => {
            tracing::debug!("Ignoring unknown event type '{}'", other);
            None
        }
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "http://127.0.0.1:8787".to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_ws_url(base_http_url: &str) -> String {
    if let Some(rest) = base_http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http_url)
    }
}
