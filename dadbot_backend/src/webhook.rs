use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;

use crate::agent::DadAgent;
use crate::error::ApiError;
use crate::twilio::{validate_request, OutboundMessenger, SIGNATURE_HEADER};

pub const WEBHOOK_PATH: &str = "/webhook/twilio";

/// Inbound SMS endpoint: verify the Twilio signature, run the exchange and
/// text the reply back.
pub struct TwilioWebhook {
    auth_token: String,
    /// Public URL Twilio signs. When unset it is rebuilt from the Host header.
    public_url: Option<String>,
    agent: Arc<DadAgent>,
    messenger: Arc<dyn OutboundMessenger>,
}

impl TwilioWebhook {
    pub fn new(
        auth_token: String,
        public_url: Option<String>,
        agent: Arc<DadAgent>,
        messenger: Arc<dyn OutboundMessenger>,
    ) -> Self {
        Self {
            auth_token,
            public_url,
            agent,
            messenger,
        }
    }

    /// Returns the plain-text body for a 200 response. The raw form body is
    /// only parsed once a signature header is present.
    pub async fn process(
        &self,
        signature: Option<&str>,
        url: &str,
        body: &[u8],
    ) -> Result<&'static str, ApiError> {
        let Some(signature) = signature.filter(|s| !s.trim().is_empty()) else {
            return Err(ApiError::Authentication(
                "Missing Twilio signature".to_string(),
            ));
        };
        let params = parse_form(body);
        let params = params.as_slice();
        if !validate_request(&self.auth_token, signature, url, params) {
            tracing::warn!("Rejected webhook with invalid signature for {}", url);
            return Err(ApiError::Authentication(
                "Invalid Twilio signature".to_string(),
            ));
        }

        let (Some(text), Some(from)) = (param(params, "Body"), param(params, "From")) else {
            return Err(ApiError::Validation(
                "Missing required parameters".to_string(),
            ));
        };

        let exchange = self.agent.handle_inbound(from, text).await?;
        self.messenger.send_sms(from, &exchange.reply).await?;
        Ok("OK")
    }

    fn signing_url(&self, headers: &HeaderMap, path_and_query: &str) -> String {
        if let Some(url) = &self.public_url {
            return url.clone();
        }
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{}{}", host, path_and_query)
    }
}

fn parse_form(body: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.trim().is_empty())
}

pub fn router(webhook: Arc<TwilioWebhook>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(twilio_webhook))
        .with_state(webhook)
}

async fn twilio_webhook(
    State(webhook): State<Arc<TwilioWebhook>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(WEBHOOK_PATH);
    let url = webhook.signing_url(&headers, path_and_query);
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match webhook.process(signature, &url, &body).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(error) => error.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentStores, FALLBACK_REPLY};
    use crate::config::BotConfig;
    use crate::database::BotDatabase;
    use crate::store::{Directory, MessageStore};
    use crate::test_support::{RecordingMessenger, ScriptedEngine};
    use crate::twilio::compute_signature;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const TOKEN: &str = "test_auth_token";
    const PUBLIC_URL: &str = "https://dad.example.com/webhook/twilio";

    struct Harness {
        db: Arc<BotDatabase>,
        messenger: Arc<RecordingMessenger>,
        webhook: Arc<TwilioWebhook>,
    }

    fn harness(engine: ScriptedEngine, messenger: RecordingMessenger) -> Harness {
        let db = Arc::new(BotDatabase::open_in_memory().expect("db"));
        let agent = DadAgent::from_config(
            AgentStores::from_database(db.clone()),
            Arc::new(engine),
            &BotConfig::default(),
        )
        .expect("agent");
        let messenger = Arc::new(messenger);
        let webhook = Arc::new(TwilioWebhook::new(
            TOKEN.to_string(),
            Some(PUBLIC_URL.to_string()),
            Arc::new(agent),
            messenger.clone(),
        ));
        Harness {
            db,
            messenger,
            webhook,
        }
    }

    fn form(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn signed(params: &[(String, String)]) -> String {
        compute_signature(TOKEN, PUBLIC_URL, params)
    }

    async fn send(
        webhook: Arc<TwilioWebhook>,
        body: &'static str,
        signature: Option<String>,
    ) -> (StatusCode, String) {
        let request = Request::builder()
            .method("POST")
            .uri(WEBHOOK_PATH)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        dispatch(webhook, request, body, signature).await
    }

    async fn dispatch(
        webhook: Arc<TwilioWebhook>,
        mut request: axum::http::request::Builder,
        body: &'static str,
        signature: Option<String>,
    ) -> (StatusCode, String) {
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        let response = router(webhook)
            .oneshot(request.body(Body::from(body)).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn missing_signature_is_forbidden() {
        let h = harness(ScriptedEngine::replying("hi"), RecordingMessenger::default());
        let (status, body) = send(h.webhook, "Body=Hello+Dad&From=%2B1234567890", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Missing Twilio signature");
    }

    #[tokio::test]
    async fn unsigned_request_without_content_type_is_forbidden() {
        let h = harness(ScriptedEngine::replying("hi"), RecordingMessenger::default());
        let request = Request::builder().method("POST").uri(WEBHOOK_PATH);
        let (status, body) =
            dispatch(h.webhook, request, "Body=Hello+Dad&From=%2B1234567890", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Missing Twilio signature");
        assert!(h.messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn signed_request_without_content_type_is_still_answered() {
        let h = harness(
            ScriptedEngine::replying("Hey champ!"),
            RecordingMessenger::default(),
        );
        let signature = signed(&form(&[("Body", "Hello Dad"), ("From", "+1234567890")]));
        let request = Request::builder().method("POST").uri(WEBHOOK_PATH);
        let (status, body) = dispatch(
            h.webhook,
            request,
            "Body=Hello+Dad&From=%2B1234567890",
            Some(signature),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
        assert_eq!(h.messenger.sent().len(), 1);
    }

    #[test]
    fn form_body_is_decoded_in_order() {
        assert_eq!(
            parse_form(b"Body=Hello+Dad&From=%2B1234567890"),
            form(&[("Body", "Hello Dad"), ("From", "+1234567890")])
        );
        assert!(parse_form(b"").is_empty());
    }

    #[tokio::test]
    async fn invalid_signature_is_forbidden_and_nothing_is_stored() {
        let h = harness(ScriptedEngine::replying("hi"), RecordingMessenger::default());
        let (status, body) = send(
            h.webhook,
            "Body=Hello+Dad&From=%2B1234567890",
            Some("aW52YWxpZA==".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Invalid Twilio signature");

        let user = h.db.get_or_create_user("+1234567890").expect("user");
        assert!(h
            .db
            .list_conversations_for_user(&user.id)
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn missing_body_is_a_bad_request() {
        let h = harness(ScriptedEngine::replying("hi"), RecordingMessenger::default());
        let signature = signed(&form(&[("Body", ""), ("From", "+1234567890")]));
        let (status, body) = send(h.webhook, "Body=&From=%2B1234567890", Some(signature)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Missing required parameters");
        assert!(h.messenger.sent().is_empty());
    }

    #[tokio::test]
    async fn valid_text_gets_a_reply_sent_back() {
        let h = harness(
            ScriptedEngine::replying("Hey champ!"),
            RecordingMessenger::default(),
        );
        let signature = signed(&form(&[("Body", "Hello Dad"), ("From", "+1234567890")]));
        let (status, body) = send(
            h.webhook,
            "Body=Hello+Dad&From=%2B1234567890",
            Some(signature),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
        assert_eq!(
            h.messenger.sent(),
            vec![("+1234567890".to_string(), "Hey champ!".to_string())]
        );

        let user = h.db.get_or_create_user("+1234567890").expect("user");
        let conversation = h.db.get_or_create_conversation(&user.id).expect("conv");
        assert_eq!(h.db.list_messages(&conversation.id).expect("messages").len(), 2);
    }

    #[tokio::test]
    async fn engine_failure_still_answers_with_the_fallback() {
        let h = harness(ScriptedEngine::failing(), RecordingMessenger::default());
        let signature = signed(&form(&[("Body", "Hello Dad"), ("From", "+1234567890")]));
        let (status, _) = send(
            h.webhook,
            "Body=Hello+Dad&From=%2B1234567890",
            Some(signature),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            h.messenger.sent(),
            vec![("+1234567890".to_string(), FALLBACK_REPLY.to_string())]
        );
    }

    #[tokio::test]
    async fn outbound_failure_is_an_opaque_500() {
        let h = harness(ScriptedEngine::replying("hi"), RecordingMessenger::failing());
        let signature = signed(&form(&[("Body", "Hello Dad"), ("From", "+1234567890")]));
        let (status, body) = send(
            h.webhook,
            "Body=Hello+Dad&From=%2B1234567890",
            Some(signature),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Internal Server Error");
    }

    #[tokio::test]
    async fn signing_url_falls_back_to_host_header() {
        let h = harness(ScriptedEngine::replying("hi"), RecordingMessenger::default());
        let webhook = TwilioWebhook::new(
            TOKEN.to_string(),
            None,
            h.webhook.agent.clone(),
            h.messenger.clone(),
        );
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "bot.local:8787".parse().expect("host"));
        assert_eq!(
            webhook.signing_url(&headers, "/webhook/twilio?x=1"),
            "http://bot.local:8787/webhook/twilio?x=1"
        );
    }
}
