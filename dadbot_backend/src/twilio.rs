use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

use crate::config::TwilioConfig;
use crate::http_client::build_http_client;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_HEADER: &str = "x-twilio-signature";

const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TwilioError {
    #[error("twilio is not configured: missing {0}")]
    NotConfigured(&'static str),

    #[error("twilio request failed: {0}")]
    Transport(String),

    #[error("twilio API returned error {status}: {body}")]
    Api { status: u16, body: String },
}

/// Twilio's request signature: HMAC-SHA1 keyed by the auth token over the
/// public URL followed by every parameter as `key + value`, sorted by key,
/// then base64.
pub fn compute_signature(auth_token: &str, url: &str, params: &[(String, String)]) -> String {
    let Some(mac) = signing_mac(auth_token, url, params) else {
        return String::new();
    };
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Constant-time check of an `X-Twilio-Signature` value.
pub fn validate_request(
    auth_token: &str,
    signature: &str,
    url: &str,
    params: &[(String, String)],
) -> bool {
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Some(mac) = signing_mac(auth_token, url, params) else {
        return false;
    };
    mac.verify_slice(&expected).is_ok()
}

fn signing_mac(auth_token: &str, url: &str, params: &[(String, String)]) -> Option<HmacSha1> {
    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes()).ok()?;
    mac.update(signing_payload(url, params).as_bytes());
    Some(mac)
}

fn signing_payload(url: &str, params: &[(String, String)]) -> String {
    let mut sorted = params.iter().collect::<Vec<_>>();
    sorted.sort();
    sorted
        .into_iter()
        .fold(url.to_string(), |mut payload, (key, value)| {
            payload.push_str(key);
            payload.push_str(value);
            payload
        })
}

/// Sends a text back to the person who wrote in.
#[async_trait]
pub trait OutboundMessenger: Send + Sync {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), TwilioError>;
}

/// Twilio REST client for outbound SMS.
#[derive(Clone)]
pub struct TwilioMessenger {
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
    client: reqwest::Client,
}

impl TwilioMessenger {
    pub fn new(
        api_base: String,
        account_sid: String,
        auth_token: String,
        from_number: String,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            account_sid,
            auth_token,
            from_number,
            client: build_http_client(Some(OUTBOUND_TIMEOUT))?,
        })
    }

    pub fn from_config(config: &TwilioConfig) -> anyhow::Result<Self> {
        let required = |value: &Option<String>, name: &'static str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(TwilioError::NotConfigured(name))
        };

        Self::new(
            config.api_base.clone(),
            required(&config.account_sid, "account_sid")?,
            required(&config.auth_token, "auth_token")?,
            required(&config.phone_number, "phone_number")?,
        )
    }
}

#[async_trait]
impl OutboundMessenger for TwilioMessenger {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), TwilioError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", to), ("From", self.from_number.as_str()), ("Body", body)])
            .send()
            .await
            .map_err(|e| TwilioError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(TwilioError::Api { status, body });
        }

        tracing::debug!("Sent SMS to {}", to);
        Ok(())
    }
}
