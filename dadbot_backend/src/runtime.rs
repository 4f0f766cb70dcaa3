use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::agent::{AgentStores, BotEvent, DadAgent};
use crate::config::BotConfig;
use crate::database::BotDatabase;
use crate::llm_client::{CompletionEngine, LlmClient};
use crate::twilio::{OutboundMessenger, TwilioMessenger};
use crate::webhook::TwilioWebhook;

pub struct BackendRuntime {
    pub config: BotConfig,
    pub stores: AgentStores,
    pub agent: Arc<DadAgent>,
    /// Present only when Twilio credentials are configured.
    pub webhook: Option<Arc<TwilioWebhook>>,
}

pub struct BackendRuntimeBuilder {
    config: BotConfig,
    event_tx: Sender<BotEvent>,
    database: Option<Arc<BotDatabase>>,
    engine: Option<Arc<dyn CompletionEngine>>,
    messenger: Option<Arc<dyn OutboundMessenger>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: BotConfig, event_tx: Sender<BotEvent>) -> Self {
        Self {
            config,
            event_tx,
            database: None,
            engine: None,
            messenger: None,
        }
    }

    pub fn with_database(mut self, database: Arc<BotDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn CompletionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_messenger(mut self, messenger: Arc<dyn OutboundMessenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let database = match self.database {
            Some(database) => database,
            None => Arc::new(BotDatabase::open(&config.database_path).with_context(|| {
                format!("Failed to open database at {}", config.database_path)
            })?),
        };
        let stores = AgentStores::from_database(database);

        let engine: Arc<dyn CompletionEngine> = match self.engine {
            Some(engine) => engine,
            None => {
                let client = LlmClient::from_config(&config)?;
                tracing::info!("Using completion model {}", client.model());
                Arc::new(client)
            }
        };

        let agent = Arc::new(
            DadAgent::from_config(stores.clone(), engine, &config)
                .context("Invalid agent configuration")?
                .with_events(self.event_tx),
        );

        let webhook = build_webhook(&config, agent.clone(), self.messenger)?;

        Ok(BackendRuntime {
            config,
            stores,
            agent,
            webhook,
        })
    }
}

fn build_webhook(
    config: &BotConfig,
    agent: Arc<DadAgent>,
    messenger: Option<Arc<dyn OutboundMessenger>>,
) -> Result<Option<Arc<TwilioWebhook>>> {
    let Some(auth_token) = config
        .twilio
        .auth_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
    else {
        return Ok(None);
    };

    let messenger = match messenger {
        Some(messenger) => messenger,
        None if config.twilio.outbound_ready() => {
            Arc::new(TwilioMessenger::from_config(&config.twilio)?) as Arc<dyn OutboundMessenger>
        }
        None => {
            tracing::warn!(
                "TWILIO_AUTH_TOKEN is set but outbound credentials are incomplete; webhook disabled"
            );
            return Ok(None);
        }
    };

    if config.twilio.webhook_url.is_none() {
        tracing::warn!("TWILIO_WEBHOOK_URL unset; signatures are checked against the Host header");
    }

    Ok(Some(Arc::new(TwilioWebhook::new(
        auth_token.to_string(),
        config.twilio.webhook_url.clone(),
        agent,
        messenger,
    ))))
}

impl BackendRuntime {
    pub fn bootstrap(config: BotConfig, event_tx: Sender<BotEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }
}
