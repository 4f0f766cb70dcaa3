pub mod context;
pub mod journal;
pub mod reply;

use std::sync::Arc;

use async_trait::async_trait;
use flume::Sender;
use thiserror::Error;

use crate::config::BotConfig;
use crate::database::BotDatabase;
use crate::llm_client::{CompletionEngine, CompletionError};
use crate::store::{Directory, JournalEntry, JournalStore, MessageDirection, MessageStore, StoreError};

pub use context::{ContextAssembler, ReplyContext};
pub use journal::{JournalOutcome, JournalPolicy, JournalSettings, JournalTrigger};
pub use reply::{ReplyGenerator, ReplySettings};

pub const DAD_SYSTEM_PROMPT: &str = "You are Dad, a warm, supportive, and creative companion. \
Offer encouragement, perspective, and a touch of humor. \
Respond as a real person would, not as an AI.";

pub const FALLBACK_REPLY: &str = "Sorry, I had trouble thinking of a response.";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to assemble reply context: {0}")]
    ContextAssemblyFailed(#[source] StoreError),

    #[error("journal generation failed: {0}")]
    JournalGenerationFailed(#[source] CompletionError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid journal policy: {0}")]
    InvalidPolicy(String),
}

#[derive(Debug, Clone)]
pub enum BotEvent {
    ReplyGenerated {
        conversation_id: String,
        origin_id: String,
        content: String,
    },
    JournalWritten(JournalEntry),
    Error(String),
}

/// Runs after a reply is persisted. Kept behind a trait so journaling can move
/// to a background queue without touching the exchange loop.
#[async_trait]
pub trait PostReplyStep: Send + Sync {
    async fn after_reply(&self, conversation_id: &str) -> Option<JournalEntry>;
}

#[async_trait]
impl PostReplyStep for JournalTrigger {
    async fn after_reply(&self, conversation_id: &str) -> Option<JournalEntry> {
        self.evaluate_and_maybe_journal(conversation_id).await
    }
}

/// The store handles the agent needs, usually all backed by one database.
#[derive(Clone)]
pub struct AgentStores {
    pub directory: Arc<dyn Directory>,
    pub messages: Arc<dyn MessageStore>,
    pub journal: Arc<dyn JournalStore>,
}

impl AgentStores {
    pub fn from_database(database: Arc<BotDatabase>) -> Self {
        Self {
            directory: database.clone(),
            messages: database.clone(),
            journal: database,
        }
    }
}

/// Result of one inbound text: what was stored and what Dad said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub conversation_id: String,
    pub user_id: String,
    pub reply: String,
    pub inbound_message_id: String,
    pub reply_message_id: String,
    pub journal: Option<JournalEntry>,
}

pub struct DadAgent {
    directory: Arc<dyn Directory>,
    messages: Arc<dyn MessageStore>,
    replies: ReplyGenerator,
    post_reply: Arc<dyn PostReplyStep>,
    event_tx: Option<Sender<BotEvent>>,
}

impl DadAgent {
    pub fn new(
        stores: AgentStores,
        engine: Arc<dyn CompletionEngine>,
        reply_settings: ReplySettings,
        history_window: usize,
        journal_window: usize,
        post_reply: Arc<dyn PostReplyStep>,
    ) -> Self {
        let assembler = ContextAssembler::new(
            stores.messages.clone(),
            stores.journal,
            history_window,
            journal_window,
        );

        Self {
            directory: stores.directory,
            messages: stores.messages,
            replies: ReplyGenerator::new(assembler, engine, reply_settings),
            post_reply,
            event_tx: None,
        }
    }

    /// Wire up the reply generator and journal trigger from config.
    pub fn from_config(
        stores: AgentStores,
        engine: Arc<dyn CompletionEngine>,
        config: &BotConfig,
    ) -> Result<Self, AgentError> {
        let trigger = JournalTrigger::new(
            stores.messages.clone(),
            stores.journal.clone(),
            engine.clone(),
            JournalPolicy::from_config(config)?,
            JournalSettings::from_config(config),
        );

        Ok(Self::new(
            stores,
            engine,
            ReplySettings::from_config(config),
            config.history_window,
            config.journal_digest_window,
            Arc::new(trigger),
        ))
    }

    pub fn with_events(mut self, event_tx: Sender<BotEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    fn emit(&self, event: BotEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Persist the inbound text, reply to it, persist the reply and give the
    /// journal a chance to fire. Reply problems become the fallback text;
    /// only store failures surface as errors.
    pub async fn handle_inbound(&self, origin_id: &str, text: &str) -> Result<Exchange, AgentError> {
        let result = self.run_exchange(origin_id, text).await;
        if let Err(error) = &result {
            tracing::error!("Exchange for {} failed: {}", origin_id, error);
            self.emit(BotEvent::Error(format!("exchange failed: {}", error)));
        }
        result
    }

    async fn run_exchange(&self, origin_id: &str, text: &str) -> Result<Exchange, AgentError> {
        let user = self.directory.get_or_create_user(origin_id)?;
        let conversation = self.directory.get_or_create_conversation(&user.id)?;
        let inbound =
            self.messages
                .create_message(&conversation.id, text, MessageDirection::Incoming)?;

        let context = ReplyContext::new(origin_id)
            .with_conversation(conversation.id.clone())
            .excluding(inbound.id.clone());
        let reply = self.replies.generate_reply(text, &context).await;

        let outbound =
            self.messages
                .create_message(&conversation.id, &reply, MessageDirection::Outgoing)?;
        tracing::info!(
            "Replied to {} in conversation {}",
            origin_id,
            conversation.id
        );
        self.emit(BotEvent::ReplyGenerated {
            conversation_id: conversation.id.clone(),
            origin_id: origin_id.to_string(),
            content: reply.clone(),
        });

        let journal = self.post_reply.after_reply(&conversation.id).await;
        if let Some(entry) = &journal {
            self.emit(BotEvent::JournalWritten(entry.clone()));
        }

        Ok(Exchange {
            conversation_id: conversation.id,
            user_id: user.id,
            reply,
            inbound_message_id: inbound.id,
            reply_message_id: outbound.id,
            journal,
        })
    }

    /// A reply with no history and nothing persisted.
    pub async fn reply_once(&self, origin_id: &str, text: &str) -> String {
        self.replies
            .generate_reply(text, &ReplyContext::new(origin_id))
            .await
    }
}
