use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::BotConfig;
use crate::llm_client::{CompletionEngine, CompletionError, CompletionRequest, PromptMessage};
use crate::store::{JournalEntry, JournalStore, Message, MessageDirection, MessageStore};

use super::{AgentError, DAD_SYSTEM_PROMPT};

pub const DEFAULT_JOURNAL_BATCH_SIZE: usize = 6;
pub const DEFAULT_JOURNAL_MIN_PER_DIRECTION: usize = 3;

/// When a batch of unconsumed messages is worth a journal entry: exactly
/// `batch_size` of them, with at least `min_per_direction` each way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalPolicy {
    batch_size: usize,
    min_per_direction: usize,
}

impl Default for JournalPolicy {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_JOURNAL_BATCH_SIZE,
            min_per_direction: DEFAULT_JOURNAL_MIN_PER_DIRECTION,
        }
    }
}

impl JournalPolicy {
    pub fn new(batch_size: usize, min_per_direction: usize) -> Result<Self, AgentError> {
        if batch_size < 2 {
            return Err(AgentError::InvalidPolicy(
                "journal batch size must be at least 2".to_string(),
            ));
        }
        if min_per_direction == 0 {
            return Err(AgentError::InvalidPolicy(
                "each direction needs at least one message per journal batch".to_string(),
            ));
        }
        if min_per_direction.saturating_mul(2) > batch_size {
            return Err(AgentError::InvalidPolicy(format!(
                "a batch of {} can never hold {} messages in each direction",
                batch_size, min_per_direction
            )));
        }
        Ok(Self {
            batch_size,
            min_per_direction,
        })
    }

    pub fn from_config(config: &BotConfig) -> Result<Self, AgentError> {
        Self::new(config.journal_batch_size, config.journal_min_per_direction)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn min_per_direction(&self) -> usize {
        self.min_per_direction
    }

    pub fn qualifies(&self, batch: &[Message]) -> bool {
        let counts = BatchCounts::of(batch);
        batch.len() == self.batch_size
            && counts.incoming >= self.min_per_direction
            && counts.outgoing >= self.min_per_direction
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub incoming: usize,
    pub outgoing: usize,
}

impl BatchCounts {
    pub fn of(batch: &[Message]) -> Self {
        batch.iter().fold(Self::default(), |mut counts, m| {
            match m.direction {
                MessageDirection::Incoming => counts.incoming += 1,
                MessageDirection::Outgoing => counts.outgoing += 1,
            }
            counts
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOutcome {
    BelowThreshold {
        unconsumed: usize,
        incoming: usize,
        outgoing: usize,
    },
    Written(JournalEntry),
}

/// One async lock per conversation so that two evaluations of the same
/// conversation never overlap. Idle entries are dropped on release.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ConversationLocks {
    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        // The map only holds handles, so a poisoned guard is still usable.
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self, conversation_id: &str) -> Arc<AsyncMutex<()>> {
        self.lock_map()
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    fn release(&self, conversation_id: &str, handle: Arc<AsyncMutex<()>>) {
        drop(handle);
        let mut map = self.lock_map();
        if map
            .get(conversation_id)
            .is_some_and(|h| Arc::strong_count(h) == 1)
        {
            map.remove(conversation_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock_map().len()
    }
}

pub fn journal_system_prompt(today: DateTime<Utc>) -> String {
    format!(
        "{}\n\nToday's date is {}.",
        DAD_SYSTEM_PROMPT,
        today.format("%A, %B %-d, %Y")
    )
}

/// `batch` must be oldest first.
pub fn build_journal_prompt(batch: &[Message], previous_entry: Option<&str>) -> String {
    let counts = BatchCounts::of(batch);
    let mut prompt = format!(
        "You are Dad, keeping a private journal about your ongoing SMS relationship with your son. \
         Reflect on the last {} messages ({} from you, {} from your son). \
         Consider what he has told you, what it means for your relationship, and how you feel about it.\n\n\
         Write a single, concise paragraph (no more than 4 sentences) capturing your most important \
         thoughts, observations, and plans about your relationship with your son. \
         Do NOT include a date or greeting. Focus on what matters most to you as Dad in this moment. \
         Try not to repeat things from other journal entries, unless you've learned something new.",
        batch.len(),
        counts.outgoing,
        counts.incoming
    );

    if let Some(previous) = previous_entry.map(str::trim).filter(|p| !p.is_empty()) {
        prompt.push_str(&format!(
            "\n\nYour previous journal entry was:\n\"\"\"{}\"\"\"\n\nBuild on your previous reflections if relevant.",
            previous
        ));
    }

    prompt.push_str("\n\nRecent messages:");
    for message in batch {
        let speaker = match message.direction {
            MessageDirection::Incoming => "Son",
            MessageDirection::Outgoing => "Dad",
        };
        prompt.push_str(&format!("\n{}: {}", speaker, message.content));
    }
    prompt.push_str("\n\nJournal Entry:");
    prompt
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalSettings {
    pub model: String,
    pub timeout: Duration,
}

impl JournalSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            model: config.journal_model.clone(),
            timeout: Duration::from_secs(config.llm_timeout_secs),
        }
    }
}

/// Folds finished stretches of a conversation into journal entries.
pub struct JournalTrigger {
    messages: Arc<dyn MessageStore>,
    journal: Arc<dyn JournalStore>,
    engine: Arc<dyn CompletionEngine>,
    policy: JournalPolicy,
    settings: JournalSettings,
    locks: ConversationLocks,
}

impl JournalTrigger {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        journal: Arc<dyn JournalStore>,
        engine: Arc<dyn CompletionEngine>,
        policy: JournalPolicy,
        settings: JournalSettings,
    ) -> Self {
        Self {
            messages,
            journal,
            engine,
            policy,
            settings,
            locks: ConversationLocks::default(),
        }
    }

    pub fn policy(&self) -> JournalPolicy {
        self.policy
    }

    /// Check the unconsumed batch and, if it qualifies, write one entry and
    /// mark exactly that batch journaled. Nothing is written or marked when
    /// generation fails.
    pub async fn evaluate(&self, conversation_id: &str) -> Result<JournalOutcome, AgentError> {
        let handle = self.locks.acquire(conversation_id);
        let outcome = {
            let _guard = handle.lock().await;
            self.evaluate_locked(conversation_id).await
        };
        self.locks.release(conversation_id, handle);
        outcome
    }

    /// Fire-and-forget wrapper: failures are logged, never returned.
    pub async fn evaluate_and_maybe_journal(&self, conversation_id: &str) -> Option<JournalEntry> {
        match self.evaluate(conversation_id).await {
            Ok(JournalOutcome::Written(entry)) => Some(entry),
            Ok(JournalOutcome::BelowThreshold {
                unconsumed,
                incoming,
                outgoing,
            }) => {
                tracing::debug!(
                    "No journal entry for {}: {} unconsumed ({} in / {} out)",
                    conversation_id,
                    unconsumed,
                    incoming,
                    outgoing
                );
                None
            }
            Err(error) => {
                tracing::error!("Journal evaluation for {} failed: {}", conversation_id, error);
                None
            }
        }
    }

    async fn evaluate_locked(&self, conversation_id: &str) -> Result<JournalOutcome, AgentError> {
        let mut batch =
            self.messages
                .recent_messages(conversation_id, self.policy.batch_size, true)?;

        if !self.policy.qualifies(&batch) {
            let counts = BatchCounts::of(&batch);
            return Ok(JournalOutcome::BelowThreshold {
                unconsumed: batch.len(),
                incoming: counts.incoming,
                outgoing: counts.outgoing,
            });
        }
        batch.reverse();

        let previous = self
            .journal
            .recent_entries(conversation_id, 1)?
            .into_iter()
            .next();

        let content = self
            .generate_entry(&batch, previous.as_ref().map(|e| e.content.as_str()))
            .await
            .map_err(AgentError::JournalGenerationFailed)?;

        let entry = self.journal.create_entry(conversation_id, &content)?;

        let ids = batch.iter().map(|m| m.id.clone()).collect::<Vec<_>>();
        let marked = self.messages.mark_journaled(&ids)?;
        if marked != ids.len() {
            tracing::warn!(
                "Journal entry {} covered {} messages but only {} were newly marked",
                entry.id,
                ids.len(),
                marked
            );
        }

        tracing::info!(
            "Wrote journal entry {} for conversation {}",
            entry.id,
            conversation_id
        );
        Ok(JournalOutcome::Written(entry))
    }

    async fn generate_entry(
        &self,
        batch: &[Message],
        previous_entry: Option<&str>,
    ) -> Result<String, CompletionError> {
        let request = CompletionRequest {
            messages: vec![
                PromptMessage::system(journal_system_prompt(Utc::now())),
                PromptMessage::user(build_journal_prompt(batch, previous_entry)),
            ],
            model: Some(self.settings.model.clone()),
            ..CompletionRequest::default()
        };

        let content = tokio::time::timeout(self.settings.timeout, self.engine.complete(request))
            .await
            .map_err(|_| CompletionError::Timeout(self.settings.timeout))??;

        let content = content.trim();
        if content.is_empty() {
            return Err(CompletionError::Empty);
        }
        Ok(content.to_string())
    }
}
