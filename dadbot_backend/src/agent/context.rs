use std::sync::Arc;

use crate::llm_client::PromptMessage;
use crate::store::{JournalStore, MessageDirection, MessageStore};

use super::{AgentError, DAD_SYSTEM_PROMPT};

pub const JOURNAL_DIGEST_LABEL: &str =
    "Your private journal entries about your relationship with your son (oldest first):";

/// Who is asking and which conversation (if any) the reply belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyContext {
    /// Phone number or simulator id; only used for attribution.
    pub origin_id: String,
    pub conversation_id: Option<String>,
    /// Already-persisted copy of the inbound text, kept out of the history so
    /// it only appears once, as the final user segment.
    pub exclude_message_id: Option<String>,
}

impl ReplyContext {
    pub fn new(origin_id: impl Into<String>) -> Self {
        Self {
            origin_id: origin_id.into(),
            ..Self::default()
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn excluding(mut self, message_id: impl Into<String>) -> Self {
        self.exclude_message_id = Some(message_id.into());
        self
    }
}

/// Builds `[system, ...history, journal digest?, user]` for a reply request.
/// Read-only.
pub struct ContextAssembler {
    messages: Arc<dyn MessageStore>,
    journal: Arc<dyn JournalStore>,
    history_window: usize,
    journal_window: usize,
}

impl ContextAssembler {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        journal: Arc<dyn JournalStore>,
        history_window: usize,
        journal_window: usize,
    ) -> Self {
        Self {
            messages,
            journal,
            history_window,
            journal_window,
        }
    }

    pub fn assemble(
        &self,
        user_message: &str,
        context: &ReplyContext,
    ) -> Result<Vec<PromptMessage>, AgentError> {
        let mut segments = vec![PromptMessage::system(DAD_SYSTEM_PROMPT)];

        if let Some(conversation_id) = context.conversation_id.as_deref() {
            segments.extend(self.history(conversation_id, context.exclude_message_id.as_deref())?);
            if let Some(digest) = self.journal_digest(conversation_id)? {
                segments.push(digest);
            }
        }

        segments.push(PromptMessage::user(user_message));
        Ok(segments)
    }

    fn history(
        &self,
        conversation_id: &str,
        exclude: Option<&str>,
    ) -> Result<Vec<PromptMessage>, AgentError> {
        let fetch = self.history_window + usize::from(exclude.is_some());
        let recent = self
            .messages
            .recent_messages(conversation_id, fetch, false)
            .map_err(AgentError::ContextAssemblyFailed)?;

        let mut history = recent
            .into_iter()
            .filter(|m| Some(m.id.as_str()) != exclude)
            .take(self.history_window)
            .collect::<Vec<_>>();
        history.reverse();

        Ok(history
            .into_iter()
            .map(|m| match m.direction {
                MessageDirection::Incoming => PromptMessage::user(m.content),
                MessageDirection::Outgoing => PromptMessage::assistant(m.content),
            })
            .collect())
    }

    fn journal_digest(&self, conversation_id: &str) -> Result<Option<PromptMessage>, AgentError> {
        let mut entries = self
            .journal
            .recent_entries(conversation_id, self.journal_window)
            .map_err(AgentError::ContextAssemblyFailed)?;
        if entries.is_empty() {
            return Ok(None);
        }
        entries.reverse();

        let mut digest = String::from(JOURNAL_DIGEST_LABEL);
        for (index, entry) in entries.iter().enumerate() {
            digest.push_str(&format!("\n{}. {}", index + 1, entry.content.trim()));
        }
        Ok(Some(PromptMessage::system(digest)))
    }
}
