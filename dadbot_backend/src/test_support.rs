//! Doubles shared by the unit tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm_client::{CompletionEngine, CompletionError, CompletionRequest};
use crate::store::{
    Conversation, Directory, JournalEntry, JournalStore, Message, MessageDirection, MessageStore,
    StoreError, StoreResult, User,
};
use crate::twilio::{OutboundMessenger, TwilioError};

/// Completion engine that answers from a script and records every request.
///
/// Requests carrying an explicit model (journal calls) get `journal_reply`;
/// everything else pops `replies` and then repeats `default_reply`. `None`
/// anywhere means the call fails.
pub(crate) struct ScriptedEngine {
    replies: Mutex<VecDeque<Option<String>>>,
    default_reply: Option<String>,
    journal_reply: Option<String>,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedEngine {
    pub(crate) fn replying(text: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: Some(text.to_string()),
            journal_reply: Some(format!("journal: {}", text)),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            default_reply: None,
            journal_reply: None,
            ..Self::replying("")
        }
    }

    pub(crate) fn then(self, reply: Option<&str>) -> Self {
        self.replies
            .lock()
            .expect("script lock")
            .push_back(reply.map(str::to_string));
        self
    }

    pub(crate) fn with_journal_reply(mut self, reply: Option<&str>) -> Self {
        self.journal_reply = reply.map(str::to_string);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub(crate) fn journal_requests(&self) -> Vec<CompletionRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.model.is_some())
            .collect()
    }
}

#[async_trait]
impl CompletionEngine for ScriptedEngine {
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        let is_journal = request.model.is_some();
        self.requests.lock().expect("requests lock").push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = if is_journal {
            self.journal_reply.clone()
        } else {
            self.replies
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| self.default_reply.clone())
        };
        reply.ok_or_else(|| CompletionError::Transport("scripted failure".to_string()))
    }
}

/// Every store operation fails.
pub(crate) struct FailingStore;

fn offline<T>() -> StoreResult<T> {
    Err(StoreError::Malformed("store offline".to_string()))
}

impl Directory for FailingStore {
    fn get_or_create_user(&self, _phone_number: &str) -> StoreResult<User> {
        offline()
    }

    fn get_or_create_conversation(&self, _user_id: &str) -> StoreResult<Conversation> {
        offline()
    }

    fn create_conversation(
        &self,
        _user_id: &str,
        _tags: &BTreeSet<String>,
    ) -> StoreResult<Conversation> {
        offline()
    }

    fn get_conversation(&self, _conversation_id: &str) -> StoreResult<Option<Conversation>> {
        offline()
    }

    fn list_conversations_for_user(&self, _user_id: &str) -> StoreResult<Vec<Conversation>> {
        offline()
    }
}

impl MessageStore for FailingStore {
    fn create_message(
        &self,
        _conversation_id: &str,
        _content: &str,
        _direction: MessageDirection,
    ) -> StoreResult<Message> {
        offline()
    }

    fn recent_messages(
        &self,
        _conversation_id: &str,
        _limit: usize,
        _unconsumed_only: bool,
    ) -> StoreResult<Vec<Message>> {
        offline()
    }

    fn mark_journaled(&self, _ids: &[String]) -> StoreResult<usize> {
        offline()
    }

    fn list_messages(&self, _conversation_id: &str) -> StoreResult<Vec<Message>> {
        offline()
    }
}

impl JournalStore for FailingStore {
    fn create_entry(&self, _conversation_id: &str, _content: &str) -> StoreResult<JournalEntry> {
        offline()
    }

    fn recent_entries(
        &self,
        _conversation_id: &str,
        _limit: usize,
    ) -> StoreResult<Vec<JournalEntry>> {
        offline()
    }

    fn delete_entry(&self, _id: &str) -> StoreResult<()> {
        offline()
    }
}

/// Captures outbound texts instead of calling Twilio.
#[derive(Default)]
pub(crate) struct RecordingMessenger {
    sent: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingMessenger {
    pub(crate) fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl OutboundMessenger for RecordingMessenger {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), TwilioError> {
        if self.fail {
            return Err(TwilioError::Api {
                status: 500,
                body: "carrier unavailable".to_string(),
            });
        }
        self.sent
            .lock()
            .expect("sent lock")
            .push((to.to_string(), body.to_string()));
        Ok(())
    }
}
