use std::sync::Arc;
use std::time::Duration;

use crate::config::BotConfig;
use crate::llm_client::{CompletionEngine, CompletionError, CompletionRequest};

use super::context::{ContextAssembler, ReplyContext};
use super::{AgentError, FALLBACK_REPLY};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplySettings {
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self {
            max_tokens: 200,
            temperature: 0.8,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ReplySettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            max_tokens: config.reply_max_tokens,
            temperature: config.reply_temperature,
            timeout: Duration::from_secs(config.llm_timeout_secs),
        }
    }
}

/// Produces Dad's reply to one inbound text. Never fails: any problem with
/// the context or the engine collapses to [`FALLBACK_REPLY`].
pub struct ReplyGenerator {
    assembler: ContextAssembler,
    engine: Arc<dyn CompletionEngine>,
    settings: ReplySettings,
}

impl ReplyGenerator {
    pub fn new(
        assembler: ContextAssembler,
        engine: Arc<dyn CompletionEngine>,
        settings: ReplySettings,
    ) -> Self {
        Self {
            assembler,
            engine,
            settings,
        }
    }

    pub async fn generate_reply(&self, message: &str, context: &ReplyContext) -> String {
        match self.try_generate(message, context).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(
                    "Reply generation for {} failed, using fallback: {}",
                    context.origin_id,
                    error
                );
                FALLBACK_REPLY.to_string()
            }
        }
    }

    async fn try_generate(
        &self,
        message: &str,
        context: &ReplyContext,
    ) -> Result<String, AgentError> {
        let messages = self.assembler.assemble(message, context)?;
        let request = CompletionRequest {
            messages,
            model: None,
            max_tokens: Some(self.settings.max_tokens),
            temperature: Some(self.settings.temperature),
            user: Some(context.origin_id.clone()),
        };

        let reply = tokio::time::timeout(self.settings.timeout, self.engine.complete(request))
            .await
            .map_err(|_| CompletionError::Timeout(self.settings.timeout))??;

        let reply = reply.trim();
        if reply.is_empty() {
            return Err(CompletionError::Empty.into());
        }
        Ok(reply.to_string())
    }
}
