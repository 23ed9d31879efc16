use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::dispatcher::GenerationDispatcher;
use crate::models::{GenerationRequest, Message, SamplingParams};

/// Derives a short label from recent dialogue.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, conversation_id: &str, recent: &[Message]) -> Result<String>;
}

/// Summarizes through the shared dispatcher so theme calls count against the
/// same concurrency limit as answers.
pub struct DispatcherSummarizer {
    dispatcher: Arc<GenerationDispatcher>,
    instruction: String,
    params: SamplingParams,
    timeout: Option<Duration>,
}

impl DispatcherSummarizer {
    pub fn new(dispatcher: Arc<GenerationDispatcher>, instruction: impl Into<String>) -> Self {
        Self {
            dispatcher,
            instruction: instruction.into(),
            params: SamplingParams::default().with_max_tokens(32).with_temperature(0.2),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Instruction as system message, the dialogue flattened into one user message.
    fn prompt(&self, recent: &[Message]) -> Vec<Message> {
        let compact = recent
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        vec![Message::system(&self.instruction), Message::user(compact)]
    }
}

/// First line, without surrounding quotes or trailing punctuation.
pub fn clean_label(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '«' || c == '»')
        .trim_end_matches(['.', '!', ';'])
        .trim()
        .to_string()
}

#[async_trait]
impl Summarizer for DispatcherSummarizer {
    async fn summarize(&self, conversation_id: &str, recent: &[Message]) -> Result<String> {
        let mut request = GenerationRequest::new(conversation_id, self.prompt(recent))
            .with_params(self.params.clone());
        request.timeout = self.timeout;

        let raw = self.dispatcher.generate(request).await?;
        let label = clean_label(&raw);
        if label.is_empty() {
            anyhow::bail!("Summarizer returned an empty label");
        }
        Ok(label)
    }
}
