use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::LlmConfig;
use crate::models::{ChatMessage, Message, SamplingParams};

/// Inference engine behind the dispatcher. Chosen at construction time.
///
/// Implementations must tolerate up to `max_concurrency` concurrent
/// `generate` calls; the dispatcher provides no other synchronization.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// One-time initialization (model load, connectivity check).
    async fn start(&self) -> Result<()>;

    async fn generate(&self, messages: &[Message], params: &SamplingParams) -> Result<String>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<i32>,
    stream: bool,
    #[serde(flatten)]
    extra: &'a BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/v1/chat/completions` server (vLLM, llama-server).
#[derive(Clone)]
pub struct OpenAiChatBackend {
    client: Client,
    config: LlmConfig,
}

impl OpenAiChatBackend {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create LLM HTTP client")?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request<'a>(&'a self, messages: &[Message], params: &'a SamplingParams) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: self.config.model.as_deref(),
            messages: messages.iter().map(ChatMessage::from).collect(),
            max_tokens: params.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: params.temperature.unwrap_or(self.config.temperature),
            top_p: params.top_p.or(self.config.top_p),
            top_k: params.top_k.or(self.config.top_k),
            stream: false,
            extra: &params.extra,
        }
    }
}

#[async_trait]
impl GenerationBackend for OpenAiChatBackend {
    async fn start(&self) -> Result<()> {
        if !self.config.check_on_start {
            return Ok(());
        }
        let url = self.endpoint("/v1/models");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("LLM server unreachable at {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!("LLM server check failed ({})", response.status());
        }
        info!("LLM backend ready at {}", self.config.base_url);
        Ok(())
    }

    async fn generate(&self, messages: &[Message], params: &SamplingParams) -> Result<String> {
        debug!("Starting chat generation with {} messages", messages.len());

        let response = self
            .client
            .post(self.endpoint("/v1/chat/completions"))
            .json(&self.request(messages, params))
            .send()
            .await
            .context("Failed to call LLM API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error: {} - {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("LLM response has no choices")?;

        Ok(content.trim().to_string())
    }

    async fn close(&self) -> Result<()> {
        debug!("LLM backend closed");
        Ok(())
    }
}
