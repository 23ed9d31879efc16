use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingConfig;

/// Maps text to a dense vector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    content: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

/// HTTP client for an embedding server (llama.cpp `/embedding` or OpenAI-compatible).
#[derive(Clone)]
pub struct EmbeddingService {
    client: Client,
    url: String,
    model: Option<String>,
    dimension: usize,
}

impl EmbeddingService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to build embedding HTTP client")?;

        Ok(Self {
            client,
            url: format!(
                "{}{}",
                config.base_url.trim_end_matches('/'),
                config.endpoint
            ),
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Accepts `{"embedding": [...]}`, `{"data": [{"embedding": [...]}]}`,
    /// `[{"embedding": [...]}]` and a bare `[...]`.
    fn parse_embedding(json: &Value) -> Result<Vec<f32>> {
        let floats = |v: &Value| -> Option<Vec<f32>> {
            v.as_array().map(|arr| {
                arr.iter()
                    .filter_map(|x| x.as_f64().map(|f| f as f32))
                    .collect()
            })
        };

        let embedding = match json {
            Value::Array(arr) => match arr.first() {
                None => anyhow::bail!("Empty array returned from embedding server"),
                Some(first) if first.get("embedding").is_some() => floats(&first["embedding"]),
                Some(_) => floats(json),
            },
            Value::Object(obj) => match (obj.get("embedding"), obj.get("data")) {
                (Some(e), _) => floats(e),
                (None, Some(data)) => data
                    .as_array()
                    .and_then(|d| d.first())
                    .and_then(|first| floats(&first["embedding"])),
                _ => None,
            },
            _ => None,
        };

        embedding.with_context(|| format!("Unrecognized embedding response format: {}", json))
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for {} chars", text.len());

        let request = EmbeddingRequest {
            content: text,
            input: text,
            model: self.model.as_deref(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("Failed to connect to embedding server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error ({}): {}", status, body);
        }

        let json: Value = response
            .json()
            .await
            .context("Failed to parse embedding response as JSON")?;

        let embedding = Self::parse_embedding(&json)?;
        if embedding.is_empty() {
            anyhow::bail!("Generated embedding is empty");
        }
        if embedding.len() != self.dimension {
            anyhow::bail!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            );
        }

        Ok(embedding)
    }
}
