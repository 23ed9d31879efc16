use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::config::RerankerConfig;

/// Scores (query, passage) pairs jointly. One score per passage, same order,
/// higher is more relevant.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    request_id: u64,
    pairs: Vec<[&'a str; 2]>,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

/// HTTP client for a cross-encoder service exposing `POST /rerank/`.
pub struct HttpReranker {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpReranker {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to build reranker HTTP client")?;

        Ok(Self {
            client,
            url: format!(
                "{}{}",
                config.base_url.trim_end_matches('/'),
                config.endpoint
            ),
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let request = RerankRequest {
            request_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pairs: passages.iter().map(|p| [query, p.as_str()]).collect(),
        };
        debug!(request_id = request.request_id, pairs = passages.len(), "Reranking candidates");

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("Failed to connect to reranker")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Reranker API error ({}): {}", status, body);
        }

        let body: RerankResponse = response
            .json()
            .await
            .context("Failed to parse reranker response")?;

        if body.scores.len() != passages.len() {
            anyhow::bail!(
                "Reranker returned {} scores for {} passages",
                body.scores.len(),
                passages.len()
            );
        }
        Ok(body.scores)
    }
}
