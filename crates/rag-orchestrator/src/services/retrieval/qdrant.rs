use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DenseRetriever, IndexedPoint, SparseRetriever, VectorStore};
use crate::config::VectorDbConfig;
use crate::models::{ScoredPoint, SparseVector};

/// Payload key holding the caller's point id when Qdrant needs a derived one.
const SOURCE_ID_KEY: &str = "source_id";

/// Qdrant collection accessed over its REST API.
#[derive(Clone)]
pub struct QdrantStore {
    client: Client,
    base_url: String,
    collection: String,
    dense_name: String,
    sparse_name: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

impl QdrantStore {
    pub fn new(config: &VectorDbConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to build Qdrant HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            dense_name: config.dense_vector_name.clone(),
            sparse_name: config.sparse_vector_name.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }

    /// Qdrant only accepts unsigned integers or UUIDs as point ids.
    fn point_id(id: &str) -> (Value, bool) {
        if let Ok(n) = id.parse::<u64>() {
            return (json!(n), false);
        }
        if let Ok(u) = Uuid::parse_str(id) {
            return (json!(u.to_string()), false);
        }
        let digest = Sha256::digest(id.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        (json!(Uuid::from_bytes(bytes).to_string()), true)
    }

    async fn search(&self, vector: Value, limit: usize) -> Result<Vec<ScoredPoint>> {
        let body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
            "with_vector": false,
        });

        let response = self
            .authorize(self.client.post(self.url("/points/search")))
            .json(&body)
            .send()
            .await
            .context("Failed to connect to Qdrant")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Qdrant search error ({}): {}", status, text);
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .context("Failed to parse Qdrant search response")?;

        Ok(parsed.result.into_iter().map(Self::to_scored).collect())
    }

    fn to_scored(hit: RawHit) -> ScoredPoint {
        let payload = hit.payload.unwrap_or_default();
        let id = payload
            .get(SOURCE_ID_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| match &hit.id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        ScoredPoint {
            id,
            score: hit.score,
            payload,
        }
    }
}

#[async_trait]
impl DenseRetriever for QdrantStore {
    async fn search_dense(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredPoint>> {
        self.search(json!({ "name": self.dense_name, "vector": vector }), limit)
            .await
    }
}

#[async_trait]
impl SparseRetriever for QdrantStore {
    async fn search_sparse(&self, vector: &SparseVector, limit: usize) -> Result<Vec<ScoredPoint>> {
        if vector.is_empty() {
            return Ok(Vec::new());
        }
        self.search(
            json!({
                "name": self.sparse_name,
                "vector": { "indices": vector.indices, "values": vector.values },
            }),
            limit,
        )
        .await
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, dense_dim: usize) -> Result<()> {
        let existing = self
            .authorize(self.client.get(self.url("")))
            .send()
            .await
            .context("Failed to connect to Qdrant")?;

        if existing.status().is_success() {
            debug!("Qdrant collection '{}' already exists", self.collection);
            return Ok(());
        }
        if existing.status() != StatusCode::NOT_FOUND {
            anyhow::bail!("Qdrant collection lookup failed ({})", existing.status());
        }

        let body = json!({
            "vectors": { &self.dense_name: { "size": dense_dim, "distance": "Cosine" } },
            "sparse_vectors": { &self.sparse_name: { "index": { "on_disk": false } } },
        });
        let response = self
            .authorize(self.client.put(self.url("")))
            .json(&body)
            .send()
            .await
            .context("Failed to create Qdrant collection")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Qdrant create collection error ({}): {}", status, text);
        }

        info!(
            "Created Qdrant collection '{}' (dense '{}' dim {}, sparse '{}')",
            self.collection, self.dense_name, dense_dim, self.sparse_name
        );
        Ok(())
    }

    async fn upsert(&self, points: Vec<IndexedPoint>) -> Result<()> {
        let count = points.len();
        let points: Vec<Value> = points
            .into_iter()
            .map(|p| {
                let (id, derived) = Self::point_id(&p.id);
                let mut payload = p.payload;
                if derived {
                    payload.insert(SOURCE_ID_KEY.to_string(), Value::String(p.id));
                }
                json!({
                    "id": id,
                    "vector": {
                        &self.dense_name: p.dense,
                        &self.sparse_name: { "indices": p.sparse.indices, "values": p.sparse.values },
                    },
                    "payload": payload,
                })
            })
            .collect();

        let response = self
            .authorize(self.client.put(self.url("/points?wait=true")))
            .json(&json!({ "points": points }))
            .send()
            .await
            .context("Failed to connect to Qdrant")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Qdrant upsert error ({}): {}", status, text);
        }

        info!("Upserted {} points into '{}'", count, self.collection);
        Ok(())
    }
}
