//! Retrieval collaborators and the hybrid (dense + sparse) search path.

pub mod fusion;
pub mod hybrid;
pub mod memory_index;
pub mod qdrant;
pub mod rerank;
pub mod sparse;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::models::{ScoredPoint, SparseVector};

pub use fusion::{fuse, FusionParams};
pub use hybrid::{HybridOutcome, HybridRetriever};
pub use memory_index::InMemoryVectorIndex;
pub use qdrant::QdrantStore;
pub use rerank::{HttpReranker, Reranker};
pub use sparse::{HashingSparseEncoder, SparseEncoder};

/// Ranked similarity search over the named dense vector.
#[async_trait]
pub trait DenseRetriever: Send + Sync {
    async fn search_dense(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredPoint>>;
}

/// Ranked similarity search over the named sparse (lexical) vector.
#[async_trait]
pub trait SparseRetriever: Send + Sync {
    async fn search_sparse(&self, vector: &SparseVector, limit: usize) -> Result<Vec<ScoredPoint>>;
}

/// Point carrying both named vectors.
#[derive(Debug, Clone)]
pub struct IndexedPoint {
    pub id: String,
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
    pub payload: Map<String, Value>,
}

/// Vector database holding one collection with a dense and a sparse vector per point.
#[async_trait]
pub trait VectorStore: DenseRetriever + SparseRetriever {
    async fn ensure_collection(&self, dense_dim: usize) -> Result<()>;
    async fn upsert(&self, points: Vec<IndexedPoint>) -> Result<()>;
}
