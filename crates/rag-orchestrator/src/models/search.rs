use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Retrieval modality feeding the fusion step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Dense,
    Sparse,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::Sparse => "sparse",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Term-weighted vector: parallel `indices` / `values`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Dot product over shared indices. Both sides may be unsorted.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        let lookup: std::collections::HashMap<u32, f32> = large
            .indices
            .iter()
            .copied()
            .zip(large.values.iter().copied())
            .collect();

        small
            .indices
            .iter()
            .zip(small.values.iter())
            .filter_map(|(idx, v)| lookup.get(idx).map(|w| v * w))
            .sum()
    }
}

/// One ranked item returned by a dense or sparse retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// Fused result. Produced fresh per query; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score_dense: Option<f32>,
    pub score_sparse: Option<f32>,
    pub fused_score: f64,
    /// Cross-encoder score, when a reranker reordered the hits.
    pub rerank_score: Option<f32>,
    pub payload: Map<String, Value>,
}

/// Passage handed to prompt assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub content: String,
    pub common_url: Option<String>,
    pub chunk_url: Option<String>,
}

impl RetrievedDocument {
    /// Chunk-level link when present, otherwise the document-level link.
    pub fn link(&self) -> Option<&str> {
        self.chunk_url
            .as_deref()
            .or(self.common_url.as_deref())
            .filter(|l| !l.trim().is_empty())
    }

    /// Reads `content`, `chunk_url` and `common_url` from a point payload.
    /// Url fields are looked up at the top level first, then under `meta`.
    pub fn from_payload(payload: &Map<String, Value>) -> Option<Self> {
        let content = payload.get("content").and_then(Value::as_str)?.to_string();
        let meta = payload.get("meta").and_then(Value::as_object);

        let field = |name: &str| -> Option<String> {
            payload
                .get(name)
                .and_then(Value::as_str)
                .or_else(|| meta.and_then(|m| m.get(name)).and_then(Value::as_str))
                .map(str::to_string)
        };

        Some(Self {
            content,
            common_url: field("common_url"),
            chunk_url: field("chunk_url"),
        })
    }
}
