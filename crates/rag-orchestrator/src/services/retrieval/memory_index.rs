use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use tracing::debug;

use super::{DenseRetriever, IndexedPoint, SparseRetriever, VectorStore};
use crate::models::{ScoredPoint, SparseVector};

/// Process-local vector collection: brute-force cosine for the dense vector,
/// dot product for the sparse one. For tests and small corpora.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    points: RwLock<Vec<IndexedPoint>>,
    dimension: RwLock<Option<usize>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }

    fn rank<F>(&self, limit: usize, score: F) -> Vec<ScoredPoint>
    where
        F: Fn(&IndexedPoint) -> Option<f32>,
    {
        let points = self.points.read();
        let mut scored: Vec<ScoredPoint> = points
            .iter()
            .filter_map(|p| {
                score(p).map(|s| ScoredPoint {
                    id: p.id.clone(),
                    score: s,
                    payload: p.payload.clone(),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(limit);
        scored
    }
}

fn cosine(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return Some(0.0);
    }
    Some((dot / (na * nb)).clamp(-1.0, 1.0))
}

#[async_trait]
impl DenseRetriever for InMemoryVectorIndex {
    async fn search_dense(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredPoint>> {
        if let Some(dim) = *self.dimension.read() {
            if dim != vector.len() {
                anyhow::bail!("Query dimension mismatch: expected {}, got {}", dim, vector.len());
            }
        }
        Ok(self.rank(limit, |p| cosine(&p.dense, vector)))
    }
}

#[async_trait]
impl SparseRetriever for InMemoryVectorIndex {
    async fn search_sparse(&self, vector: &SparseVector, limit: usize) -> Result<Vec<ScoredPoint>> {
        Ok(self.rank(limit, |p| {
            let s = p.sparse.dot(vector);
            (s > 0.0).then_some(s)
        }))
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorIndex {
    async fn ensure_collection(&self, dense_dim: usize) -> Result<()> {
        let mut dim = self.dimension.write();
        let current = *dim;
        match current {
            Some(existing) if existing != dense_dim => {
                anyhow::bail!("Collection exists with dimension {}, requested {}", existing, dense_dim)
            }
            _ => *dim = Some(dense_dim),
        }
        Ok(())
    }

    async fn upsert(&self, batch: Vec<IndexedPoint>) -> Result<()> {
        let expected = *self.dimension.read();
        let mut points = self.points.write();
        let count = batch.len();
        for point in batch {
            if let Some(dim) = expected {
                if point.dense.len() != dim {
                    anyhow::bail!(
                        "Point {} has dimension {}, expected {}",
                        point.id,
                        point.dense.len(),
                        dim
                    );
                }
            }
            match points.iter_mut().find(|p| p.id == point.id) {
                Some(existing) => *existing = point,
                None => points.push(point),
            }
        }
        debug!("Upserted {} points (total {})", count, points.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::retrieval::{HashingSparseEncoder, SparseEncoder};
    use serde_json::{json, Map, Value};

    fn payload(content: &str) -> Map<String, Value> {
        json!({ "content": content }).as_object().cloned().unwrap()
    }

    fn point(id: &str, dense: Vec<f32>, text: &str) -> IndexedPoint {
        IndexedPoint {
            id: id.into(),
            dense,
            sparse: HashingSparseEncoder::default().encode_document(text),
            payload: payload(text),
        }
    }

    #[tokio::test]
    async fn test_dense_ranking() {
        let index = InMemoryVectorIndex::new();
        index.ensure_collection(2).await.unwrap();
        index
            .upsert(vec![
                point("a", vec![1.0, 0.0], "alpha"),
                point("b", vec![0.7, 0.7], "beta"),
                point("c", vec![0.0, 1.0], "gamma"),
            ])
            .await
            .unwrap();

        let hits = index.search_dense(&[1.0, 0.1], 2).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(index.search_dense(&[1.0, 0.0, 0.0], 2).await.is_err());
    }

    #[tokio::test]
    async fn test_sparse_skips_non_matching_and_upsert_replaces() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(vec![
                point("a", vec![1.0], "income tax rate"),
                point("b", vec![1.0], "office hours"),
            ])
            .await
            .unwrap();
        index.upsert(vec![point("b", vec![1.0], "tax deadline")]).await.unwrap();
        assert_eq!(index.len(), 2);

        let q = HashingSparseEncoder::default().encode_query("tax");
        let hits = index.search_sparse(&q, 10).await.unwrap();
        assert_eq!(hits.len(), 2);

        let q = HashingSparseEncoder::default().encode_query("hours");
        assert!(index.search_sparse(&q, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dimension_conflict() {
        let index = InMemoryVectorIndex::new();
        index.ensure_collection(3).await.unwrap();
        assert!(index.ensure_collection(4).await.is_err());
        assert!(index.upsert(vec![point("x", vec![1.0], "x")]).await.is_err());
    }
}
