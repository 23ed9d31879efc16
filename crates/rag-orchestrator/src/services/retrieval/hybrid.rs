use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::fusion::{fuse, FusionParams};
use super::rerank::Reranker;
use super::sparse::SparseEncoder;
use super::{DenseRetriever, IndexedPoint, SparseRetriever, VectorStore};
use crate::models::{Modality, ScoredPoint, SearchHit};
use crate::services::embedding_service::EmbeddingProvider;
use crate::utils::error::RagError;

/// Result of one hybrid search. `degraded` lists the modalities that failed
/// or timed out and were fused as empty lists, plus a failed rerank pass.
#[derive(Debug, Default)]
pub struct HybridOutcome {
    pub hits: Vec<SearchHit>,
    pub degraded: Vec<RagError>,
}

impl HybridOutcome {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Runs dense and sparse retrieval concurrently, each under its own deadline,
/// and fuses whatever came back. With a reranker attached, a wider fused
/// candidate list is rescored by the cross-encoder and cut to `top_k`.
pub struct HybridRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    encoder: Arc<dyn SparseEncoder>,
    dense: Arc<dyn DenseRetriever>,
    sparse: Arc<dyn SparseRetriever>,
    params: FusionParams,
    candidate_limit: usize,
    timeout: Duration,
    reranker: Option<Arc<dyn Reranker>>,
    rerank_candidates: usize,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        encoder: Arc<dyn SparseEncoder>,
        dense: Arc<dyn DenseRetriever>,
        sparse: Arc<dyn SparseRetriever>,
        params: FusionParams,
    ) -> Self {
        Self {
            embedder,
            encoder,
            dense,
            sparse,
            params,
            candidate_limit: 200,
            timeout: Duration::from_secs(3),
            reranker: None,
            rerank_candidates: 0,
        }
    }

    /// Both named vectors served by one store.
    pub fn with_store<S>(
        embedder: Arc<dyn EmbeddingProvider>,
        encoder: Arc<dyn SparseEncoder>,
        store: Arc<S>,
        params: FusionParams,
    ) -> Self
    where
        S: VectorStore + 'static,
    {
        Self::new(embedder, encoder, store.clone(), store, params)
    }

    pub fn with_candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = limit.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fuses `candidates` hits (never fewer than `top_k`) and lets `reranker`
    /// pick the final order.
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>, candidates: usize) -> Self {
        self.reranker = Some(reranker);
        self.rerank_candidates = candidates;
        self
    }

    pub fn params(&self) -> &FusionParams {
        &self.params
    }

    pub async fn search(&self, query: &str) -> HybridOutcome {
        let limit = self.candidate_limit;

        let dense = self.bounded(Modality::Dense, async {
            let vector = self.embedder.embed(query).await?;
            self.dense.search_dense(&vector, limit).await
        });
        let sparse = self.bounded(Modality::Sparse, async {
            let vector = self.encoder.encode_query(query);
            if vector.is_empty() {
                return Ok(Vec::new());
            }
            self.sparse.search_sparse(&vector, limit).await
        });

        let (dense, sparse) = tokio::join!(dense, sparse);

        let mut degraded = Vec::new();
        let dense = dense.unwrap_or_else(|e| {
            degraded.push(e);
            Vec::new()
        });
        let sparse = sparse.unwrap_or_else(|e| {
            degraded.push(e);
            Vec::new()
        });

        let mut params = self.params;
        if self.reranker.is_some() {
            params.top_k = params.top_k.max(self.rerank_candidates);
        }
        let mut hits = fuse(&dense, &sparse, &params);
        debug!(
            dense = dense.len(),
            sparse = sparse.len(),
            fused = hits.len(),
            "Hybrid search complete"
        );

        if let Some(reranker) = &self.reranker {
            if let Err(e) = self.rerank(reranker.as_ref(), query, &mut hits).await {
                warn!("Keeping fused order: {}", e);
                degraded.push(e);
            }
            hits.truncate(self.params.top_k);
        }

        HybridOutcome { hits, degraded }
    }

    /// Reorders `hits` by cross-encoder score. Equal scores keep fused order.
    async fn rerank(
        &self,
        reranker: &dyn Reranker,
        query: &str,
        hits: &mut [SearchHit],
    ) -> Result<(), RagError> {
        if hits.is_empty() {
            return Ok(());
        }
        let passages: Vec<String> = hits
            .iter()
            .map(|hit| {
                hit.payload
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();

        let scores = match tokio::time::timeout(self.timeout, reranker.rerank(query, &passages)).await {
            Ok(Ok(scores)) => scores,
            Ok(Err(e)) => return Err(RagError::RerankUnavailable(e.to_string())),
            Err(_) => {
                return Err(RagError::RerankUnavailable(format!(
                    "timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        };
        if scores.len() != hits.len() {
            return Err(RagError::RerankUnavailable(format!(
                "{} scores for {} candidates",
                scores.len(),
                hits.len()
            )));
        }

        for (hit, score) in hits.iter_mut().zip(scores) {
            hit.rerank_score = Some(score);
        }
        let key = |hit: &SearchHit| hit.rerank_score.unwrap_or(f32::NEG_INFINITY);
        hits.sort_by(|a, b| key(b).total_cmp(&key(a)));
        Ok(())
    }

    async fn bounded<F>(&self, modality: Modality, fut: F) -> Result<Vec<ScoredPoint>, RagError>
    where
        F: Future<Output = anyhow::Result<Vec<ScoredPoint>>>,
    {
        let reason = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(points)) => return Ok(points),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", self.timeout.as_millis()),
        };
        warn!("{} retrieval degraded to empty list: {}", modality, reason);
        Err(RagError::RetrievalUnavailable { modality, reason })
    }
}

/// Embeds and encodes passages, then upserts them into the store.
pub async fn index_passages(
    embedder: &dyn EmbeddingProvider,
    encoder: &dyn SparseEncoder,
    store: &dyn VectorStore,
    passages: Vec<(String, serde_json::Map<String, serde_json::Value>)>,
) -> anyhow::Result<usize> {
    let mut points = Vec::with_capacity(passages.len());
    for (id, payload) in passages {
        let content = payload
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        points.push(IndexedPoint {
            id,
            dense: embedder.embed(&content).await?,
            sparse: encoder.encode_document(&content),
            payload,
        });
    }
    let count = points.len();
    store.upsert(points).await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::embedding_service::MockEmbeddingProvider;
    use crate::services::retrieval::rerank::MockReranker;
    use crate::services::retrieval::{HashingSparseEncoder, InMemoryVectorIndex};
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowDense;

    #[async_trait]
    impl DenseRetriever for SlowDense {
        async fn search_dense(&self, _: &[f32], _: usize) -> anyhow::Result<Vec<ScoredPoint>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    fn embedder() -> Arc<MockEmbeddingProvider> {
        let mut mock = MockEmbeddingProvider::new();
        mock.expect_embed().returning(|text| {
            Ok(if text.contains("tax") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
        });
        Arc::new(mock)
    }

    async fn seeded_index() -> Arc<InMemoryVectorIndex> {
        let index = Arc::new(InMemoryVectorIndex::new());
        let passages = vec![
            ("1".to_string(), json!({ "content": "income tax rate is 13%" })),
            ("2".to_string(), json!({ "content": "office opening hours" })),
        ];
        let passages = passages
            .into_iter()
            .map(|(id, p)| (id, p.as_object().cloned().unwrap()))
            .collect();
        index_passages(
            embedder().as_ref(),
            &HashingSparseEncoder::default(),
            index.as_ref(),
            passages,
        )
        .await
        .unwrap();
        index
    }

    #[tokio::test]
    async fn test_hybrid_search_fuses_both_modalities() {
        let index = seeded_index().await;
        let retriever = HybridRetriever::with_store(
            embedder(),
            Arc::new(HashingSparseEncoder::default()),
            index,
            FusionParams::default(),
        );

        let outcome = retriever.search("tax rate").await;
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.hits[0].id, "1");
        assert!(outcome.hits[0].score_dense.is_some());
        assert!(outcome.hits[0].score_sparse.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_modality_degrades_to_empty() {
        let index = seeded_index().await;
        let retriever = HybridRetriever::new(
            embedder(),
            Arc::new(HashingSparseEncoder::default()),
            Arc::new(SlowDense),
            index,
            FusionParams::default(),
        )
        .with_timeout(Duration::from_millis(100));

        let outcome = retriever.search("tax rate").await;
        assert_eq!(outcome.degraded.len(), 1);
        assert_eq!(outcome.degraded[0].kind(), "retrieval_unavailable");
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].id, "1");
        assert!(outcome.hits[0].score_dense.is_none());
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_dense() {
        let mut mock = MockEmbeddingProvider::new();
        mock.expect_embed()
            .returning(|_| Err(anyhow::anyhow!("embedding server down")));
        let index = seeded_index().await;
        let retriever = HybridRetriever::with_store(
            Arc::new(mock),
            Arc::new(HashingSparseEncoder::default()),
            index,
            FusionParams::default(),
        );

        let outcome = retriever.search("office hours").await;
        assert!(outcome.is_degraded());
        assert_eq!(outcome.hits[0].id, "2");
    }

    fn retriever_with(reranker: MockReranker, top_k: usize, index: Arc<InMemoryVectorIndex>) -> HybridRetriever {
        HybridRetriever::with_store(
            embedder(),
            Arc::new(HashingSparseEncoder::default()),
            index,
            FusionParams {
                top_k,
                ..FusionParams::default()
            },
        )
        .with_reranker(Arc::new(reranker), 10)
    }

    #[tokio::test]
    async fn test_reranker_reorders_and_cuts_to_top_k() {
        let mut reranker = MockReranker::new();
        reranker
            .expect_rerank()
            .times(1)
            .returning(|query, passages| {
                assert_eq!(query, "tax rate");
                // Both passages reach the cross-encoder even though top_k is 1.
                assert_eq!(passages.len(), 2);
                Ok(passages
                    .iter()
                    .map(|p| if p.contains("office") { 0.9 } else { 0.2 })
                    .collect())
            });

        let outcome = retriever_with(reranker, 1, seeded_index().await).search("tax rate").await;
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].id, "2");
        assert_eq!(outcome.hits[0].rerank_score, Some(0.9));
    }

    #[tokio::test]
    async fn test_reranker_failure_keeps_fused_order() {
        let mut reranker = MockReranker::new();
        reranker
            .expect_rerank()
            .returning(|_, _| Err(anyhow::anyhow!("cross-encoder down")));

        let outcome = retriever_with(reranker, 1, seeded_index().await).search("tax rate").await;
        assert_eq!(outcome.degraded.len(), 1);
        assert_eq!(outcome.degraded[0].kind(), "rerank_unavailable");
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].id, "1");
        assert!(outcome.hits[0].rerank_score.is_none());
    }

    #[tokio::test]
    async fn test_reranker_with_wrong_score_count_is_ignored() {
        let mut reranker = MockReranker::new();
        reranker.expect_rerank().returning(|_, _| Ok(vec![1.0]));

        let outcome = retriever_with(reranker, 2, seeded_index().await).search("tax rate").await;
        assert_eq!(outcome.degraded[0].kind(), "rerank_unavailable");
        assert_eq!(
            outcome.hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(),
            vec!["1", "2"]
        );
    }
}
