//! Reciprocal Rank Fusion over the dense and sparse result lists.
//!
//! Each item at 0-based rank `r` in a list contributes `weight / (rrf_k + r + 1)`.
//! Only rank positions matter, so cosine similarities and lexical scores never
//! have to be calibrated against each other.

use std::collections::HashMap;
use std::num::NonZeroU32;

use crate::models::{Modality, ScoredPoint, SearchHit};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
    pub weight_dense: f64,
    pub weight_sparse: f64,
    /// Smoothing constant. Larger values flatten the rank curve.
    pub rrf_k: NonZeroU32,
    pub top_k: usize,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            weight_dense: 1.0,
            weight_sparse: 1.0,
            rrf_k: NonZeroU32::new(60).unwrap_or(NonZeroU32::MIN),
            top_k: 5,
        }
    }
}

/// Fuses two ranked lists into at most `top_k` hits, best first.
///
/// Equal fused scores keep the order in which ids were first seen (dense list
/// first, then sparse). An id repeated inside one list only counts at its first
/// rank. The payload of a hit is taken from its first occurrence.
pub fn fuse(dense: &[ScoredPoint], sparse: &[ScoredPoint], params: &FusionParams) -> Vec<SearchHit> {
    let k = params.rrf_k.get() as f64;
    let mut hits: Vec<SearchHit> = Vec::with_capacity(dense.len() + sparse.len());
    let mut slot: HashMap<&str, usize> = HashMap::with_capacity(dense.len() + sparse.len());

    for (modality, list, weight) in [
        (Modality::Dense, dense, params.weight_dense),
        (Modality::Sparse, sparse, params.weight_sparse),
    ] {
        for (rank, point) in list.iter().enumerate() {
            let idx = *slot.entry(point.id.as_str()).or_insert_with(|| {
                hits.push(SearchHit {
                    id: point.id.clone(),
                    score_dense: None,
                    score_sparse: None,
                    fused_score: 0.0,
                    rerank_score: None,
                    payload: point.payload.clone(),
                });
                hits.len() - 1
            });

            let hit = &mut hits[idx];
            let seen = match modality {
                Modality::Dense => &mut hit.score_dense,
                Modality::Sparse => &mut hit.score_sparse,
            };
            if seen.is_some() {
                continue;
            }
            *seen = Some(point.score);
            hit.fused_score += weight / (k + rank as f64 + 1.0);
        }
    }

    // Stable sort: ties stay in first-occurrence order.
    hits.sort_by(|a, b| b.fused_score.total_cmp(&a.fused_score));
    hits.truncate(params.top_k);
    hits
}
