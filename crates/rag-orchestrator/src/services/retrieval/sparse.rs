use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::SparseVector;
use crate::utils::text::{LowercaseNormalizer, TextNormalizer};

/// Maps text to a term-weighted sparse vector.
pub trait SparseEncoder: Send + Sync {
    fn encode_document(&self, text: &str) -> SparseVector;
    fn encode_query(&self, text: &str) -> SparseVector;
}

/// Bag-of-words encoder with stable hashed term indices.
///
/// Document terms get BM25-saturated weights; query terms weigh 1.0 each, so
/// the dot product of the two is a BM25-style score without IDF.
pub struct HashingSparseEncoder {
    normalizer: Arc<dyn TextNormalizer>,
    k1: f32,
    b: f32,
    avg_doc_len: f32,
}

impl HashingSparseEncoder {
    pub fn new(normalizer: Arc<dyn TextNormalizer>) -> Self {
        Self {
            normalizer,
            k1: 1.2,
            b: 0.75,
            avg_doc_len: 64.0,
        }
    }

    pub fn with_bm25(mut self, k1: f32, b: f32, avg_doc_len: f32) -> Self {
        self.k1 = k1;
        self.b = b;
        self.avg_doc_len = avg_doc_len.max(1.0);
        self
    }

    pub fn term_index(term: &str) -> u32 {
        let digest = Sha256::digest(term.as_bytes());
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    fn term_frequencies(&self, text: &str) -> (BTreeMap<u32, f32>, usize) {
        let mut tf = BTreeMap::new();
        let terms = self.normalizer.terms(text);
        let len = terms.len();
        for term in terms {
            *tf.entry(Self::term_index(&term)).or_insert(0.0) += 1.0;
        }
        (tf, len)
    }

    fn into_vector(weights: BTreeMap<u32, f32>) -> SparseVector {
        let (indices, values) = weights.into_iter().unzip();
        SparseVector { indices, values }
    }
}

impl Default for HashingSparseEncoder {
    fn default() -> Self {
        Self::new(Arc::new(LowercaseNormalizer))
    }
}

impl SparseEncoder for HashingSparseEncoder {
    fn encode_document(&self, text: &str) -> SparseVector {
        let (tf, len) = self.term_frequencies(text);
        let norm = self.k1 * (1.0 - self.b + self.b * len as f32 / self.avg_doc_len);
        let weights = tf
            .into_iter()
            .map(|(idx, f)| (idx, f * (self.k1 + 1.0) / (f + norm)))
            .collect();
        Self::into_vector(weights)
    }

    fn encode_query(&self, text: &str) -> SparseVector {
        let (tf, _) = self.term_frequencies(text);
        Self::into_vector(tf.into_keys().map(|idx| (idx, 1.0)).collect())
    }
}
