pub mod conversation;
pub mod embedding_service;
pub mod generation;
pub mod retrieval;
pub mod stats;

pub use embedding_service::{EmbeddingProvider, EmbeddingService};
