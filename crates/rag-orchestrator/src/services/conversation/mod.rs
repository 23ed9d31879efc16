//! Conversation turn handling
//!
//! - Token-budgeted history assembly
//! - Retrieval policy and context formatting
//! - Citation checks against the retrieved links
//! - The orchestrator tying it to retrieval, generation and persistence

mod cache;
mod citations;
mod context_builder;
mod history;
pub mod manager;
mod retrieval_policy;
mod token_counter;
pub mod types;

pub use cache::ConversationLocks;
pub use citations::{check_citations, strip_out_of_range, CitationMode, CitationReport};
pub use context_builder::{ContextBuilder, FormattedContext};
pub use history::TokenBudgetedHistory;
pub use manager::{ConversationOrchestrator, OrchestratorDeps};
pub use retrieval_policy::{
    AlwaysRetrieve, HeuristicRetrievalPolicy, RetrievalPolicy, RetrievalPolicyKind,
};
pub use token_counter::{HeuristicTokenizer, Tokenizer, WordTokenizer};
pub use types::{OrchestratorConfig, TurnOutcome};
