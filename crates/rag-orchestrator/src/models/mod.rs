pub mod chat;
pub mod feedback;
pub mod generation;
pub mod search;
pub mod stats;

pub use chat::{ChatMessage, ConversationId, Message, Role};
pub use feedback::{FeedbackEntry, RatingSummary};
pub use generation::{GenerationRequest, SamplingParams};
pub use search::{Modality, RetrievedDocument, ScoredPoint, SearchHit, SparseVector};
pub use stats::UsageCounter;
