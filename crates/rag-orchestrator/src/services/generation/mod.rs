pub mod backend;
pub mod dispatcher;
pub mod summarizer;

pub use backend::{GenerationBackend, OpenAiChatBackend};
pub use dispatcher::{DispatcherState, GenerationDispatcher};
pub use summarizer::{DispatcherSummarizer, Summarizer};
