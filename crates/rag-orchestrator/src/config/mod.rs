pub mod settings;

pub use settings::{
    ConversationConfig, DispatcherConfig, EmbeddingConfig, LlmConfig, LoggingConfig, PromptsConfig,
    RerankerConfig, RetrievalConfig, ServerConfig, Settings, StorageConfig, VectorDbConfig,
};
