use anyhow::Result;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::services::conversation::{CitationMode, RetrievalPolicyKind};
use crate::utils::error::RagError;

/// Service settings. Read from `config/settings.toml`, then overridden by
/// `APP__SECTION__KEY` environment variables.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub vector_db: VectorDbConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub dispatcher: DispatcherConfig,
    pub retrieval: RetrievalConfig,
    pub reranker: RerankerConfig,
    pub conversation: ConversationConfig,
    pub prompts: PromptsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory` or `redis`
    pub backend: String,
    pub redis_url: String,
    pub key_prefix: String,
    /// 0 disables expiry of history and themes
    pub history_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "chat".to_string(),
            history_ttl_secs: 86_400,
        }
    }
}

impl StorageConfig {
    pub fn history_ttl(&self) -> Option<Duration> {
        (self.history_ttl_secs > 0).then(|| Duration::from_secs(self.history_ttl_secs))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct VectorDbConfig {
    /// `memory` or `qdrant`
    pub backend: String,
    pub url: String,
    pub collection: String,
    pub dense_vector_name: String,
    pub sparse_vector_name: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for VectorDbConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            url: "http://127.0.0.1:6333".to_string(),
            collection: "documents".to_string(),
            dense_vector_name: "dense".to_string(),
            sparse_vector_name: "text-sparse".to_string(),
            api_key: None,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub endpoint: String,
    pub model: Option<String>,
    pub dimension: usize,
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            endpoint: "/embedding".to_string(),
            model: None,
            dimension: 384,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
    pub timeout_seconds: u64,
    /// Probe `/v1/models` when the dispatcher starts the backend.
    pub check_on_start: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            model: None,
            max_tokens: 512,
            temperature: 0.2,
            top_p: None,
            top_k: None,
            timeout_seconds: 120,
            check_on_start: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_concurrency: usize,
    /// Delay before a request competes for a slot, 0 to dispatch immediately.
    pub batch_window_ms: u64,
    pub request_timeout_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            batch_window_ms: 0,
            request_timeout_ms: 60_000,
            drain_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub policy: RetrievalPolicyKind,
    pub rrf_k: u32,
    pub weight_dense: f64,
    pub weight_sparse: f64,
    pub top_k: usize,
    /// Candidates requested from each modality before fusion.
    pub candidate_limit: usize,
    pub timeout_ms: u64,
    pub max_context_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            policy: RetrievalPolicyKind::Always,
            rrf_k: 60,
            weight_dense: 1.0,
            weight_sparse: 1.0,
            top_k: 5,
            candidate_limit: 200,
            timeout_ms: 3_000,
            max_context_tokens: 3_000,
        }
    }
}

/// Cross-encoder pass over the fused candidates.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RerankerConfig {
    pub enabled: bool,
    pub base_url: String,
    pub endpoint: String,
    /// Fused hits handed to the cross-encoder; the best `retrieval.top_k` are kept.
    pub candidates: usize,
    pub timeout_ms: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:8002".to_string(),
            endpoint: "/api/v1/rerank/".to_string(),
            candidates: 20,
            timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConversationConfig {
    pub history_budget_tokens: usize,
    pub citation_mode: CitationMode,
    pub stats_sample_size: usize,
    pub theme_enabled: bool,
    pub theme_timeout_ms: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            history_budget_tokens: 10_000,
            citation_mode: CitationMode::Report,
            stats_sample_size: 5,
            theme_enabled: true,
            theme_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PromptsConfig {
    pub system_prompt: String,
    pub context_header: String,
    pub theme_prompt: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            system_prompt: crate::services::conversation::ContextBuilder::default_system_prompt(),
            context_header: crate::services::conversation::ContextBuilder::default_context_header(),
            theme_prompt: "Name the topic of this conversation in at most five words. \
                           Reply with the topic only."
                .to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    /// Daily-rotated log files are written here when set.
    pub file_dir: Option<String>,
    pub activity_enabled: bool,
    pub activity_queue_capacity: usize,
    pub activity_batch_size: usize,
    pub activity_batch_timeout_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,rag_orchestrator=debug".to_string(),
            json: false,
            file_dir: None,
            activity_enabled: true,
            activity_queue_capacity: 10_000,
            activity_batch_size: 100,
            activity_batch_timeout_ms: 1_000,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from("config/settings")
    }

    /// Loads `path` (extension optional) layered with `APP__*` variables.
    pub fn load_from(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name(path).required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), RagError> {
        let invalid = |msg: &str| Err(RagError::InvalidConfig(msg.to_string()));

        if self.dispatcher.max_concurrency == 0 {
            return invalid("dispatcher.max_concurrency must be at least 1");
        }
        if self.dispatcher.request_timeout_ms == 0 {
            return invalid("dispatcher.request_timeout_ms must be positive");
        }
        if self.retrieval.rrf_k == 0 {
            return invalid("retrieval.rrf_k must be positive");
        }
        let weight_ok = |w: f64| w.is_finite() && w >= 0.0;
        if !weight_ok(self.retrieval.weight_dense) || !weight_ok(self.retrieval.weight_sparse) {
            return invalid("retrieval weights must be finite and non-negative");
        }
        if self.retrieval.top_k == 0 || self.retrieval.candidate_limit == 0 {
            return invalid("retrieval.top_k and retrieval.candidate_limit must be positive");
        }
        if self.reranker.enabled && self.reranker.candidates < self.retrieval.top_k {
            return invalid("reranker.candidates must be at least retrieval.top_k");
        }
        if self.conversation.history_budget_tokens == 0 {
            return invalid("conversation.history_budget_tokens must be positive");
        }
        if self.embedding.dimension == 0 {
            return invalid("embedding.dimension must be positive");
        }
        if !matches!(self.storage.backend.as_str(), "memory" | "redis") {
            return invalid("storage.backend must be `memory` or `redis`");
        }
        if !matches!(self.vector_db.backend.as_str(), "memory" | "qdrant") {
            return invalid("vector_db.backend must be `memory` or `qdrant`");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatcher.request_timeout_ms)
    }
}
