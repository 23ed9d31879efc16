use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use rag_orchestrator::config::{LoggingConfig, Settings, StorageConfig};
use rag_orchestrator::database::{ChatRepository, FeedbackRepository, KvStore, MemoryKvStore};
use rag_orchestrator::handlers;
use rag_orchestrator::logging::{ActivityLogger, LoggerConfig, TracingSink};
use rag_orchestrator::models::SamplingParams;
use rag_orchestrator::services::conversation::{
    ContextBuilder, ConversationOrchestrator, HeuristicTokenizer, OrchestratorConfig,
    OrchestratorDeps,
};
use rag_orchestrator::services::embedding_service::{EmbeddingProvider, EmbeddingService};
use rag_orchestrator::services::generation::{
    DispatcherSummarizer, GenerationDispatcher, OpenAiChatBackend,
};
use rag_orchestrator::services::retrieval::{
    FusionParams, HashingSparseEncoder, HttpReranker, HybridRetriever, InMemoryVectorIndex,
    QdrantStore, SparseEncoder, VectorStore,
};
use rag_orchestrator::services::stats::{StatsKind, UsageStatsAggregator};
use rag_orchestrator::state::AppState;
use rag_orchestrator::utils::text::{LowercaseNormalizer, TextNormalizer};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    let _log_guard = init_tracing(&settings.logging);

    info!("🚀 Starting retrieval orchestrator...");
    info!("✅ Configuration loaded");

    let store = build_store(&settings.storage).await?;
    info!("✅ Key-value store ready ({})", settings.storage.backend);

    let normalizer: Arc<dyn TextNormalizer> = Arc::new(LowercaseNormalizer);
    let retriever = Arc::new(build_retriever(&settings, normalizer.clone()).await?);
    info!("✅ Hybrid retriever ready ({})", settings.vector_db.backend);

    let backend = Arc::new(OpenAiChatBackend::new(settings.llm.clone())?);
    let dispatcher = Arc::new(GenerationDispatcher::new(backend, &settings.dispatcher));
    if let Err(e) = dispatcher.start().await {
        // Retried on the first request.
        warn!("Generation backend not started yet: {}", e);
    }

    let theme_timeout = Duration::from_millis(settings.conversation.theme_timeout_ms);
    let summarizer = Arc::new(
        DispatcherSummarizer::new(dispatcher.clone(), settings.prompts.theme_prompt.clone())
            .with_timeout(theme_timeout),
    );

    let activity = settings.logging.activity_enabled.then(|| {
        ActivityLogger::new(
            Arc::new(TracingSink),
            LoggerConfig {
                queue_capacity: settings.logging.activity_queue_capacity,
                batch_size: settings.logging.activity_batch_size,
                batch_timeout_ms: settings.logging.activity_batch_timeout_ms,
                worker_count: 1,
            },
        )
    });

    let prefix = settings.storage.key_prefix.clone();
    let sample_size = settings.conversation.stats_sample_size;
    let deps = OrchestratorDeps {
        repository: ChatRepository::new(store.clone(), prefix.clone(), settings.storage.history_ttl()),
        retriever,
        policy: settings.retrieval.policy.build(),
        dispatcher: dispatcher.clone(),
        summarizer,
        tokenizer: Arc::new(HeuristicTokenizer::default()),
        normalizer,
        questions: UsageStatsAggregator::new(store.clone(), prefix.clone(), StatsKind::Questions, sample_size),
        themes: UsageStatsAggregator::new(store.clone(), prefix, StatsKind::Themes, sample_size),
        context: ContextBuilder::new(
            settings.prompts.system_prompt.clone(),
            settings.prompts.context_header.clone(),
            settings.retrieval.max_context_tokens,
        ),
        activity,
    };
    let config = OrchestratorConfig {
        history_budget_tokens: settings.conversation.history_budget_tokens,
        citation_mode: settings.conversation.citation_mode,
        sampling: SamplingParams::default(),
        generation_timeout: None,
        theme_enabled: settings.conversation.theme_enabled,
        theme_timeout,
        ..Default::default()
    };
    let orchestrator = Arc::new(ConversationOrchestrator::new(deps, config));

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    let feedback = FeedbackRepository::new(store.clone(), settings.storage.key_prefix.clone());
    let state = AppState {
        orchestrator,
        store,
        feedback,
        settings: Arc::new(settings),
    };

    let app = handlers::router(state)
        .layer(CatchPanicLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()));

    info!("🎯 Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Draining generation dispatcher...");
    dispatcher.close().await?;
    info!("👋 Shutdown complete");
    Ok(())
}

fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let stdout = if config.json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let (file, guard) = match &config.file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rag-orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .init();
    guard
}

async fn build_store(config: &StorageConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend.as_str() {
        #[cfg(feature = "redis-store")]
        "redis" => Ok(Arc::new(
            rag_orchestrator::database::RedisKvStore::connect(&config.redis_url).await?,
        )),
        #[cfg(not(feature = "redis-store"))]
        "redis" => anyhow::bail!("storage.backend = redis needs the `redis-store` feature"),
        _ => Ok(Arc::new(MemoryKvStore::new())),
    }
}

async fn build_retriever(
    settings: &Settings,
    normalizer: Arc<dyn TextNormalizer>,
) -> Result<HybridRetriever> {
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(EmbeddingService::new(&settings.embedding)?);
    let encoder: Arc<dyn SparseEncoder> = Arc::new(HashingSparseEncoder::new(normalizer));
    let retrieval = &settings.retrieval;
    let params = FusionParams {
        weight_dense: retrieval.weight_dense,
        weight_sparse: retrieval.weight_sparse,
        rrf_k: NonZeroU32::new(retrieval.rrf_k).context("retrieval.rrf_k must be positive")?,
        top_k: retrieval.top_k,
    };

    let retriever = match settings.vector_db.backend.as_str() {
        "qdrant" => {
            let store = Arc::new(QdrantStore::new(&settings.vector_db)?);
            if let Err(e) = store.ensure_collection(settings.embedding.dimension).await {
                warn!("Qdrant collection check failed, searches will degrade: {}", e);
            }
            HybridRetriever::with_store(embedder, encoder, store, params)
        }
        _ => {
            warn!("Using an empty in-memory vector index");
            HybridRetriever::with_store(embedder, encoder, Arc::new(InMemoryVectorIndex::new()), params)
        }
    };

    let retriever = retriever
        .with_candidate_limit(retrieval.candidate_limit)
        .with_timeout(Duration::from_millis(retrieval.timeout_ms));

    if !settings.reranker.enabled {
        return Ok(retriever);
    }
    let reranker = Arc::new(HttpReranker::new(&settings.reranker)?);
    info!("✅ Cross-encoder reranking enabled ({})", settings.reranker.base_url);
    Ok(retriever.with_reranker(reranker, settings.reranker.candidates))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
