//! End-to-end turns through the orchestrator with in-process collaborators.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use rag_orchestrator::config::{DispatcherConfig, Settings};
use rag_orchestrator::database::{ChatRepository, FeedbackRepository, KvStore, MemoryKvStore};
use rag_orchestrator::handlers;
use rag_orchestrator::logging::{ActivityLogger, ActivityType, LoggerConfig, MemorySink};
use rag_orchestrator::models::{Message, ScoredPoint, SamplingParams};
use rag_orchestrator::services::conversation::{
    AlwaysRetrieve, ContextBuilder, ConversationOrchestrator, OrchestratorConfig,
    OrchestratorDeps, Tokenizer, WordTokenizer,
};
use rag_orchestrator::services::embedding_service::EmbeddingProvider;
use rag_orchestrator::services::generation::{
    DispatcherSummarizer, GenerationBackend, GenerationDispatcher,
};
use rag_orchestrator::services::retrieval::hybrid::index_passages;
use rag_orchestrator::services::retrieval::{
    DenseRetriever, FusionParams, HashingSparseEncoder, HybridRetriever, InMemoryVectorIndex,
};
use rag_orchestrator::services::stats::{StatsKind, UsageStatsAggregator};
use rag_orchestrator::state::AppState;
use rag_orchestrator::utils::error::RagError;
use rag_orchestrator::utils::text::LowercaseNormalizer;

const THEME_PROMPT: &str = "Name the topic.";
const SYSTEM_PROMPT: &str = "Answer from the context.";

struct KeywordEmbedder;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(if text.contains("tax") { vec![1.0, 0.1] } else { vec![0.1, 1.0] })
    }
}

struct BrokenDense;

#[async_trait]
impl DenseRetriever for BrokenDense {
    async fn search_dense(&self, _: &[f32], _: usize) -> anyhow::Result<Vec<ScoredPoint>> {
        anyhow::bail!("vector database unreachable")
    }
}

/// Answers after `delay`, records prompts and the peak number of overlapping calls.
struct RecordingBackend {
    reply: String,
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl RecordingBackend {
    fn new(reply: &str, delay: Duration) -> Self {
        Self {
            reply: reply.to_string(),
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl GenerationBackend for RecordingBackend {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn generate(&self, messages: &[Message], _: &SamplingParams) -> anyhow::Result<String> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        if messages.first().map(|m| m.content.as_str()) == Some(THEME_PROMPT) {
            return Ok("Income tax".to_string());
        }
        self.prompts.lock().push(messages.to_vec());
        Ok(self.reply.clone())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Store whose every call fails, as when the key-value server is down.
struct DownStore;

#[async_trait]
impl KvStore for DownStore {
    async fn get(&self, _: &str) -> anyhow::Result<Option<Bytes>> {
        anyhow::bail!("connection refused")
    }
    async fn set(&self, _: &str, _: Bytes, _: Option<Duration>) -> anyhow::Result<()> {
        anyhow::bail!("connection refused")
    }
    async fn delete(&self, _: &str) -> anyhow::Result<bool> {
        anyhow::bail!("connection refused")
    }
    async fn zincr(&self, _: &str, _: &str, _: f64) -> anyhow::Result<f64> {
        anyhow::bail!("connection refused")
    }
    async fn ztop(&self, _: &str, _: usize) -> anyhow::Result<Vec<(String, f64)>> {
        anyhow::bail!("connection refused")
    }
    async fn sadd_bounded(&self, _: &str, _: &str, _: usize) -> anyhow::Result<bool> {
        anyhow::bail!("connection refused")
    }
    async fn smembers(&self, _: &str) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("connection refused")
    }
    async fn ping(&self) -> anyhow::Result<()> {
        anyhow::bail!("connection refused")
    }
}

struct Harness {
    store: Arc<dyn KvStore>,
    backend: Arc<RecordingBackend>,
    dense_broken: bool,
    dispatcher: DispatcherConfig,
    config: OrchestratorConfig,
    activity: Option<ActivityLogger>,
}

impl Harness {
    fn new(backend: RecordingBackend) -> Self {
        Self {
            store: Arc::new(MemoryKvStore::new()),
            backend: Arc::new(backend),
            dense_broken: false,
            dispatcher: DispatcherConfig::default(),
            config: OrchestratorConfig::default(),
            activity: None,
        }
    }

    async fn build(&self) -> Arc<ConversationOrchestrator> {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(KeywordEmbedder);
        let encoder = Arc::new(HashingSparseEncoder::default());
        let index = Arc::new(InMemoryVectorIndex::new());
        let passages = vec![
            ("tax", json!({ "content": "income tax rate is 13%", "chunk_url": "https://docs/tax#rate" })),
            ("hours", json!({ "content": "office opening hours are 9 to 18", "common_url": "https://docs/office" })),
        ]
        .into_iter()
        .map(|(id, p)| (id.to_string(), p.as_object().cloned().unwrap()))
        .collect();
        index_passages(embedder.as_ref(), encoder.as_ref(), index.as_ref(), passages)
            .await
            .unwrap();

        let dense: Arc<dyn DenseRetriever> = if self.dense_broken {
            Arc::new(BrokenDense)
        } else {
            index.clone()
        };
        let retriever = HybridRetriever::new(embedder, encoder, dense, index, FusionParams::default());

        let dispatcher = Arc::new(GenerationDispatcher::new(self.backend.clone(), &self.dispatcher));
        let deps = OrchestratorDeps {
            repository: ChatRepository::new(self.store.clone(), "chat", None),
            retriever: Arc::new(retriever),
            policy: Arc::new(AlwaysRetrieve),
            summarizer: Arc::new(DispatcherSummarizer::new(dispatcher.clone(), THEME_PROMPT)),
            dispatcher,
            tokenizer: Arc::new(WordTokenizer),
            normalizer: Arc::new(LowercaseNormalizer),
            questions: UsageStatsAggregator::new(self.store.clone(), "chat", StatsKind::Questions, 5),
            themes: UsageStatsAggregator::new(self.store.clone(), "chat", StatsKind::Themes, 5),
            context: ContextBuilder::new(SYSTEM_PROMPT, "Context:", 500),
            activity: self.activity.clone(),
        };
        Arc::new(ConversationOrchestrator::new(deps, self.config.clone()))
    }
}

#[tokio::test]
async fn test_concurrent_conversations_respect_generation_limit() {
    let mut harness = Harness::new(RecordingBackend::new("13% [1].", Duration::from_millis(30)));
    harness.dispatcher.max_concurrency = 2;
    harness.config.theme_enabled = false;
    let orchestrator = harness.build().await;

    let turns = (0..6).map(|i| {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .handle_turn(&format!("user-{}", i), "income tax rate?", None)
                .await
        })
    });
    for turn in futures::future::join_all(turns).await {
        assert_eq!(turn.unwrap().unwrap().answer, "13% [1].");
    }

    assert_eq!(harness.backend.peak.load(Ordering::SeqCst), 2);
    let questions = orchestrator.top_questions(5).await.unwrap();
    assert_eq!(questions[0].count, 6);
    assert_eq!(questions[0].normalized_key, "income tax rate");
}

#[tokio::test]
async fn test_same_conversation_turns_do_not_lose_updates() {
    let mut harness = Harness::new(RecordingBackend::new("ok", Duration::from_millis(20)));
    harness.config.theme_enabled = false;
    let orchestrator = harness.build().await;

    let a = {
        let o = orchestrator.clone();
        tokio::spawn(async move { o.handle_turn("shared", "income tax?", None).await })
    };
    let b = {
        let o = orchestrator.clone();
        tokio::spawn(async move { o.handle_turn("shared", "office hours?", None).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let history = orchestrator.history("shared").await.unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history.iter().filter(|m| m.is_system()).count(), 1);
}

#[tokio::test]
async fn test_prompt_stays_within_history_budget() {
    let mut harness = Harness::new(RecordingBackend::new("a short answer here", Duration::ZERO));
    harness.config.history_budget_tokens = 40;
    harness.config.theme_enabled = false;
    let orchestrator = harness.build().await;

    for i in 0..10 {
        orchestrator
            .handle_turn("long", &format!("question number {} about income tax", i), None)
            .await
            .unwrap();
    }

    let prompts = harness.backend.prompts.lock().clone();
    let last = prompts.last().unwrap();
    let tokenizer = WordTokenizer;
    let non_context: Vec<Message> = last
        .iter()
        .filter(|m| !m.content.starts_with("Context:"))
        .cloned()
        .collect();
    assert!(tokenizer.count_messages(&non_context) <= 40 + tokenizer.count(SYSTEM_PROMPT));
    assert_eq!(last[0].content, SYSTEM_PROMPT);
    assert!(last.iter().any(|m| m.content.contains("question number 9")));
    assert!(!last.iter().any(|m| m.content.contains("question number 0 ")));
    // Stored history keeps every turn.
    assert_eq!(orchestrator.history("long").await.unwrap().len(), 21);
}

#[tokio::test]
async fn test_degraded_dense_search_still_answers() {
    let sink = Arc::new(MemorySink::new());
    let mut harness = Harness::new(RecordingBackend::new("13% [1].", Duration::ZERO));
    harness.dense_broken = true;
    harness.activity = Some(ActivityLogger::new(
        sink.clone(),
        LoggerConfig {
            batch_size: 1,
            batch_timeout_ms: 10,
            ..Default::default()
        },
    ));
    let orchestrator = harness.build().await;

    let outcome = orchestrator.handle_turn("c1", "income tax rate", None).await.unwrap();

    assert!(outcome.retrieval_degraded);
    assert_eq!(outcome.links, vec!["https://docs/tax#rate".to_string()]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let kinds: Vec<ActivityType> = sink.entries().iter().map(|e| e.activity_type).collect();
    assert!(kinds.contains(&ActivityType::RetrievalDegraded));
    assert!(kinds.contains(&ActivityType::TurnCompleted));
}

#[tokio::test]
async fn test_store_outage_does_not_fail_turn() {
    let mut harness = Harness::new(RecordingBackend::new("13%", Duration::ZERO));
    harness.store = Arc::new(DownStore);
    let orchestrator = harness.build().await;

    let outcome = orchestrator.handle_turn("c1", "income tax?", None).await.unwrap();

    assert_eq!(outcome.answer, "13%");
    assert!(outcome.theme.is_none());
    assert!(matches!(
        orchestrator.history("c1").await,
        Err(RagError::PersistenceUnavailable(_))
    ));
}

#[tokio::test]
async fn test_generation_timeout_surfaces() {
    let mut harness = Harness::new(RecordingBackend::new("late", Duration::from_secs(5)));
    harness.dispatcher.request_timeout_ms = 50;
    let orchestrator = harness.build().await;

    let err = orchestrator.handle_turn("c1", "income tax?", None).await.unwrap_err();

    assert!(matches!(err, RagError::GenerationTimeout { .. }));
    assert!(orchestrator.history("c1").await.unwrap().is_empty());
}

async fn call(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_http_query_and_stats() {
    let harness = Harness::new(RecordingBackend::new("13% [1].", Duration::ZERO));
    let orchestrator = harness.build().await;
    let app = handlers::router(AppState {
        orchestrator,
        store: harness.store.clone(),
        feedback: FeedbackRepository::new(harness.store.clone(), "chat"),
        settings: Arc::new(Settings::default()),
    });

    let (status, body) = call(
        app.clone(),
        Request::post("/api/v1/query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"user_id":"u1","query":"income tax rate?"}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], "u1");
    assert_eq!(body["response"][0], "13% [1].");
    assert_eq!(body["response"][1][0], "https://docs/tax#rate");
    assert_eq!(body["theme"], "Income tax");

    let (status, body) = call(
        app.clone(),
        Request::get("/api/v1/common_questions?limit=3").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 3);
    assert_eq!(body["results"][0]["normalized"], "income tax rate");
    assert_eq!(body["results"][0]["count"], 1);

    let (status, _) = call(
        app.clone(),
        Request::get("/api/v1/common_themes?limit=500").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        app.clone(),
        Request::get("/api/v1/session/u1").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["history"].as_array().unwrap().len(), 3);

    let (status, body) = call(
        app.clone(),
        Request::post("/api/v1/session/clear/u1").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], true);

    let (status, _) = call(app, Request::get("/api/v1/session/u1").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_http_readiness_reflects_store() {
    let mut harness = Harness::new(RecordingBackend::new("ok", Duration::ZERO));
    harness.store = Arc::new(DownStore);
    let orchestrator = harness.build().await;
    let app = handlers::router(AppState {
        orchestrator,
        store: harness.store.clone(),
        feedback: FeedbackRepository::new(harness.store.clone(), "chat"),
        settings: Arc::new(Settings::default()),
    });

    let (status, _) = call(app.clone(), Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(app, Request::get("/health/ready").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_http_rating_and_feedback() {
    let harness = Harness::new(RecordingBackend::new("ok", Duration::ZERO));
    let orchestrator = harness.build().await;
    let app = handlers::router(AppState {
        orchestrator,
        store: harness.store.clone(),
        feedback: FeedbackRepository::new(harness.store.clone(), "chat"),
        settings: Arc::new(Settings::default()),
    });

    let (status, body) = call(
        app.clone(),
        Request::get("/api/v1/rating/average/s1").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "session": "s1", "count": 0, "average": null }));

    for bad in [0, 6, -1] {
        let (status, body) = call(
            app.clone(),
            post_json("/api/v1/rating", json!({ "request_id": "r0", "history_session": "s1", "rating": bad })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{bad}");
        assert_eq!(body["message"], "rating must be 1..5");
    }

    for (rating, comment) in [(5, Some("spot on")), (2, None)] {
        let (status, body) = call(
            app.clone(),
            post_json(
                "/api/v1/rating",
                json!({ "request_id": "r1", "history_session": "s1", "rating": rating, "comment": comment }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));
    }

    let (_, body) = call(
        app.clone(),
        Request::get("/api/v1/rating/average/s1").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(body["count"], 2);
    assert_eq!(body["average"], 3.5);

    let (status, _) = call(
        app.clone(),
        post_json("/api/v1/feedback", json!({ "request_id": "r2", "history_session": "s1", "feedback": "cite more" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        app.clone(),
        post_json("/api/v1/feedback", json!({ "request_id": "r3", "history_session": "s1", "feedback": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(app, Request::get("/api/v1/feedback/s1").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e["comment"] == "spot on" && e["request_id"] == "r1"));
    assert!(entries.iter().any(|e| e["feedback"] == "cite more" && e["request_id"] == "r2"));
}
