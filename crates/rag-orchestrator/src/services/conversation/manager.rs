use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::ConversationLocks;
use super::citations::{check_citations, strip_out_of_range, CitationMode};
use super::context_builder::ContextBuilder;
use super::history::TokenBudgetedHistory;
use super::retrieval_policy::RetrievalPolicy;
use super::token_counter::Tokenizer;
use super::types::{OrchestratorConfig, TurnOutcome};
use crate::database::ChatRepository;
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::logging::types::ActivityLogBuilder;
use crate::models::{GenerationRequest, Message, RetrievedDocument, UsageCounter};
use crate::services::generation::{GenerationDispatcher, Summarizer};
use crate::services::retrieval::HybridRetriever;
use crate::services::stats::UsageStatsAggregator;
use crate::utils::error::{RagError, RagResult};
use crate::utils::text::{token_f1, TextNormalizer};

/// Collaborators of the orchestrator, wired at startup.
pub struct OrchestratorDeps {
    pub repository: ChatRepository,
    pub retriever: Arc<HybridRetriever>,
    pub policy: Arc<dyn RetrievalPolicy>,
    pub dispatcher: Arc<GenerationDispatcher>,
    pub summarizer: Arc<dyn Summarizer>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub normalizer: Arc<dyn TextNormalizer>,
    pub questions: UsageStatsAggregator,
    pub themes: UsageStatsAggregator,
    pub context: ContextBuilder,
    pub activity: Option<ActivityLogger>,
}

/// Runs user turns end to end: history, retrieval, prompt assembly,
/// generation, persistence, citations, theme and usage counters.
///
/// Only generation failures abort a turn. Everything on the side
/// (counters, persistence, theme) is logged and skipped on failure.
pub struct ConversationOrchestrator {
    deps: OrchestratorDeps,
    config: OrchestratorConfig,
    locks: ConversationLocks,
}

/// History loaded for a turn and whether it may be written back.
struct LoadedHistory {
    history: TokenBudgetedHistory,
    persist: bool,
}

impl ConversationOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: OrchestratorConfig) -> Self {
        info!(
            "Initializing ConversationOrchestrator: budget={} tokens, citations={:?}, theme={}",
            config.history_budget_tokens, config.citation_mode, config.theme_enabled
        );
        Self {
            deps,
            config,
            locks: ConversationLocks::new(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<GenerationDispatcher> {
        &self.deps.dispatcher
    }

    pub fn repository(&self) -> &ChatRepository {
        &self.deps.repository
    }

    fn record(&self, entry: ActivityLogBuilder) {
        if let Some(logger) = &self.deps.activity {
            logger.log(entry.build());
        }
    }

    pub async fn handle_turn(
        &self,
        conversation_id: &str,
        user_text: &str,
        target: Option<&str>,
    ) -> RagResult<TurnOutcome> {
        let _writer = self.locks.acquire(conversation_id).await;
        let turn_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let activity = |kind| ActivityLog::builder(turn_id.clone(), conversation_id, kind);

        info!(conversation_id, turn_id = %turn_id, "Handling turn ({} chars)", user_text.len());
        self.record(activity(ActivityType::TurnReceived).status(ActivityStatus::Info).message(user_text));

        // 1. history
        let LoadedHistory { mut history, persist } = self.load_history(conversation_id, &activity).await;
        if history.is_empty() {
            history.push(Message::system(self.deps.context.system_prompt()));
        }

        // 2. user message + question counter
        let normalized = self.deps.normalizer.normalize(user_text);
        history.push(Message::user(user_text).with_normalized(normalized.clone()));
        if let Err(e) = self.deps.questions.increment(&normalized, user_text).await {
            warn!(conversation_id, "Question counter not updated: {}", e);
            self.record(activity(ActivityType::PersistenceFailed).error(e.to_string(), e.kind()));
        }

        // 3. retrieval
        let mut links = Vec::new();
        let mut transient_context = false;
        let mut retrieval_degraded = false;
        let retrieval_executed = self
            .deps
            .policy
            .should_retrieve(user_text, Some(history.messages()));

        if retrieval_executed {
            let retrieval_started = Instant::now();
            let outcome = self.deps.retriever.search(user_text).await;
            retrieval_degraded = outcome.is_degraded();
            for err in &outcome.degraded {
                self.record(
                    activity(ActivityType::RetrievalDegraded)
                        .status(ActivityStatus::Warning)
                        .error(err.to_string(), err.kind()),
                );
            }

            let documents: Vec<RetrievedDocument> = outcome
                .hits
                .iter()
                .filter_map(|hit| RetrievedDocument::from_payload(&hit.payload))
                .collect();
            let context = self.deps.context.format(&documents, self.deps.tokenizer.as_ref());
            if !context.is_empty() {
                history.push(Message::system(context.text));
                transient_context = true;
            }
            links = context.links;

            self.record(
                activity(ActivityType::RetrievalExecuted)
                    .link_count(links.len())
                    .retrieval_duration(retrieval_started.elapsed().as_millis() as u64)
                    .field("hits", outcome.hits.len())
                    .field("documents_used", context.documents_used),
            );
        } else {
            debug!(conversation_id, "Retrieval skipped by policy");
            self.record(activity(ActivityType::RetrievalSkipped).status(ActivityStatus::Info));
        }

        // 4. bounded prompt; the retrieval context never enters stored history
        let prompt = history.assemble(self.config.history_budget_tokens, self.deps.tokenizer.as_ref());
        if transient_context {
            history.pop();
        }
        let prompt_tokens = self.deps.tokenizer.count_messages(&prompt);
        debug!(
            conversation_id,
            prompt_messages = prompt.len(),
            prompt_tokens,
            "Prompt assembled"
        );

        // 5. generation (the only step that fails the turn)
        let mut request = GenerationRequest::new(conversation_id, prompt)
            .with_params(self.config.sampling.clone());
        request.timeout = self.config.generation_timeout;

        let llm_started = Instant::now();
        let mut answer = match self.deps.dispatcher.generate(request).await {
            Ok(answer) => answer,
            Err(e) => {
                self.record(
                    activity(ActivityType::GenerationFailed)
                        .error(e.to_string(), e.kind())
                        .llm_duration(llm_started.elapsed().as_millis() as u64),
                );
                return Err(e);
            }
        };
        let llm_ms = llm_started.elapsed().as_millis() as u64;

        // 7. citation gate (before persisting so a repaired answer is what gets stored)
        let citations = match self.config.citation_mode {
            CitationMode::Off => None,
            mode => {
                let mut report = check_citations(&answer, links.len());
                if !report.is_valid() {
                    if mode == CitationMode::Repair {
                        answer = strip_out_of_range(&answer, links.len());
                        report.repaired = true;
                    }
                    self.record(
                        activity(ActivityType::CitationOutOfRange)
                            .status(ActivityStatus::Warning)
                            .link_count(links.len())
                            .field("out_of_range", report.out_of_range.clone())
                            .field("repaired", report.repaired),
                    );
                }
                Some(report)
            }
        };

        // 6. persist
        history.push(Message::assistant(answer.clone()));
        if persist {
            if let Err(e) = self
                .deps
                .repository
                .save_history(conversation_id, history.messages())
                .await
            {
                warn!(conversation_id, "History not saved: {}", e);
                self.record(activity(ActivityType::PersistenceFailed).error(e.to_string(), e.kind()));
            }
        }

        let target_overlap = target.map(|t| token_f1(self.deps.normalizer.as_ref(), &answer, t));

        // 8. theme
        let theme = self.derive_theme(conversation_id, &history, &activity).await;

        let mut done = activity(ActivityType::TurnCompleted)
            .response(answer.clone())
            .token_count(prompt_tokens)
            .link_count(links.len())
            .llm_duration(llm_ms)
            .processing_time(started.elapsed().as_millis() as u64);
        if let Some(f1) = target_overlap {
            done = done.target_overlap(f1);
        }
        self.record(done);

        info!(
            conversation_id,
            turn_id = %turn_id,
            links = links.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Turn completed"
        );

        Ok(TurnOutcome {
            answer,
            links,
            theme,
            citations,
            target_overlap,
            retrieval_executed,
            retrieval_degraded,
        })
    }

    async fn load_history<F>(&self, conversation_id: &str, activity: &F) -> LoadedHistory
    where
        F: Fn(ActivityType) -> ActivityLogBuilder,
    {
        match self.deps.repository.load_history(conversation_id).await {
            Ok(Some(messages)) => LoadedHistory {
                history: TokenBudgetedHistory::from_messages(messages),
                persist: true,
            },
            Ok(None) => {
                debug!(conversation_id, "New conversation");
                self.record(activity(ActivityType::SessionCreated).status(ActivityStatus::Info));
                LoadedHistory {
                    history: TokenBudgetedHistory::new(),
                    persist: true,
                }
            }
            Err(e @ RagError::MalformedPersistedState { .. }) => {
                warn!(conversation_id, "Stored history unreadable, starting fresh: {}", e);
                self.record(
                    activity(ActivityType::HistoryRecovered)
                        .status(ActivityStatus::Warning)
                        .error(e.to_string(), e.kind()),
                );
                LoadedHistory {
                    history: TokenBudgetedHistory::new(),
                    persist: true,
                }
            }
            Err(e) => {
                // Keep answering, but never overwrite state we could not read.
                warn!(conversation_id, "History unavailable, turn will not be saved: {}", e);
                self.record(activity(ActivityType::PersistenceFailed).error(e.to_string(), e.kind()));
                LoadedHistory {
                    history: TokenBudgetedHistory::new(),
                    persist: false,
                }
            }
        }
    }

    /// Derives and stores a theme once the conversation has an exchange and
    /// none is recorded yet. Returns it only when derived now.
    async fn derive_theme<F>(
        &self,
        conversation_id: &str,
        history: &TokenBudgetedHistory,
        activity: &F,
    ) -> Option<String>
    where
        F: Fn(ActivityType) -> ActivityLogBuilder,
    {
        if !self.config.theme_enabled || history.exchange_count() == 0 {
            return None;
        }

        match self.deps.repository.load_theme(conversation_id).await {
            Ok(Some(_)) => return None,
            Ok(None) => {}
            Err(e) => {
                warn!(conversation_id, "Theme lookup failed, skipping: {}", e);
                return None;
            }
        }

        let recent = history.recent_dialogue(self.config.theme_recent_messages);
        let summary = tokio::time::timeout(
            self.config.theme_timeout,
            self.deps.summarizer.summarize(conversation_id, &recent),
        )
        .await;

        let theme = match summary {
            Ok(Ok(theme)) => theme,
            Ok(Err(e)) => {
                warn!(conversation_id, "Theme extraction failed: {}", e);
                return None;
            }
            Err(_) => {
                warn!(conversation_id, "Theme extraction timed out");
                return None;
            }
        };

        if let Err(e) = self.deps.repository.save_theme(conversation_id, &theme).await {
            warn!(conversation_id, "Theme not saved: {}", e);
            self.record(activity(ActivityType::PersistenceFailed).error(e.to_string(), e.kind()));
        }
        let normalized = self.deps.normalizer.normalize(&theme);
        if let Err(e) = self.deps.themes.increment(&normalized, &theme).await {
            warn!(conversation_id, "Theme counter not updated: {}", e);
        }

        self.record(activity(ActivityType::ThemeRecorded).response(theme.clone()));
        Some(theme)
    }

    /// Persisted history of a conversation (empty when none is stored).
    pub async fn history(&self, conversation_id: &str) -> RagResult<Vec<Message>> {
        Ok(self
            .deps
            .repository
            .load_history(conversation_id)
            .await?
            .unwrap_or_default())
    }

    pub async fn theme(&self, conversation_id: &str) -> RagResult<Option<String>> {
        self.deps.repository.load_theme(conversation_id).await
    }

    pub async fn top_questions(&self, n: usize) -> RagResult<Vec<UsageCounter>> {
        self.deps.questions.top_k(n).await
    }

    pub async fn top_themes(&self, n: usize) -> RagResult<Vec<UsageCounter>> {
        self.deps.themes.top_k(n).await
    }

    /// Forgets history and theme. Waits for an in-flight turn of the same id.
    pub async fn clear_conversation(&self, conversation_id: &str) -> RagResult<bool> {
        let _writer = self.locks.acquire(conversation_id).await;
        let cleared = self.deps.repository.clear(conversation_id).await?;
        info!(conversation_id, cleared, "Conversation cleared");
        Ok(cleared)
    }

    pub async fn clear_stats(&self) -> RagResult<()> {
        self.deps.questions.clear().await?;
        self.deps.themes.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::database::{KvStore, MemoryKvStore};
    use crate::models::{Role, SamplingParams};
    use crate::services::conversation::{
        AlwaysRetrieve, CitationMode, HeuristicRetrievalPolicy, WordTokenizer,
    };
    use crate::services::embedding_service::EmbeddingProvider;
    use crate::services::generation::{DispatcherSummarizer, GenerationBackend};
    use crate::services::retrieval::hybrid::index_passages;
    use crate::services::retrieval::{FusionParams, HashingSparseEncoder, InMemoryVectorIndex};
    use crate::services::stats::StatsKind;
    use crate::utils::text::LowercaseNormalizer;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use serde_json::json;

    const THEME_PROMPT: &str = "Name the topic.";

    struct KeywordEmbedder;

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(if text.contains("tax") { vec![1.0, 0.1] } else { vec![0.1, 1.0] })
        }
    }

    struct ScriptedBackend {
        reply: String,
        fail: bool,
        prompts: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedBackend {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                fail: false,
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self { fail: true, ..Self::new("") }
        }

        fn last_prompt(&self) -> Vec<Message> {
            self.prompts.lock().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn generate(&self, messages: &[Message], _: &SamplingParams) -> anyhow::Result<String> {
            if messages.first().map(|m| m.content.as_str()) == Some(THEME_PROMPT) {
                return Ok("\"Income tax.\"".to_string());
            }
            self.prompts.lock().push(messages.to_vec());
            if self.fail {
                anyhow::bail!("model crashed");
            }
            Ok(self.reply.clone())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        orchestrator: ConversationOrchestrator,
        backend: Arc<ScriptedBackend>,
        store: Arc<MemoryKvStore>,
    }

    async fn fixture(
        backend: ScriptedBackend,
        policy: Arc<dyn RetrievalPolicy>,
        config: OrchestratorConfig,
    ) -> Fixture {
        let store = Arc::new(MemoryKvStore::new());
        let kv: Arc<dyn KvStore> = store.clone();
        let backend = Arc::new(backend);

        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(KeywordEmbedder);
        let encoder = Arc::new(HashingSparseEncoder::default());
        let index = Arc::new(InMemoryVectorIndex::new());
        let passages = vec![
            ("1", json!({ "content": "income tax rate is 13%", "chunk_url": "https://docs/tax#rate" })),
            ("2", json!({ "content": "office opening hours", "meta": { "common_url": "https://docs/office" } })),
        ]
        .into_iter()
        .map(|(id, p)| (id.to_string(), p.as_object().cloned().unwrap()))
        .collect();
        index_passages(embedder.as_ref(), encoder.as_ref(), index.as_ref(), passages)
            .await
            .unwrap();

        let dispatcher = Arc::new(GenerationDispatcher::new(
            backend.clone(),
            &DispatcherConfig::default(),
        ));
        let deps = OrchestratorDeps {
            repository: ChatRepository::new(kv.clone(), "chat", None),
            retriever: Arc::new(HybridRetriever::with_store(
                embedder,
                encoder,
                index,
                FusionParams::default(),
            )),
            policy,
            summarizer: Arc::new(DispatcherSummarizer::new(dispatcher.clone(), THEME_PROMPT)),
            dispatcher,
            tokenizer: Arc::new(WordTokenizer),
            normalizer: Arc::new(LowercaseNormalizer),
            questions: UsageStatsAggregator::new(kv.clone(), "chat", StatsKind::Questions, 5),
            themes: UsageStatsAggregator::new(kv, "chat", StatsKind::Themes, 5),
            context: ContextBuilder::new("You are a helpful assistant.", "Context:", 500),
            activity: None,
        };

        Fixture {
            orchestrator: ConversationOrchestrator::new(deps, config),
            backend,
            store,
        }
    }

    #[tokio::test]
    async fn test_first_turn_answers_with_links_and_theme() {
        let f = fixture(
            ScriptedBackend::new("The rate is 13% [1]."),
            Arc::new(AlwaysRetrieve),
            OrchestratorConfig::default(),
        )
        .await;

        let outcome = f
            .orchestrator
            .handle_turn("c1", "What is the income tax rate?", None)
            .await
            .unwrap();

        assert_eq!(outcome.answer, "The rate is 13% [1].");
        assert!(outcome.retrieval_executed);
        assert!(!outcome.retrieval_degraded);
        assert_eq!(outcome.links[0], "https://docs/tax#rate");
        assert_eq!(outcome.theme.as_deref(), Some("Income tax"));
        assert!(outcome.citations.unwrap().is_valid());

        // The prompt carried the context, stored history does not.
        let prompt = f.backend.last_prompt();
        assert!(prompt.iter().any(|m| m.is_system() && m.content.contains("income tax rate is 13%")));

        let history = f.orchestrator.history("c1").await.unwrap();
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(history[0].content, "You are a helpful assistant.");
        assert_eq!(
            history[1].normalized_form.as_deref(),
            Some("what is the income tax rate")
        );

        assert_eq!(f.orchestrator.theme("c1").await.unwrap().as_deref(), Some("Income tax"));
        let questions = f.orchestrator.top_questions(10).await.unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].count, 1);
        assert_eq!(f.orchestrator.top_themes(10).await.unwrap()[0].normalized_key, "income tax");
    }

    #[tokio::test]
    async fn test_theme_derived_once() {
        let f = fixture(
            ScriptedBackend::new("13%."),
            Arc::new(AlwaysRetrieve),
            OrchestratorConfig::default(),
        )
        .await;

        let first = f.orchestrator.handle_turn("c1", "income tax?", None).await.unwrap();
        let second = f.orchestrator.handle_turn("c1", "and for residents?", None).await.unwrap();

        assert!(first.theme.is_some());
        assert!(second.theme.is_none());
        assert_eq!(f.orchestrator.history("c1").await.unwrap().len(), 5);
        assert_eq!(f.orchestrator.top_themes(10).await.unwrap()[0].count, 1);
    }

    #[tokio::test]
    async fn test_generation_failure_fails_turn_without_saving() {
        let f = fixture(
            ScriptedBackend::failing(),
            Arc::new(AlwaysRetrieve),
            OrchestratorConfig::default(),
        )
        .await;

        let err = f.orchestrator.handle_turn("c1", "income tax?", None).await.unwrap_err();

        assert!(matches!(err, RagError::GenerationBackend(_)));
        assert!(f.orchestrator.history("c1").await.unwrap().is_empty());
        assert!(f.orchestrator.theme("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repair_mode_strips_unknown_markers() {
        let config = OrchestratorConfig {
            citation_mode: CitationMode::Repair,
            ..Default::default()
        };
        let f = fixture(ScriptedBackend::new("See [1] and [9]."), Arc::new(AlwaysRetrieve), config).await;

        let outcome = f.orchestrator.handle_turn("c1", "income tax?", None).await.unwrap();

        assert_eq!(outcome.answer, "See [1] and.");
        let report = outcome.citations.unwrap();
        assert_eq!(report.out_of_range, vec![9]);
        assert!(report.repaired);
        let history = f.orchestrator.history("c1").await.unwrap();
        assert_eq!(history.last().unwrap().content, "See [1] and.");
    }

    #[tokio::test]
    async fn test_citation_off_skips_report() {
        let config = OrchestratorConfig {
            citation_mode: CitationMode::Off,
            ..Default::default()
        };
        let f = fixture(ScriptedBackend::new("See [9]."), Arc::new(AlwaysRetrieve), config).await;

        let outcome = f.orchestrator.handle_turn("c1", "income tax?", None).await.unwrap();

        assert_eq!(outcome.answer, "See [9].");
        assert!(outcome.citations.is_none());
    }

    #[tokio::test]
    async fn test_policy_skip_sends_no_context() {
        let f = fixture(
            ScriptedBackend::new("Hello!"),
            Arc::new(HeuristicRetrievalPolicy),
            OrchestratorConfig::default(),
        )
        .await;

        let outcome = f.orchestrator.handle_turn("c1", "hello", None).await.unwrap();

        assert!(!outcome.retrieval_executed);
        assert!(outcome.links.is_empty());
        let prompt = f.backend.last_prompt();
        assert_eq!(prompt.iter().filter(|m| m.is_system()).count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_history_starts_fresh() {
        let f = fixture(
            ScriptedBackend::new("13%."),
            Arc::new(AlwaysRetrieve),
            OrchestratorConfig::default(),
        )
        .await;
        let key = f.orchestrator.repository().history_key("c1");
        f.store.set(&key, Bytes::from_static(b"{not json"), None).await.unwrap();

        let outcome = f.orchestrator.handle_turn("c1", "income tax?", None).await;

        assert!(outcome.is_ok());
        assert_eq!(f.orchestrator.history("c1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_target_overlap_reported() {
        let f = fixture(
            ScriptedBackend::new("the rate is 13"),
            Arc::new(AlwaysRetrieve),
            OrchestratorConfig::default(),
        )
        .await;

        let outcome = f
            .orchestrator
            .handle_turn("c1", "income tax?", Some("the rate is 13"))
            .await
            .unwrap();

        assert!((outcome.target_overlap.unwrap() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_clear_conversation() {
        let f = fixture(
            ScriptedBackend::new("13%."),
            Arc::new(AlwaysRetrieve),
            OrchestratorConfig::default(),
        )
        .await;
        f.orchestrator.handle_turn("c1", "income tax?", None).await.unwrap();

        assert!(f.orchestrator.clear_conversation("c1").await.unwrap());
        assert!(f.orchestrator.history("c1").await.unwrap().is_empty());
        assert!(f.orchestrator.theme("c1").await.unwrap().is_none());
        assert!(!f.orchestrator.clear_conversation("c1").await.unwrap());
    }
}
