use serde::Serialize;
use std::time::Duration;

use super::citations::{CitationMode, CitationReport};
use crate::models::SamplingParams;

/// Result of one handled turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub answer: String,
    /// Chunk-level link when known, otherwise document-level; nulls dropped.
    pub links: Vec<String>,
    /// Set only on the turn that derived it.
    pub theme: Option<String>,
    /// `None` when citation checking is off.
    pub citations: Option<CitationReport>,
    /// Token F1 against the caller-supplied target answer.
    pub target_overlap: Option<f32>,
    pub retrieval_executed: bool,
    pub retrieval_degraded: bool,
}

/// Tunables of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub history_budget_tokens: usize,
    pub citation_mode: CitationMode,
    pub sampling: SamplingParams,
    /// Overrides the dispatcher's default deadline for answers.
    pub generation_timeout: Option<Duration>,
    pub theme_enabled: bool,
    pub theme_timeout: Duration,
    /// Non-system messages handed to the summarizer.
    pub theme_recent_messages: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_budget_tokens: 10_000,
            citation_mode: CitationMode::Report,
            sampling: SamplingParams::default(),
            generation_timeout: None,
            theme_enabled: true,
            theme_timeout: Duration::from_secs(10),
            theme_recent_messages: 6,
        }
    }
}
