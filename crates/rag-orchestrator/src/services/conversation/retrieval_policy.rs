//! Per-turn decision whether to run retrieval at all.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

use crate::models::{Message, Role};

/// Pure function from (turn, history) to "retrieve or not".
///
/// A false negative only costs answer quality; a false positive only costs
/// latency. Neither affects the turn's control flow.
pub trait RetrievalPolicy: Send + Sync {
    fn should_retrieve(&self, turn_text: &str, history: Option<&[Message]>) -> bool;
}

/// Retrieve on every turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetrieve;

impl RetrievalPolicy for AlwaysRetrieve {
    fn should_retrieve(&self, _turn_text: &str, _history: Option<&[Message]>) -> bool {
        true
    }
}

/// Skips small talk and follow-ups that only ask to rephrase the previous answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicRetrievalPolicy;

const SMALL_TALK: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank you", "thx", "ok", "okay", "bye", "good morning",
    "привет", "здравствуйте", "спасибо", "благодарю", "ок", "хорошо", "понятно", "пока",
    "добрый день",
];

const FOLLOW_UP: &[&str] = &[
    "what do you mean",
    "explain that",
    "can you explain",
    "say it again",
    "rephrase",
    "shorter",
    "что ты имеешь в виду",
    "поясни",
    "объясни подробнее",
    "повтори",
    "короче",
];

fn canonical(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl RetrievalPolicy for HeuristicRetrievalPolicy {
    fn should_retrieve(&self, turn_text: &str, history: Option<&[Message]>) -> bool {
        let text = canonical(turn_text);
        if text.is_empty() {
            debug!("Empty turn, skipping retrieval");
            return false;
        }

        if SMALL_TALK.contains(&text.as_str()) {
            debug!("Small talk detected: '{}'", text);
            return false;
        }

        let answered_before = history
            .map(|h| h.iter().any(|m| m.role == Role::Assistant))
            .unwrap_or(false);
        if answered_before {
            if let Some(pattern) = FOLLOW_UP.iter().find(|p| text.starts_with(*p)) {
                debug!("Follow-up on previous answer: matched '{}'", pattern);
                return false;
            }
        }

        true
    }
}

/// Configured policy name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalPolicyKind {
    #[default]
    Always,
    Heuristic,
}

impl RetrievalPolicyKind {
    pub fn build(self) -> std::sync::Arc<dyn RetrievalPolicy> {
        match self {
            Self::Always => std::sync::Arc::new(AlwaysRetrieve),
            Self::Heuristic => std::sync::Arc::new(HeuristicRetrievalPolicy),
        }
    }
}

impl FromStr for RetrievalPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "heuristic" => Ok(Self::Heuristic),
            other => Err(format!("unknown retrieval policy '{}'", other)),
        }
    }
}
