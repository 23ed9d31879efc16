use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::chat::{ConversationId, Message};

/// Sampling knobs forwarded to the backend. Unknown keys pass through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SamplingParams {
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Created per turn, discarded after the response.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub conversation_id: ConversationId,
    pub prompt_messages: Vec<Message>,
    pub sampling_params: SamplingParams,
    /// Falls back to the dispatcher's default deadline when `None`.
    pub timeout: Option<Duration>,
}

impl GenerationRequest {
    pub fn new(conversation_id: impl Into<ConversationId>, prompt_messages: Vec<Message>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            prompt_messages,
            sampling_params: SamplingParams::default(),
            timeout: None,
        }
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.sampling_params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
