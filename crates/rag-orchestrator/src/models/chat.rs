use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversation identifier (the caller's user / session id).
pub type ConversationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One entry of a conversation log.
///
/// `normalized_form` is derived (lemmatized / lowercased text used for clustering
/// near-duplicate questions) and is not part of the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    // Records written before timestamps were stored carry only role + content.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_form: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
            normalized_form: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_normalized(mut self, normalized: impl Into<String>) -> Self {
        self.normalized_form = Some(normalized.into());
        self
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

/// Wire shape sent to OpenAI-compatible chat endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let msg = Message::assistant("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert!(json.get("normalized_form").is_none());
    }

    #[test]
    fn test_legacy_record_without_timestamp() {
        let raw = r#"{"role":"user","content":"Привет!"}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Привет!");
        assert!(msg.normalized_form.is_none());
    }
}
