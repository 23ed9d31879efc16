use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::kv::KvStore;
use crate::models::Message;
use crate::utils::error::{RagError, RagResult};

/// Conversation history and theme persistence on top of a [`KvStore`].
#[derive(Clone)]
pub struct ChatRepository {
    store: Arc<dyn KvStore>,
    prefix: String,
    ttl: Option<Duration>,
}

impl ChatRepository {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn history_key(&self, conversation_id: &str) -> String {
        format!("{}:history:{}", self.prefix, conversation_id)
    }

    pub fn theme_key(&self, conversation_id: &str) -> String {
        format!("{}:theme:{}", self.prefix, conversation_id)
    }

    /// `Ok(None)` when nothing is stored. An unparseable value yields
    /// `MalformedPersistedState`; store failures yield `PersistenceUnavailable`.
    pub async fn load_history(&self, conversation_id: &str) -> RagResult<Option<Vec<Message>>> {
        let key = self.history_key(conversation_id);
        let Some(raw) = self.store.get(&key).await.map_err(RagError::persistence)? else {
            return Ok(None);
        };

        let messages: Vec<Message> =
            serde_json::from_slice(&raw).map_err(|e| RagError::MalformedPersistedState {
                key: key.clone(),
                reason: e.to_string(),
            })?;

        debug!("Loaded {} messages from {}", messages.len(), key);
        Ok(Some(messages))
    }

    pub async fn save_history(&self, conversation_id: &str, messages: &[Message]) -> RagResult<()> {
        let key = self.history_key(conversation_id);
        let raw = serde_json::to_vec(messages).map_err(RagError::persistence)?;
        self.store
            .set(&key, Bytes::from(raw), self.ttl)
            .await
            .map_err(RagError::persistence)
    }

    pub async fn load_theme(&self, conversation_id: &str) -> RagResult<Option<String>> {
        let key = self.theme_key(conversation_id);
        let raw = self.store.get(&key).await.map_err(RagError::persistence)?;
        raw.map(|b| {
            String::from_utf8(b.to_vec()).map_err(|e| RagError::MalformedPersistedState {
                key: key.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    pub async fn save_theme(&self, conversation_id: &str, theme: &str) -> RagResult<()> {
        self.store
            .set(
                &self.theme_key(conversation_id),
                Bytes::from(theme.to_string()),
                self.ttl,
            )
            .await
            .map_err(RagError::persistence)
    }

    /// Deletes history and theme. Returns whether anything was stored.
    pub async fn clear(&self, conversation_id: &str) -> RagResult<bool> {
        let history = self
            .store
            .delete(&self.history_key(conversation_id))
            .await
            .map_err(RagError::persistence)?;
        let theme = self
            .store
            .delete(&self.theme_key(conversation_id))
            .await
            .map_err(RagError::persistence)?;
        Ok(history || theme)
    }
}
