use crate::models::{Message, Role};

use super::token_counter::Tokenizer;

/// Ordered message log of one conversation, truncated to a token budget on demand.
///
/// `assemble` keeps every system message and then the most recent exchanges
/// that still fit. An exchange is an assistant reply together with the user
/// message it answers; a user message without a reply counts alone. Eviction
/// never splits an exchange, so the prompt never carries an answer without its
/// question. When the system messages alone exceed the budget the result is
/// just the system messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenBudgetedHistory {
    messages: Vec<Message>,
}

impl TokenBudgetedHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) -> &Message {
        self.push(Message::new(role, content))
    }

    pub fn push(&mut self, message: Message) -> &Message {
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    /// Removes the most recent message (used for per-turn transient entries).
    pub fn pop(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of assistant replies recorded so far.
    pub fn exchange_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count()
    }

    /// Last `n` non-system messages in chronological order.
    pub fn recent_dialogue(&self, n: usize) -> Vec<Message> {
        let mut recent: Vec<Message> = self
            .messages
            .iter()
            .rev()
            .filter(|m| !m.is_system())
            .take(n)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    pub fn assemble(&self, budget: usize, tokenizer: &dyn Tokenizer) -> Vec<Message> {
        let system_tokens: usize = self
            .messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| tokenizer.count(&m.content))
            .sum();

        let mut keep = vec![false; self.messages.len()];
        for (idx, msg) in self.messages.iter().enumerate() {
            keep[idx] = msg.is_system();
        }

        if system_tokens <= budget {
            let dialogue: Vec<usize> = (0..self.messages.len())
                .filter(|&i| !self.messages[i].is_system())
                .collect();

            let mut used = system_tokens;
            let mut cursor = dialogue.len();
            while cursor > 0 {
                let last = dialogue[cursor - 1];
                let unit_start = if self.messages[last].role == Role::Assistant
                    && cursor >= 2
                    && self.messages[dialogue[cursor - 2]].role == Role::User
                {
                    cursor - 2
                } else {
                    cursor - 1
                };

                let unit = &dialogue[unit_start..cursor];
                let cost: usize = unit
                    .iter()
                    .map(|&i| tokenizer.count(&self.messages[i].content))
                    .sum();
                if used + cost > budget {
                    break;
                }

                used += cost;
                for &i in unit {
                    keep[i] = true;
                }
                cursor = unit_start;
            }
        }

        self.messages
            .iter()
            .zip(keep)
            .filter_map(|(m, k)| k.then(|| m.clone()))
            .collect()
    }
}

impl From<Vec<Message>> for TokenBudgetedHistory {
    fn from(messages: Vec<Message>) -> Self {
        Self::from_messages(messages)
    }
}
