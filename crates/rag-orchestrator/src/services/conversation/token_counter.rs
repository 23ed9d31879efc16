use unicode_segmentation::UnicodeSegmentation;

use crate::models::Message;

/// Counts prompt tokens for a piece of text.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;

    fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count(&m.content)).sum()
    }
}

impl<F> Tokenizer for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn count(&self, text: &str) -> usize {
        self(text)
    }
}

/// One token per Unicode word.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn count(&self, text: &str) -> usize {
        text.unicode_words().count()
    }
}

/// Word-count estimate for mixed-language chat content: ~1.3 tokens per
/// whitespace word plus a fixed per-message overhead for the chat template.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicTokenizer {
    pub tokens_per_word: f64,
    pub overhead: usize,
}

impl Default for HeuristicTokenizer {
    fn default() -> Self {
        Self {
            tokens_per_word: 1.3,
            overhead: 4,
        }
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let words = text.split_whitespace().count();
        (words as f64 * self.tokens_per_word).ceil() as usize + self.overhead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_tokenizer() {
        assert_eq!(WordTokenizer.count("Hello, world!"), 2);
        assert_eq!(WordTokenizer.count(""), 0);
    }

    #[test]
    fn test_heuristic_estimation() {
        // 7 words * 1.3 = 9.1 -> 10, plus overhead
        let text = "Ini adalah dokumen test yang berisi informasi";
        assert_eq!(HeuristicTokenizer::default().count(text), 14);
        assert_eq!(HeuristicTokenizer::default().count(""), 0);
    }

    #[test]
    fn test_closure_tokenizer() {
        let tok = |s: &str| s.len();
        let messages = vec![Message::user("abc"), Message::assistant("de")];
        assert_eq!(tok.count_messages(&messages), 5);
    }
}
