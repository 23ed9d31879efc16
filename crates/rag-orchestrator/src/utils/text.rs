use std::collections::HashMap;
use unicode_segmentation::UnicodeSegmentation;

/// Reduces text to a canonical form so near-duplicate questions and themes
/// share one counter key.
pub trait TextNormalizer: Send + Sync {
    /// Canonical terms in order of appearance.
    fn terms(&self, text: &str) -> Vec<String>;

    fn normalize(&self, text: &str) -> String {
        self.terms(text).join(" ")
    }
}

/// Unicode word split, lowercase, punctuation dropped, naive English plural strip.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowercaseNormalizer;

impl LowercaseNormalizer {
    fn stem(word: String) -> String {
        let strip = word.len() > 3
            && word.is_ascii()
            && word.ends_with('s')
            && !word.ends_with("ss")
            && !word.ends_with("us");
        if strip {
            word[..word.len() - 1].to_string()
        } else {
            word
        }
    }
}

impl TextNormalizer for LowercaseNormalizer {
    fn terms(&self, text: &str) -> Vec<String> {
        text.unicode_words()
            .map(|w| Self::stem(w.to_lowercase()))
            .collect()
    }
}

/// Token-level F1 between an answer and a reference text (SQuAD-style).
pub fn token_f1(normalizer: &dyn TextNormalizer, answer: &str, reference: &str) -> f32 {
    let answer_terms = normalizer.terms(answer);
    let reference_terms = normalizer.terms(reference);
    if answer_terms.is_empty() || reference_terms.is_empty() {
        return if answer_terms.is_empty() && reference_terms.is_empty() {
            1.0
        } else {
            0.0
        };
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for t in &reference_terms {
        *counts.entry(t.as_str()).or_default() += 1;
    }
    let mut common = 0usize;
    for t in &answer_terms {
        if let Some(c) = counts.get_mut(t.as_str()) {
            if *c > 0 {
                *c -= 1;
                common += 1;
            }
        }
    }
    if common == 0 {
        return 0.0;
    }

    let precision = common as f32 / answer_terms.len() as f32;
    let recall = common as f32 / reference_terms.len() as f32;
    2.0 * precision * recall / (precision + recall)
}
