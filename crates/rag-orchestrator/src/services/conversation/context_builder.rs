use tracing::debug;

use super::token_counter::Tokenizer;
use crate::models::RetrievedDocument;

/// Retrieved context rendered for the prompt, plus the links it cites.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormattedContext {
    pub text: String,
    /// `[n]` in `text` refers to `links[n - 1]`.
    pub links: Vec<String>,
    pub documents_used: usize,
}

impl FormattedContext {
    pub fn is_empty(&self) -> bool {
        self.documents_used == 0
    }
}

pub struct ContextBuilder {
    system_prompt: String,
    context_header: String,
    max_context_tokens: usize,
}

impl ContextBuilder {
    pub fn new(system_prompt: impl Into<String>, context_header: impl Into<String>, max_context_tokens: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            context_header: context_header.into(),
            max_context_tokens,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn default_system_prompt() -> String {
        r#"You are a precise assistant that answers strictly from the provided context.
Cite the sources you use with their bracketed number, for example [1].
If the context does not contain the answer, say that you cannot help with this question but are ready to answer others."#
            .to_string()
    }

    pub fn default_context_header() -> String {
        "Context:".to_string()
    }

    /// Numbers documents by the position of their link in the returned list.
    /// Documents sharing a link share a number; documents without a link are
    /// listed unnumbered. Stops before the first document that would push the
    /// text past the token cap.
    pub fn format(&self, documents: &[RetrievedDocument], tokenizer: &dyn Tokenizer) -> FormattedContext {
        let mut out = FormattedContext {
            text: self.context_header.clone(),
            ..FormattedContext::default()
        };
        let mut used = tokenizer.count(&out.text);

        for doc in documents {
            let content = doc.content.trim();
            if content.is_empty() {
                continue;
            }

            let cost = tokenizer.count(content) + 1;
            if used + cost > self.max_context_tokens {
                debug!(
                    "Context cap reached after {} documents ({} tokens)",
                    out.documents_used, used
                );
                break;
            }

            let label = match doc.link() {
                Some(link) => {
                    let n = match out.links.iter().position(|l| l == link) {
                        Some(pos) => pos + 1,
                        None => {
                            out.links.push(link.to_string());
                            out.links.len()
                        }
                    };
                    format!("[{}]", n)
                }
                None => "-".to_string(),
            };

            out.text.push_str("\n\n");
            out.text.push_str(&label);
            out.text.push(' ');
            out.text.push_str(content);
            used += cost;
            out.documents_used += 1;
        }

        out
    }
}
