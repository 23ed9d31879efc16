use serde::Serialize;

/// Frequency counter for a normalized question or theme, with a few literal phrasings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageCounter {
    #[serde(rename = "normalized")]
    pub normalized_key: String,
    pub count: u64,
    pub examples: Vec<String>,
}
