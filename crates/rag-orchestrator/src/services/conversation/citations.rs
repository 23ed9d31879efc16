use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

static CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s?\[(\d+)\]").expect("citation pattern is valid"));

/// What to do about citation markers that point past the link list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationMode {
    /// No checking.
    Off,
    /// Flag out-of-range markers in the outcome and activity log.
    #[default]
    Report,
    /// Flag them and strip them from the answer.
    Repair,
}

impl FromStr for CitationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "report" => Ok(Self::Report),
            "repair" => Ok(Self::Repair),
            other => Err(format!("unknown citation mode '{}'", other)),
        }
    }
}

/// Markers found in an answer, checked against `[1, link_count]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CitationReport {
    /// Distinct marker indices in order of first appearance.
    pub markers: Vec<usize>,
    pub out_of_range: Vec<usize>,
    pub link_count: usize,
    pub repaired: bool,
}

impl CitationReport {
    pub fn is_valid(&self) -> bool {
        self.out_of_range.is_empty()
    }
}

pub fn check_citations(answer: &str, link_count: usize) -> CitationReport {
    let mut report = CitationReport {
        link_count,
        ..CitationReport::default()
    };

    for caps in CITATION_RE.captures_iter(answer) {
        // Digits too long for usize are out of range by definition.
        let index = caps[1].parse::<usize>().unwrap_or(usize::MAX);
        if report.markers.contains(&index) {
            continue;
        }
        report.markers.push(index);
        if index == 0 || index > link_count {
            report.out_of_range.push(index);
        }
    }

    if !report.is_valid() {
        warn!(
            "Answer cites {:?} but only {} links are available",
            report.out_of_range, link_count
        );
    }
    report
}

/// Removes markers outside `[1, link_count]` together with one leading space.
pub fn strip_out_of_range(answer: &str, link_count: usize) -> String {
    CITATION_RE
        .replace_all(answer, |caps: &regex::Captures| {
            let valid = caps[1]
                .parse::<usize>()
                .map(|i| i >= 1 && i <= link_count)
                .unwrap_or(false);
            if valid {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}
