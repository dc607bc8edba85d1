//! Bracket task extraction from plain document text.
//!
//! # Responsibility
//! - Find single-line `[...]` spans and turn them into task candidates.
//! - Assign each candidate a stable id derived from its line and leading text.
//!
//! # Invariants
//! - Parsing is pure and deterministic for the same input text.
//! - Stable ids depend only on the 1-based line number and the first 50
//!   characters of the trimmed span text.
//! - Confidence is advisory; no span is rejected for scoring low.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

const STABLE_ID_PREFIX_CHARS: usize = 50;
const STABLE_ID_BYTES: usize = 8;

static BRACKET_SPAN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\[\]\r\n]+)\]").expect("valid bracket span regex"));

/// One bracket span that may become a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCandidate {
    pub text: String,
    /// 1-based.
    pub line_number: u32,
    /// Character offset of the opening bracket within the whole text.
    pub char_offset: usize,
    pub stable_id: String,
    pub confidence: f32,
}

/// Extracts candidates in document order.
///
/// A later span on the same line whose id collides with an earlier one is
/// dropped.
pub fn parse_candidates(text: &str) -> Vec<TaskCandidate> {
    let mut candidates = Vec::new();
    let mut seen_ids = HashSet::new();
    let mut line_start_chars = 0usize;

    for (index, line) in text.split('\n').enumerate() {
        let line_number = (index + 1) as u32;
        for captures in BRACKET_SPAN_RE.captures_iter(line) {
            let (Some(span), Some(inner)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let raw = inner.as_str();
            if raw.trim().is_empty() || raw.chars().count() == 1 {
                continue;
            }

            let task_text = raw.trim();
            let id = stable_id(line_number, task_text);
            if !seen_ids.insert(id.clone()) {
                continue;
            }

            let is_link_label = line[span.end()..].starts_with('(');
            candidates.push(TaskCandidate {
                text: task_text.to_string(),
                line_number,
                char_offset: line_start_chars + line[..span.start()].chars().count(),
                stable_id: id,
                confidence: confidence(task_text, is_link_label),
            });
        }
        line_start_chars += line.chars().count() + 1;
    }

    candidates
}

/// `hex(sha256("<line>:<first 50 chars>")[..8])`.
pub fn stable_id(line_number: u32, text: &str) -> String {
    let prefix: String = text.chars().take(STABLE_ID_PREFIX_CHARS).collect();
    let digest = Sha256::digest(format!("{line_number}:{prefix}").as_bytes());
    hex::encode(&digest[..STABLE_ID_BYTES])
}

/// Heuristic likelihood that `text` is a task rather than other bracket usage.
pub fn confidence(text: &str, is_link_label: bool) -> f32 {
    let length = text.chars().count();
    let mut score = 0.5_f32;
    if text.chars().next().is_some_and(char::is_alphabetic) {
        score += 0.15;
    }
    if text.split_whitespace().count() >= 2 {
        score += 0.1;
    }
    if (3..=120).contains(&length) {
        score += 0.05;
    }
    if is_link_label {
        score -= 0.3;
    }
    if !text.is_empty() && text.chars().all(|ch| ch.is_ascii_digit()) {
        score -= 0.25;
    }
    if length > 200 {
        score -= 0.1;
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::{confidence, parse_candidates, stable_id};

    #[test]
    fn extracts_spans_with_lines_and_char_offsets() {
        let text = "intro\nplease [call Alice] today\r\nnoté [email Bob]";
        let candidates = parse_candidates(text);
        assert_eq!(candidates.len(), 2);

        assert_eq!(candidates[0].text, "call Alice");
        assert_eq!(candidates[0].line_number, 2);
        assert_eq!(candidates[0].char_offset, 13);

        assert_eq!(candidates[1].text, "email Bob");
        assert_eq!(candidates[1].line_number, 3);
        assert_eq!(candidates[1].char_offset, 38);
    }

    #[test]
    fn checkbox_markers_and_blank_spans_are_excluded() {
        let candidates = parse_candidates("[x] [ ] [-] [   ] [ok]");
        let texts: Vec<_> = candidates.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["ok"]);
    }

    #[test]
    fn nested_brackets_only_match_the_innermost_span() {
        let candidates = parse_candidates("[outer [inner task] tail]");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].text, "inner task");
    }

    #[test]
    fn same_line_prefix_collision_keeps_first_span() {
        let shared = "a".repeat(50);
        let text = format!("[{shared}xyz] and [{shared}uvw]");
        let candidates = parse_candidates(&text);
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].text.ends_with("xyz"));
    }

    #[test]
    fn stable_id_depends_on_line_and_prefix_only() {
        let long = "x".repeat(60);
        let longer = format!("{long}-changed tail");
        assert_eq!(stable_id(3, &long), stable_id(3, &longer));
        assert_ne!(stable_id(3, "call Alice"), stable_id(4, "call Alice"));
        assert_eq!(stable_id(3, "call Alice").len(), 16);
    }

    #[test]
    fn confidence_penalizes_links_and_footnotes() {
        let plain = confidence("call Alice", false);
        assert!((plain - 0.8).abs() < 1e-5);
        assert!(confidence("docs", true) < confidence("docs", false));
        assert!((confidence("12", false) - 0.25).abs() < 1e-5);
        assert!(parse_candidates("see [docs](http://x)")[0].confidence < 0.5);
    }
}
