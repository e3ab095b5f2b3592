//! Dimension digests: the structured self-report a dimension leaves for later ones.
//!
//! The production agent is asked to end its reply with a JSON object carrying a
//! `dimensionDigest` key, ideally inside a fenced code block. Replies are free
//! text, so parsing is tolerant: a missing or broken digest yields `None`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Key that marks the digest object in an agent reply.
pub const DIGEST_MARKER: &str = "dimensionDigest";

/// Structured summary of one completed dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DimensionDigest {
    pub summary: String,
    pub candidate_count: usize,
    pub candidate_titles: Vec<String>,
    pub key_findings: Vec<String>,
    /// Suggestions for other dimensions, keyed by dimension id.
    pub cross_refs: BTreeMap<String, String>,
    pub gaps: Vec<String>,
    pub remaining_tasks: Vec<String>,
    /// Set on the digest of a dimension whose work did not finish; such a
    /// dimension is retried on resume.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

impl DimensionDigest {
    /// Minimal digest for an agent that submitted candidates but reported nothing.
    pub fn stub(label: &str, titles: Vec<String>) -> Self {
        Self {
            summary: format!(
                "{label}: {} candidate(s) submitted, no digest reported",
                titles.len()
            ),
            candidate_count: titles.len(),
            candidate_titles: titles,
            ..Default::default()
        }
    }

    /// Digest for a dimension whose production call failed, so later
    /// dimensions can see the gap.
    pub fn failure(dim_id: &str, label: &str, error: &str) -> Self {
        Self {
            summary: format!("{label}: production failed ({error})"),
            gaps: vec![format!("dimension {dim_id} was not analysed: {error}")],
            remaining_tasks: vec![format!("re-run {dim_id}")],
            failed: true,
            ..Default::default()
        }
    }

    /// Digest for a dimension whose heuristic candidates were persisted directly.
    pub fn heuristic(label: &str, titles: Vec<String>) -> Self {
        Self {
            summary: format!(
                "{label}: {} heuristic candidate(s) persisted without refinement",
                titles.len()
            ),
            candidate_count: titles.len(),
            candidate_titles: titles,
            ..Default::default()
        }
    }
}

/// Extract the trailing digest from a free-form agent reply.
///
/// Fenced blocks mentioning the marker are tried first (last block wins),
/// then a bare inline `{ "dimensionDigest": ... }` object.
pub fn parse_digest(reply: &str) -> Option<DimensionDigest> {
    fenced_blocks(reply)
        .into_iter()
        .rev()
        .filter(|block| block.contains(DIGEST_MARKER))
        .find_map(digest_from_json)
        .or_else(|| inline_object(reply).and_then(digest_from_json))
}

fn digest_from_json(text: &str) -> Option<DimensionDigest> {
    let value: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
    let inner = value.get(DIGEST_MARKER)?;
    serde_json::from_value(inner.clone()).ok()
}

/// A fenced block; capture 1 is the body after the info-string line.
static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[^\n]*\n(.*?)```").expect("fenced block pattern is valid")
});

/// Bodies of all ``` fenced blocks, without the info string.
fn fenced_blocks(text: &str) -> Vec<&str> {
    FENCED_BLOCK
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|body| body.as_str())
        .collect()
}

/// The smallest balanced `{...}` enclosing the last marker occurrence.
fn inline_object(text: &str) -> Option<&str> {
    let marker_at = text.rfind(DIGEST_MARKER)?;
    let mut search_end = marker_at;
    while let Some(start) = text[..search_end].rfind('{') {
        if let Some(end) = balanced_end(text, start) {
            if end > marker_at {
                return Some(&text[start..=end]);
            }
        }
        search_end = start;
    }
    None
}

/// Index of the `}` closing the `{` at `start`, honouring JSON strings.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_digest() {
        let reply = r#"I analysed naming conventions and submitted 2 candidates.

```json
{
  "dimensionDigest": {
    "summary": "Classes use a two-letter prefix",
    "candidateCount": 2,
    "keyFindings": ["XY prefix on 30 of 36 classes"],
    "crossRefs": {"architecture": "check module prefixes"},
    "gaps": []
  }
}
```
"#;
        let digest = parse_digest(reply).expect("digest");
        assert_eq!(digest.summary, "Classes use a two-letter prefix");
        assert_eq!(digest.candidate_count, 2);
        assert_eq!(digest.key_findings.len(), 1);
        assert_eq!(
            digest.cross_refs.get("architecture").map(String::as_str),
            Some("check module prefixes")
        );
        assert!(digest.remaining_tasks.is_empty());
    }

    #[test]
    fn last_fenced_digest_wins() {
        let reply = "```json\n{\"dimensionDigest\": {\"summary\": \"draft\"}}\n```\nrevised:\n```\n{\"dimensionDigest\": {\"summary\": \"final\"}}\n```";
        assert_eq!(parse_digest(reply).map(|d| d.summary), Some("final".into()));
    }

    #[test]
    fn falls_back_to_inline_object() {
        let reply = r#"Done. {"dimensionDigest": {"summary": "inline {braces} ok", "gaps": ["no tests"]}} thanks"#;
        let digest = parse_digest(reply).expect("digest");
        assert_eq!(digest.summary, "inline {braces} ok");
        assert_eq!(digest.gaps, vec!["no tests".to_string()]);
    }

    #[test]
    fn broken_fenced_block_uses_inline() {
        let reply = "```json\n{\"dimensionDigest\": {\"summary\": \n```\nlater {\"dimensionDigest\": {\"summary\": \"recovered\"}}";
        assert_eq!(
            parse_digest(reply).map(|d| d.summary),
            Some("recovered".into())
        );
    }

    #[test]
    fn absent_or_unparsable_is_none() {
        assert!(parse_digest("").is_none());
        assert!(parse_digest("no digest here").is_none());
        assert!(parse_digest("dimensionDigest: summary is good").is_none());
        assert!(parse_digest("```json\n{\"other\": 1}\n```").is_none());
        assert!(parse_digest("{\"dimensionDigest\": {\"summary\": 3}}").is_none());
    }

    #[test]
    fn synthetic_digests() {
        let stub = DimensionDigest::stub("Code standards", vec!["a".into(), "b".into()]);
        assert_eq!(stub.candidate_count, 2);
        assert!(stub.summary.contains("2 candidate"));

        let failed = DimensionDigest::failure("architecture", "Architecture", "timed out");
        assert!(!failed.gaps.is_empty());
        assert!(failed.gaps[0].contains("architecture"));
        assert_eq!(failed.candidate_count, 0);
        assert!(failed.failed);
        assert!(!stub.failed);
    }

    #[test]
    fn failure_flag_survives_json_and_is_omitted_when_clear() {
        let failed = DimensionDigest::failure("architecture", "Architecture", "timed out");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["failed"], true);
        let back: DimensionDigest = serde_json::from_value(json).unwrap();
        assert!(back.failed);

        let ok = DimensionDigest::heuristic("Architecture", vec![]);
        let json = serde_json::to_value(&ok).unwrap();
        assert!(json.get("failed").is_none());
    }

    #[test]
    fn fenced_blocks_skip_info_string_and_unclosed_fence() {
        let text = "intro\n```json\n{\"a\": 1}\n```\nmid\n```\nplain\n```\ntail ```rust\nnever closed";
        assert_eq!(fenced_blocks(text), vec!["{\"a\": 1}\n", "plain\n"]);
        assert!(fenced_blocks("no fences").is_empty());
    }
}
