//! Signal extraction: raw scanner evidence → bounded briefs for the agent.
//!
//! A candidate carrying structured scan evidence becomes a distribution plus a
//! couple of code samples. Anything else degrades to loose textual metrics
//! pulled out of its summary. One bad candidate never costs the others their
//! signal.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use repolore_shared::{Dimension, RawCandidate, RepoloreError, Result, ScanResult};

/// Maximum files listed per signal.
pub const MAX_TOP_FILES: usize = 5;
/// Maximum code samples per signal.
pub const MAX_SAMPLES: usize = 2;
/// Minimum non-whitespace characters for a sample to be worth showing.
pub const MIN_SAMPLE_CHARS: usize = 6;
/// Maximum related-signal references per signal.
pub const MAX_RELATED: usize = 3;
/// Maximum search hints in degraded mode.
pub const MAX_SEARCH_HINTS: usize = 3;

const MAX_SAMPLE_CODE_CHARS: usize = 600;
const MAX_PROVENANCE_CHARS: usize = 80;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One variant's share of the matched files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionEntry {
    pub label: String,
    pub file_count: u64,
    /// Rounded percentage of the signal's match count.
    pub pct: u32,
    pub boilerplate: bool,
}

/// A short code excerpt backing a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub file: String,
    pub line: u32,
    pub code: String,
    pub variant: String,
}

/// Evidence carried by a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SignalEvidence {
    /// Built from structured scan evidence.
    Structured {
        match_count: u64,
        top_files: Vec<String>,
        distribution: Vec<DistributionEntry>,
        samples: Vec<Sample>,
    },
    /// Degraded: built from the candidate's sources and summary text.
    Textual {
        match_count: u64,
        top_files: Vec<String>,
        metrics: BTreeMap<String, f64>,
        search_hints: Vec<String>,
    },
}

impl SignalEvidence {
    pub fn match_count(&self) -> u64 {
        match self {
            Self::Structured { match_count, .. } | Self::Textual { match_count, .. } => {
                *match_count
            }
        }
    }

    pub fn top_files(&self) -> &[String] {
        match self {
            Self::Structured { top_files, .. } | Self::Textual { top_files, .. } => top_files,
        }
    }
}

/// Opaque candidate metadata passed through to the prompt builder untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMeta {
    pub knowledge_type: String,
    pub tags: Vec<String>,
    pub language: String,
    pub title: Option<String>,
}

/// Bounded evidence summary for one sub-topic of a dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub dim_id: String,
    pub sub_topic: String,
    pub evidence: SignalEvidence,
    pub heuristic_hints: Vec<String>,
    pub related_signals: Vec<String>,
    #[serde(rename = "_meta")]
    pub meta: SignalMeta,
}

/// Output of [`extract_signals`]: the signals plus the candidates they came
/// from, kept for heuristic fallback.
#[derive(Debug, Clone, Default)]
pub struct SignalExtraction {
    pub signals: Vec<Signal>,
    pub candidates: Vec<RawCandidate>,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Convert a dimension's raw candidates into signals.
///
/// Never fails as a whole: a candidate that cannot be converted is logged
/// and skipped.
pub fn extract_signals(dimension: &Dimension, candidates: Vec<RawCandidate>) -> SignalExtraction {
    let mut signals = Vec::with_capacity(candidates.len());

    for (index, candidate) in candidates.iter().enumerate() {
        match signal_from_candidate(&dimension.id, candidate) {
            Ok(signal) => signals.push(signal),
            Err(e) => {
                warn!(dimension = %dimension.id, index, error = %e, "skipping candidate without a usable signal");
            }
        }
    }

    debug!(
        dimension = %dimension.id,
        candidates = candidates.len(),
        signals = signals.len(),
        "signals extracted"
    );

    SignalExtraction {
        signals,
        candidates,
    }
}

fn signal_from_candidate(dim_id: &str, candidate: &RawCandidate) -> Result<Signal> {
    let sub_topic = candidate.display_title().trim();
    if sub_topic.is_empty() {
        return Err(RepoloreError::Signal(
            "candidate has neither a sub-topic nor a title".into(),
        ));
    }

    let evidence = match candidate.scan_result.as_ref() {
        Some(scan) if scan.match_count() > 0 => structured_evidence(scan),
        _ => textual_evidence(candidate),
    };

    let mut heuristic_hints = Vec::new();
    if !candidate.summary.trim().is_empty() {
        heuristic_hints.push(candidate.summary.trim().to_string());
    }
    if let Some(note) = candidate
        .skill_enhanced
        .as_deref()
        .filter(|n| !n.trim().is_empty())
    {
        heuristic_hints.push(format!(
            "skill-enhanced: {}",
            truncate_chars(note.trim(), MAX_PROVENANCE_CHARS)
        ));
    }

    Ok(Signal {
        dim_id: dim_id.to_string(),
        sub_topic: sub_topic.to_string(),
        evidence,
        heuristic_hints,
        related_signals: candidate
            .relations
            .iter()
            .take(MAX_RELATED)
            .cloned()
            .collect(),
        meta: SignalMeta {
            knowledge_type: candidate.knowledge_type.clone(),
            tags: candidate.tags.clone(),
            language: candidate.language.clone(),
            title: candidate.title.clone(),
        },
    })
}

fn structured_evidence(scan: &ScanResult) -> SignalEvidence {
    let match_count = scan.match_count();

    let distribution = scan
        .variants
        .iter()
        .filter(|v| v.file_count > 0)
        .map(|v| DistributionEntry {
            label: v.label.clone(),
            file_count: v.file_count,
            pct: percent(v.file_count, match_count),
            boilerplate: v.boilerplate,
        })
        .collect();

    let ordered = scan
        .variants
        .iter()
        .filter(|v| !v.boilerplate)
        .chain(scan.variants.iter().filter(|v| v.boilerplate));
    let samples = ordered
        .flat_map(|v| v.examples.iter().map(move |ex| (v, ex)))
        .filter(|(_, ex)| non_whitespace_len(&ex.code) >= MIN_SAMPLE_CHARS)
        .take(MAX_SAMPLES)
        .map(|(v, ex)| Sample {
            file: ex.file.clone(),
            line: ex.line,
            code: truncate_chars(ex.code.trim(), MAX_SAMPLE_CODE_CHARS),
            variant: v.label.clone(),
        })
        .collect();

    let top_files = distinct(
        scan.variants
            .iter()
            .flat_map(|v| v.examples.iter().map(|ex| ex.file.as_str())),
        MAX_TOP_FILES,
    );

    SignalEvidence::Structured {
        match_count,
        top_files,
        distribution,
        samples,
    }
}

fn textual_evidence(candidate: &RawCandidate) -> SignalEvidence {
    let sources = distinct(candidate.sources.iter().map(String::as_str), usize::MAX);
    SignalEvidence::Textual {
        match_count: sources.len() as u64,
        top_files: sources.into_iter().take(MAX_TOP_FILES).collect(),
        metrics: parse_metrics(&candidate.summary),
        search_hints: search_hints(&candidate.sub_topic, &candidate.knowledge_type),
    }
}

fn percent(part: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    (part as f64 / total as f64 * 100.0).round() as u32
}

// ---------------------------------------------------------------------------
// Degraded-mode helpers
// ---------------------------------------------------------------------------

/// "36 个类" → `类`, "12 files" → `files`. Particles end a CJK unit.
static NUMBER_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d+(?:\.\d+)?)\s*(?:个|种|处|条|份|项)?\s*([\p{Han}&&[^的了使用是有在中为被和及与]]{1,4}|[A-Za-z][A-Za-z_-]*)",
    )
    .expect("number/unit pattern is valid")
});

static PERCENTAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("percentage pattern is valid")
});

/// Pull `{unit: count}` and percentage metrics out of a human-readable summary.
/// Percentages are keyed `pct`, `pct_2`, `pct_3`, ...; the first value per unit wins.
pub fn parse_metrics(summary: &str) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();

    for caps in NUMBER_UNIT.captures_iter(summary) {
        let (Some(value), Some(unit)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if let Ok(n) = value.as_str().parse::<f64>() {
            metrics.entry(unit.as_str().to_string()).or_insert(n);
        }
    }

    for (i, caps) in PERCENTAGE.captures_iter(summary).enumerate() {
        let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) else {
            continue;
        };
        let key = if i == 0 {
            "pct".to_string()
        } else {
            format!("pct_{}", i + 1)
        };
        metrics.insert(key, n);
    }

    metrics
}

/// Keyword → search hints handed to the agent when no structured evidence exists.
const SEARCH_HINT_TABLE: &[(&str, &[&str])] = &[
    ("naming", &["class prefix", "method naming", "constant naming"]),
    ("prefix", &["class prefix", "category prefix"]),
    ("singleton", &["sharedInstance", "dispatch_once", "static instance"]),
    ("delegate", &["@protocol", "weak delegate", "respondsToSelector"]),
    ("notification", &["NSNotificationCenter", "addObserver", "postNotificationName"]),
    ("event", &["emit", "subscribe", "observer"]),
    ("error", &["NSError", "error handling", "try/catch"]),
    ("thread", &["dispatch_async", "main queue", "lock"]),
    ("concurrency", &["dispatch_async", "async", "lock"]),
    ("architecture", &["import", "module boundary", "dependency direction"]),
    ("layer", &["import", "module boundary", "dependency direction"]),
    ("network", &["request", "session", "response parsing"]),
    ("log", &["logger", "log level", "print"]),
    ("test", &["XCTest", "assert", "mock"]),
];

/// Pick at most [`MAX_SEARCH_HINTS`] hints by matching the sub-topic or
/// knowledge type against [`SEARCH_HINT_TABLE`].
pub fn search_hints(sub_topic: &str, knowledge_type: &str) -> Vec<String> {
    let haystack = format!("{sub_topic} {knowledge_type}").to_lowercase();
    let mut hints: Vec<String> = Vec::new();

    for (keyword, table_hints) in SEARCH_HINT_TABLE {
        if !haystack.contains(keyword) {
            continue;
        }
        for hint in *table_hints {
            if hints.len() == MAX_SEARCH_HINTS {
                return hints;
            }
            if !hints.iter().any(|h| h == hint) {
                hints.push((*hint).to_string());
            }
        }
    }

    hints
}

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

fn non_whitespace_len(code: &str) -> usize {
    code.chars().filter(|c| !c.is_whitespace()).count()
}

fn distinct<'a>(items: impl Iterator<Item = &'a str>, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .filter(|s| !s.is_empty() && seen.insert(*s))
        .take(limit)
        .map(str::to_string)
        .collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
