//! Core domain types for repolore bootstrap runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new time-sortable session identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Dimension
// ---------------------------------------------------------------------------

/// What a dimension is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Discrete, searchable candidates only.
    Candidates,
    /// A single aggregated skill document; no candidates are expected.
    DigestOnly,
    /// Both a digest and discrete candidates.
    Dual,
}

/// One analysis topic in the fixed pipeline order. Immutable for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimension {
    /// Stable identifier (e.g. `code-standard`).
    pub id: String,
    /// Display label.
    pub label: String,
    /// Free-text instructions handed to the production agent.
    #[serde(default)]
    pub guide: String,
    /// Whether the dimension feeds the aggregation pass.
    #[serde(default)]
    pub skill_worthy: bool,
    /// Whether the dimension produces both a digest and candidates.
    #[serde(default)]
    pub dual_output: bool,
    /// Allowed output categories.
    #[serde(default)]
    pub knowledge_types: Vec<String>,
}

impl Dimension {
    /// Classify the dimension's expected output.
    pub fn output_kind(&self) -> OutputKind {
        match (self.skill_worthy, self.dual_output) {
            (true, false) => OutputKind::DigestOnly,
            (true, true) => OutputKind::Dual,
            (false, _) => OutputKind::Candidates,
        }
    }

    /// Skill-worthy and not dual-output: candidates are never persisted directly.
    pub fn is_digest_only(&self) -> bool {
        self.output_kind() == OutputKind::DigestOnly
    }
}

// ---------------------------------------------------------------------------
// Raw evidence
// ---------------------------------------------------------------------------

/// One code example attached to a scan variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanExample {
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub code: String,
}

/// One observed variant of a convention (e.g. `camelCase` vs `snake_case`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanVariant {
    pub label: String,
    #[serde(default)]
    pub file_count: u64,
    /// Generated or template code that should rank below hand-written examples.
    #[serde(default)]
    pub boilerplate: bool,
    #[serde(default)]
    pub examples: Vec<ScanExample>,
}

/// Structured scan evidence attached to a raw candidate by the heuristic scanners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    #[serde(default)]
    pub variants: Vec<ScanVariant>,
}

impl ScanResult {
    /// Total matched files across non-empty variants.
    pub fn match_count(&self) -> u64 {
        self.variants
            .iter()
            .filter(|v| v.file_count > 0)
            .map(|v| v.file_count)
            .sum()
    }
}

/// Raw per-dimension evidence produced by the external scanners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCandidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub sub_topic: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub knowledge_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub relations: Vec<String>,
    #[serde(rename = "_scanResult", default, skip_serializing_if = "Option::is_none")]
    pub scan_result: Option<ScanResult>,
    /// Provenance note left by an earlier skill-enhanced pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_enhanced: Option<String>,
}

impl RawCandidate {
    /// Title if present, otherwise the sub-topic.
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.sub_topic)
    }
}

// ---------------------------------------------------------------------------
// Project facts and transient scan buffers
// ---------------------------------------------------------------------------

/// Immutable per-run facts about the analysed project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFacts {
    pub name: String,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub primary_language: String,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub file_count: usize,
    #[serde(default)]
    pub target_count: usize,
}

/// A scanned source file handed to the evidence supplier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    pub path: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub lines: usize,
}

/// The raw file set of a run.
pub type FileSet = Vec<SourceFile>;

/// One build target and its dependency edges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Build targets keyed by name (the run's dependency-graph data).
pub type TargetMap = BTreeMap<String, TargetInfo>;
