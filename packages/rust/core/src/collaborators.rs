//! External collaborators of the orchestrator.
//!
//! Every seam is a trait so the run can be driven by real adapters (CLI,
//! storage, bridge subprocess) or by in-memory fakes. Optional collaborators
//! come with a no-op implementation that the orchestrator falls back to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use repolore_shared::{
    Dimension, FileSet, OutputKind, RawCandidate, Result, SessionId, TargetMap,
};

use crate::budget::Budget;
use crate::digest::DimensionDigest;
use crate::dimension_context::{CandidateInfo, ContextSnapshot};
use crate::pipeline_context::PipelineContext;
use crate::signals::Signal;

/// Tool name the production agent uses to submit a candidate.
pub const SUBMIT_TOOL: &str = "submit_knowledge";

// ---------------------------------------------------------------------------
// Evidence supplier
// ---------------------------------------------------------------------------

/// Produces raw candidates for a dimension from the run's scan buffers.
///
/// Must be safe to call repeatedly for the same dimension: the orchestrator
/// calls it once for signals and may call it again as a fallback.
#[async_trait]
pub trait EvidenceSupplier: Send + Sync {
    async fn extract(
        &self,
        dimension: &Dimension,
        files: &FileSet,
        targets: &TargetMap,
        context: &PipelineContext,
    ) -> Result<Vec<RawCandidate>>;
}

// ---------------------------------------------------------------------------
// Production agent
// ---------------------------------------------------------------------------

/// Dimension metadata sent along with a production call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionMeta {
    pub id: String,
    pub label: String,
    pub output: OutputKind,
    pub knowledge_types: Vec<String>,
}

impl From<&Dimension> for DimensionMeta {
    fn from(d: &Dimension) -> Self {
        Self {
            id: d.id.clone(),
            label: d.label.clone(),
            output: d.output_kind(),
            knowledge_types: d.knowledge_types.clone(),
        }
    }
}

/// Everything besides the prompt that a production call needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionRequest {
    pub budget: Budget,
    pub dimension: DimensionMeta,
    pub conversation_id: String,
}

/// Outcome of one tool invocation made by the agent during a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Accepted,
    Rejected,
    Error,
    #[default]
    Unknown,
}

/// A tool invocation observed as a side effect of a production call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub status: ToolCallStatus,
}

impl ToolCall {
    /// The submitted candidate, if this call is an accepted submission.
    pub fn accepted_submission(&self) -> Option<CandidateFields> {
        if self.name != SUBMIT_TOOL || self.status != ToolCallStatus::Accepted {
            return None;
        }
        let fields: CandidateFields = serde_json::from_value(self.args.clone()).ok()?;
        (!fields.title.trim().is_empty() || !fields.sub_topic.trim().is_empty()).then_some(fields)
    }
}

/// Free-form reply plus the tool calls made while producing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductionReply {
    pub reply: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// The agent that refines signals into candidates and a digest.
#[async_trait]
pub trait ProductionAgent: Send + Sync {
    /// `false` for mocks and disabled agents; the orchestrator then treats
    /// the agent as unavailable.
    fn has_real_capability(&self) -> bool {
        true
    }

    async fn execute(&self, prompt: &str, request: &ProductionRequest) -> Result<ProductionReply>;
}

// ---------------------------------------------------------------------------
// Task tracker
// ---------------------------------------------------------------------------

/// How to proceed when no production agent is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserDecision {
    Degrade,
    Abort,
}

/// Data attached to a dimension's completion or failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    /// Number of signals the dimension was briefed with.
    pub source_count: usize,
    /// Number of raw candidates extracted for the dimension.
    pub extracted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Progress notifications emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    AgentUnavailable,
    PathSelected { path: String },
    DimensionStarted { dim_id: String, index: usize, total: usize },
    SignalsExtracted { dim_id: String, signals: usize, candidates: usize },
    ProductionStarted { dim_id: String },
    AggregationStarted { dimensions: usize },
    RunFinished { outcome: String },
}

/// Session bookkeeping and progress reporting. Every method defaults to a
/// no-op so an absent tracker is just [`NoopTracker`].
#[async_trait]
pub trait TaskTracker: Send + Sync {
    /// Whether `session` is still the current run. A newer run supersedes it.
    async fn is_session_valid(&self, _session: &SessionId) -> bool {
        true
    }

    fn mark_task_filling(&self, _dim_id: &str) {}

    fn mark_task_completed(&self, _dim_id: &str, _update: &TaskUpdate) {}

    fn mark_task_failed(&self, _dim_id: &str, _update: &TaskUpdate) {}

    fn mark_task_skipped(&self, _dim_id: &str, _reason: &str) {}

    fn emit_progress(&self, _event: &ProgressEvent) {}

    /// Ask the user how to proceed. `None` means no answer.
    async fn wait_for_user_decision(&self, _session: &SessionId, _message: &str) -> Option<UserDecision> {
        None
    }

    /// Offered the serialized Dimension Context after every dimension.
    async fn checkpoint(&self, _session: &SessionId, _snapshot: &str) {}
}

/// Tracker that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl TaskTracker for NoopTracker {}

// ---------------------------------------------------------------------------
// Persistence sink
// ---------------------------------------------------------------------------

/// Provenance of a persisted candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceTag {
    /// Submitted by the production agent.
    Agent,
    /// Persisted straight from the scanners because no agent was available.
    HeuristicOnly,
    /// Persisted from the scanners after the agent failed or submitted nothing.
    Fallback,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::HeuristicOnly => "heuristic-only",
            Self::Fallback => "fallback",
        }
    }
}

impl std::str::FromStr for SourceTag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "heuristic-only" => Ok(Self::HeuristicOnly),
            "fallback" => Ok(Self::Fallback),
            other => Err(format!("unknown source tag: {other}")),
        }
    }
}

/// Knowledge fields of a candidate, as the sink receives them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CandidateFields {
    pub title: String,
    pub sub_topic: String,
    pub summary: String,
    pub code: String,
    pub language: String,
    pub knowledge_type: String,
    pub tags: Vec<String>,
    pub sources: Vec<String>,
}

impl CandidateFields {
    pub fn from_raw(raw: &RawCandidate) -> Self {
        Self {
            title: raw.display_title().to_string(),
            sub_topic: raw.sub_topic.clone(),
            summary: raw.summary.clone(),
            code: raw.code.clone(),
            language: raw.language.clone(),
            knowledge_type: raw.knowledge_type.clone(),
            tags: raw.tags.clone(),
            sources: raw.sources.clone(),
        }
    }

    /// Title, or the sub-topic when the agent left the title empty.
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.sub_topic
        } else {
            &self.title
        }
    }

    pub fn info(&self) -> CandidateInfo {
        CandidateInfo {
            title: self.display_title().to_string(),
            sub_topic: self.sub_topic.clone(),
            summary: self.summary.clone(),
        }
    }
}

/// Where a persisted candidate belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOptions {
    pub session: SessionId,
    pub dimension_id: String,
}

/// Stores candidates. Each call may fail independently.
#[async_trait]
pub trait CandidateSink: Send + Sync {
    async fn create_from_tool_params(
        &self,
        fields: &CandidateFields,
        source: SourceTag,
        opts: &PersistOptions,
        actor: &str,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// One skill-worthy dimension's material for the aggregation pass.
#[derive(Debug, Clone)]
pub struct AggregationInput {
    pub dimension: Dimension,
    pub candidates: Vec<RawCandidate>,
    pub digest: Option<DimensionDigest>,
}

/// Turns retained candidates of skill-worthy dimensions into skills.
#[async_trait]
pub trait SkillAggregator: Send + Sync {
    /// Returns the number of skills written.
    async fn aggregate(&self, session: &SessionId, inputs: &[AggregationInput]) -> Result<usize>;
}

/// Aggregator that produces nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAggregator;

#[async_trait]
impl SkillAggregator for NoopAggregator {
    async fn aggregate(&self, _session: &SessionId, _inputs: &[AggregationInput]) -> Result<usize> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Prompt building
// ---------------------------------------------------------------------------

/// Renders the prompt for one dimension's production call.
pub trait PromptBuilder: Send + Sync {
    fn build(
        &self,
        dimension: &Dimension,
        signals: &[Signal],
        context: &ContextSnapshot,
        budget: &Budget,
    ) -> Result<String>;
}

/// Serializes everything the agent needs as one pretty-printed JSON document.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPromptBuilder;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptDocument<'a> {
    dimension: &'a Dimension,
    budget: &'a Budget,
    context: &'a ContextSnapshot,
    signals: &'a [Signal],
}

impl PromptBuilder for JsonPromptBuilder {
    fn build(
        &self,
        dimension: &Dimension,
        signals: &[Signal],
        context: &ContextSnapshot,
        budget: &Budget,
    ) -> Result<String> {
        let doc = PromptDocument {
            dimension,
            budget,
            context,
            signals,
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }
}
