//! In-memory collaborators for orchestrator tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use repolore_shared::{
    Dimension, FileSet, OutputKind, RawCandidate, RepoloreError, Result, SessionId, TargetMap,
};

use crate::collaborators::*;
use crate::pipeline_context::PipelineContext;

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub(crate) fn dimension(id: &str, kind: OutputKind) -> Dimension {
    let (skill_worthy, dual_output) = match kind {
        OutputKind::Candidates => (false, false),
        OutputKind::DigestOnly => (true, false),
        OutputKind::Dual => (true, true),
    };
    Dimension {
        id: id.into(),
        label: id.to_uppercase(),
        guide: format!("analyse {id}"),
        skill_worthy,
        dual_output,
        knowledge_types: vec!["code-pattern".into()],
    }
}

pub(crate) fn candidate(sub_topic: &str) -> RawCandidate {
    RawCandidate {
        sub_topic: sub_topic.into(),
        summary: format!("{sub_topic} appears in 12 files"),
        language: "objc".into(),
        knowledge_type: "code-pattern".into(),
        sources: vec![format!("src/{sub_topic}.m")],
        ..Default::default()
    }
}

pub(crate) fn submission(title: &str, sub_topic: &str) -> ToolCall {
    ToolCall {
        name: SUBMIT_TOOL.into(),
        args: serde_json::json!({
            "title": title,
            "subTopic": sub_topic,
            "summary": format!("{title} summary"),
        }),
        status: ToolCallStatus::Accepted,
    }
}

pub(crate) fn reply(digest_summary: Option<&str>, tool_calls: Vec<ToolCall>) -> ProductionReply {
    let reply = match digest_summary {
        Some(summary) => format!(
            "Done.\n```json\n{{\"dimensionDigest\": {{\"summary\": \"{summary}\", \"candidateCount\": {}}}}}\n```",
            tool_calls.len()
        ),
        None => "Done, nothing to report.".into(),
    };
    ProductionReply { reply, tool_calls }
}

// ---------------------------------------------------------------------------
// Evidence supplier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct ScriptedSupplier {
    evidence: HashMap<String, Vec<RawCandidate>>,
    failures: Mutex<HashMap<String, usize>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedSupplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dim_id: &str, candidates: Vec<RawCandidate>) -> Self {
        self.evidence.insert(dim_id.into(), candidates);
        self
    }

    /// Fail the first `times` calls for `dim_id`.
    pub fn failing(self, dim_id: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(dim_id.into(), times);
        self
    }

    pub fn calls_for(&self, dim_id: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == dim_id).count()
    }
}

#[async_trait]
impl EvidenceSupplier for ScriptedSupplier {
    async fn extract(
        &self,
        dimension: &Dimension,
        _files: &FileSet,
        _targets: &TargetMap,
        _context: &PipelineContext,
    ) -> Result<Vec<RawCandidate>> {
        self.calls.lock().unwrap().push(dimension.id.clone());
        if let Some(remaining) = self.failures.lock().unwrap().get_mut(&dimension.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RepoloreError::evidence(&dimension.id, "scanner crashed"));
            }
        }
        Ok(self.evidence.get(&dimension.id).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Production agent
// ---------------------------------------------------------------------------

pub(crate) enum AgentScript {
    Reply(ProductionReply),
    Fail(String),
    Hang,
}

pub(crate) struct ScriptedAgent {
    scripts: HashMap<String, AgentScript>,
    real: bool,
    /// `(dimension id, prompt)` per call.
    pub calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            real: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn mock() -> Self {
        Self {
            real: false,
            ..Self::new()
        }
    }

    pub fn on(mut self, dim_id: &str, script: AgentScript) -> Self {
        self.scripts.insert(dim_id.into(), script);
        self
    }

    pub fn prompt_for(&self, dim_id: &str) -> Option<serde_json::Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == dim_id)
            .map(|(_, prompt)| serde_json::from_str(prompt).unwrap())
    }

    pub fn called_dimensions(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl ProductionAgent for ScriptedAgent {
    fn has_real_capability(&self) -> bool {
        self.real
    }

    async fn execute(&self, prompt: &str, request: &ProductionRequest) -> Result<ProductionReply> {
        self.calls
            .lock()
            .unwrap()
            .push((request.dimension.id.clone(), prompt.to_string()));
        match self.scripts.get(&request.dimension.id) {
            Some(AgentScript::Reply(r)) => Ok(r.clone()),
            Some(AgentScript::Fail(msg)) => Err(RepoloreError::Production(msg.clone())),
            Some(AgentScript::Hang) => std::future::pending::<Result<ProductionReply>>().await,
            None => Ok(reply(None, vec![])),
        }
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingSink {
    fail_sub_topics: HashSet<String>,
    /// `(dimension id, fields, tag)` per successful call.
    pub stored: Mutex<Vec<(String, CandidateFields, SourceTag)>>,
    pub actors: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, sub_topic: &str) -> Self {
        self.fail_sub_topics.insert(sub_topic.into());
        self
    }

    pub fn stored_for(&self, dim_id: &str) -> Vec<(CandidateFields, SourceTag)> {
        self.stored
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == dim_id)
            .map(|(_, f, t)| (f.clone(), *t))
            .collect()
    }

    pub fn total(&self) -> usize {
        self.stored.lock().unwrap().len()
    }
}

#[async_trait]
impl CandidateSink for RecordingSink {
    async fn create_from_tool_params(
        &self,
        fields: &CandidateFields,
        source: SourceTag,
        opts: &PersistOptions,
        actor: &str,
    ) -> Result<()> {
        if self.fail_sub_topics.contains(&fields.sub_topic) {
            return Err(RepoloreError::Persistence(format!(
                "duplicate candidate {}",
                fields.sub_topic
            )));
        }
        self.actors.lock().unwrap().push(actor.to_string());
        self.stored
            .lock()
            .unwrap()
            .push((opts.dimension_id.clone(), fields.clone(), source));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TrackerEvent {
    Filling(String),
    Completed(String, TaskUpdate),
    Failed(String, TaskUpdate),
    Skipped(String, String),
}

pub(crate) enum DecisionScript {
    Answer(Option<UserDecision>),
    Hang,
}

pub(crate) struct RecordingTracker {
    decision: DecisionScript,
    /// Number of session checks that succeed before the session is superseded.
    valid_checks: Mutex<Option<usize>>,
    pub events: Mutex<Vec<TrackerEvent>>,
    pub progress: Mutex<Vec<ProgressEvent>>,
    pub checkpoints: Mutex<Vec<String>>,
    pub decisions_asked: Mutex<usize>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self {
            decision: DecisionScript::Answer(None),
            valid_checks: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
            checkpoints: Mutex::new(Vec::new()),
            decisions_asked: Mutex::new(0),
        }
    }

    pub fn deciding(mut self, decision: DecisionScript) -> Self {
        self.decision = decision;
        self
    }

    pub fn superseded_after(self, checks: usize) -> Self {
        *self.valid_checks.lock().unwrap() = Some(checks);
        self
    }

    pub fn completed(&self, dim_id: &str) -> Option<TaskUpdate> {
        self.events.lock().unwrap().iter().find_map(|e| match e {
            TrackerEvent::Completed(id, update) if id == dim_id => Some(update.clone()),
            _ => None,
        })
    }

    pub fn failed(&self, dim_id: &str) -> Option<TaskUpdate> {
        self.events.lock().unwrap().iter().find_map(|e| match e {
            TrackerEvent::Failed(id, update) if id == dim_id => Some(update.clone()),
            _ => None,
        })
    }

    pub fn skipped(&self, dim_id: &str) -> Option<String> {
        self.events.lock().unwrap().iter().find_map(|e| match e {
            TrackerEvent::Skipped(id, reason) if id == dim_id => Some(reason.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl TaskTracker for RecordingTracker {
    async fn is_session_valid(&self, _session: &SessionId) -> bool {
        let mut remaining = self.valid_checks.lock().unwrap();
        match remaining.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    fn mark_task_filling(&self, dim_id: &str) {
        self.events
            .lock()
            .unwrap()
            .push(TrackerEvent::Filling(dim_id.into()));
    }

    fn mark_task_completed(&self, dim_id: &str, update: &TaskUpdate) {
        self.events
            .lock()
            .unwrap()
            .push(TrackerEvent::Completed(dim_id.into(), update.clone()));
    }

    fn mark_task_failed(&self, dim_id: &str, update: &TaskUpdate) {
        self.events
            .lock()
            .unwrap()
            .push(TrackerEvent::Failed(dim_id.into(), update.clone()));
    }

    fn mark_task_skipped(&self, dim_id: &str, reason: &str) {
        self.events
            .lock()
            .unwrap()
            .push(TrackerEvent::Skipped(dim_id.into(), reason.into()));
    }

    fn emit_progress(&self, event: &ProgressEvent) {
        self.progress.lock().unwrap().push(event.clone());
    }

    async fn wait_for_user_decision(&self, _session: &SessionId, _message: &str) -> Option<UserDecision> {
        *self.decisions_asked.lock().unwrap() += 1;
        match &self.decision {
            DecisionScript::Answer(answer) => *answer,
            DecisionScript::Hang => std::future::pending::<Option<UserDecision>>().await,
        }
    }

    async fn checkpoint(&self, _session: &SessionId, snapshot: &str) {
        self.checkpoints.lock().unwrap().push(snapshot.to_string());
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingAggregator {
    fail: bool,
    /// Dimension ids per aggregation call.
    pub calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl SkillAggregator for RecordingAggregator {
    async fn aggregate(&self, _session: &SessionId, inputs: &[AggregationInput]) -> Result<usize> {
        self.calls
            .lock()
            .unwrap()
            .push(inputs.iter().map(|i| i.dimension.id.clone()).collect());
        if self.fail {
            return Err(RepoloreError::Aggregation("skill writer unavailable".into()));
        }
        Ok(inputs.len())
    }
}
