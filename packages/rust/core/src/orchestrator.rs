//! Bootstrap run orchestration.
//!
//! A run walks the dimension list in its fixed order:
//!
//! 1. Availability check: is there a production agent with real capability?
//!    If not, the user (or the configured policy) decides between degrading
//!    and aborting.
//! 2. Degraded path: raw candidates are persisted straight from the evidence
//!    supplier.
//!    AI path: signals are extracted for every dimension first, then each
//!    dimension is produced by the agent with its context snapshot and budget.
//! 3. Aggregation over the skill-worthy dimensions that retained candidates.
//! 4. Done: transient scan buffers are released.
//!
//! Nothing below [`Orchestrator::run`] escapes as an error: per-candidate and
//! per-dimension failures end up in the run report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use repolore_shared::{
    AppConfig, Dimension, FileSet, MissingAgentPolicy, ProjectFacts, RawCandidate, RepoloreError,
    Result, SessionId, TargetMap,
};

use crate::budget::compute_budget;
use crate::collaborators::{
    AggregationInput, CandidateFields, CandidateSink, EvidenceSupplier, JsonPromptBuilder,
    NoopAggregator, NoopTracker, PersistOptions, ProductionAgent, ProductionReply,
    ProductionRequest, ProgressEvent, PromptBuilder, SkillAggregator, SourceTag, TaskTracker,
    TaskUpdate, ToolCall, UserDecision,
};
use crate::digest::{DimensionDigest, parse_digest};
use crate::dimension_context::DimensionContext;
use crate::pipeline_context::PipelineContext;
use crate::signals::{SignalExtraction, extract_signals};
use crate::stage::{self, Stage, StageOutcome};

/// Reason attached to a dimension with nothing to persist.
pub const REASON_EMPTY: &str = "empty";
/// Reason attached to a dimension restored from a checkpoint.
pub const REASON_RESUMED: &str = "resumed";
/// Reason attached to digest-only dimensions settled by aggregation.
pub const REASON_AGGREGATED: &str = "aggregated";
/// Reason attached to dimensions skipped because the user aborted.
pub const REASON_ABORTED: &str = "aborted";
/// Reason attached to dimensions skipped because a newer run took over.
pub const REASON_SUPERSEDED: &str = "superseded";

/// Pipeline-context result key under which each dimension's digest is cached.
pub const DIGEST_RESULT_KEY: &str = "digest";

const MISSING_AGENT_PROMPT: &str =
    "No production agent is available. Continue with heuristic-only extraction?";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime settings of the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ceiling for one dimension's production call.
    pub production_timeout: Duration,
    /// How long to wait for a user decision when no agent is available.
    pub decision_timeout: Duration,
    pub on_missing_agent: MissingAgentPolicy,
    /// Actor recorded on every persisted candidate.
    pub actor: String,
    /// Skip dimensions that already have a digest in a restored context.
    pub resume: bool,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            production_timeout: Duration::from_secs(p.production_timeout_secs),
            decision_timeout: Duration::from_secs(p.decision_timeout_secs),
            on_missing_agent: p.on_missing_agent,
            actor: p.actor.clone(),
            resume: p.resume,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Run input and report
// ---------------------------------------------------------------------------

/// Everything one run consumes.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub session: SessionId,
    pub project: ProjectFacts,
    /// Dimensions in pipeline order.
    pub dimensions: Vec<Dimension>,
    pub files: FileSet,
    pub targets: TargetMap,
    /// Context restored from a checkpoint of the same session.
    pub resume_from: Option<DimensionContext>,
}

impl RunInput {
    pub fn new(project: ProjectFacts, dimensions: Vec<Dimension>) -> Self {
        Self {
            session: SessionId::new(),
            project,
            dimensions,
            files: FileSet::new(),
            targets: TargetMap::new(),
            resume_from: None,
        }
    }
}

/// One entry of the run's error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub dimension: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_topic: Option<String>,
    pub error: String,
}

/// Run-wide persistence counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateResults {
    pub created: usize,
    pub failed: usize,
    pub errors: Vec<RunError>,
}

/// Which branch of the run executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPath {
    Ai,
    Degraded,
}

impl RunPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Degraded => "degraded",
        }
    }
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted,
    Superseded,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionStatus {
    /// Not finished yet; digest-only dimensions wait here for aggregation.
    Pending,
    Completed,
    Failed,
    Skipped,
}

/// Per-dimension summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionReport {
    pub dim_id: String,
    pub status: DimensionStatus,
    pub signals: usize,
    pub extracted: usize,
    /// Accepted agent submissions.
    pub submitted: usize,
    /// Candidates persisted through the sink for this dimension.
    pub persisted: usize,
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DimensionReport {
    fn new(dim_id: &str) -> Self {
        Self {
            dim_id: dim_id.to_string(),
            status: DimensionStatus::Pending,
            signals: 0,
            extracted: 0,
            submitted: 0,
            persisted: 0,
            fallback: false,
            reason: None,
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub session: SessionId,
    pub path: Option<RunPath>,
    pub outcome: RunOutcome,
    pub results: CandidateResults,
    pub dimensions: Vec<DimensionReport>,
    /// Dimensions handed to the aggregation pass.
    pub aggregated: Vec<String>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn dimension(&self, dim_id: &str) -> Option<&DimensionReport> {
        self.dimensions.iter().find(|d| d.dim_id == dim_id)
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Mutable state of one run, passed explicitly through every stage.
struct RunState {
    session: SessionId,
    files: FileSet,
    targets: TargetMap,
    pipeline: PipelineContext,
    context: DimensionContext,
    results: CandidateResults,
    /// Raw candidates of skill-worthy dimensions, kept for aggregation.
    retained: BTreeMap<String, Vec<RawCandidate>>,
    /// Task updates of digest-only dimensions awaiting aggregation.
    pending: BTreeMap<String, TaskUpdate>,
    reports: Vec<DimensionReport>,
    aggregated: Vec<String>,
    path: Option<RunPath>,
    outcome: RunOutcome,
}

impl RunState {
    fn report_mut(&mut self, dim_id: &str) -> &mut DimensionReport {
        let index = match self.reports.iter().position(|r| r.dim_id == dim_id) {
            Some(i) => i,
            None => {
                self.reports.push(DimensionReport::new(dim_id));
                self.reports.len() - 1
            }
        };
        &mut self.reports[index]
    }

    fn record_error(&mut self, dimension: &str, sub_topic: Option<&str>, error: &RepoloreError) {
        self.results.errors.push(RunError {
            dimension: dimension.to_string(),
            sub_topic: sub_topic.map(str::to_string),
            error: error.to_string(),
        });
    }

    /// Drop the scan buffers and caches that must not outlive the run.
    fn release(&mut self) {
        self.files = FileSet::new();
        self.targets = TargetMap::new();
        self.retained.clear();
        self.pipeline.clear();
    }
}

enum PathChoice {
    Ai(Arc<dyn ProductionAgent>),
    Degraded,
    Abort,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives a run over its collaborators.
pub struct Orchestrator {
    config: PipelineConfig,
    supplier: Arc<dyn EvidenceSupplier>,
    sink: Arc<dyn CandidateSink>,
    agent: Option<Arc<dyn ProductionAgent>>,
    tracker: Arc<dyn TaskTracker>,
    aggregator: Arc<dyn SkillAggregator>,
    prompts: Arc<dyn PromptBuilder>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        supplier: Arc<dyn EvidenceSupplier>,
        sink: Arc<dyn CandidateSink>,
    ) -> Self {
        Self {
            config,
            supplier,
            sink,
            agent: None,
            tracker: Arc::new(NoopTracker),
            aggregator: Arc::new(NoopAggregator),
            prompts: Arc::new(JsonPromptBuilder),
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn ProductionAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn TaskTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn SkillAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_prompt_builder(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one run to completion. Always returns a report.
    #[instrument(skip_all, fields(session = %input.session, dimensions = input.dimensions.len()))]
    pub async fn run(&self, input: RunInput) -> RunReport {
        let started = Instant::now();
        let RunInput {
            session,
            project,
            dimensions,
            files,
            targets,
            resume_from,
        } = input;

        let context = match resume_from {
            Some(ctx) => {
                info!(digests = ctx.digests().len(), "resuming from checkpoint");
                ctx
            }
            None => DimensionContext::new(project),
        };

        let mut state = RunState {
            session,
            files,
            targets,
            pipeline: PipelineContext::new(),
            context,
            results: CandidateResults::default(),
            retained: BTreeMap::new(),
            pending: BTreeMap::new(),
            reports: dimensions.iter().map(|d| DimensionReport::new(&d.id)).collect(),
            aggregated: Vec::new(),
            path: None,
            outcome: RunOutcome::Completed,
        };

        // --- Phase 1: availability check ---
        match self.select_path(&state.session).await {
            PathChoice::Abort => self.abort(&mut state, &dimensions),
            PathChoice::Degraded => {
                self.enter_path(&mut state, RunPath::Degraded);
                self.run_degraded(&mut state, &dimensions).await;
            }
            PathChoice::Ai(agent) => {
                self.enter_path(&mut state, RunPath::Ai);
                self.run_ai(&mut state, &dimensions, agent).await;
            }
        }

        // --- Phase 3: aggregation ---
        match state.outcome {
            RunOutcome::Completed => self.aggregate(&mut state, &dimensions).await,
            RunOutcome::Superseded => self.skip_unfinished(&mut state, REASON_SUPERSEDED),
            RunOutcome::Aborted => {}
        }

        // --- Phase 4: done ---
        state.release();
        self.tracker.emit_progress(&ProgressEvent::RunFinished {
            outcome: state.outcome.as_str().to_string(),
        });

        let elapsed = started.elapsed();
        info!(
            outcome = state.outcome.as_str(),
            created = state.results.created,
            failed = state.results.failed,
            errors = state.results.errors.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "run finished"
        );

        RunReport {
            session: state.session,
            path: state.path,
            outcome: state.outcome,
            results: state.results,
            dimensions: state.reports,
            aggregated: state.aggregated,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    // -----------------------------------------------------------------------
    // Availability
    // -----------------------------------------------------------------------

    async fn select_path(&self, session: &SessionId) -> PathChoice {
        if let Some(agent) = self.agent.as_ref().filter(|a| a.has_real_capability()) {
            return PathChoice::Ai(Arc::clone(agent));
        }

        warn!("no production agent with real capability");
        self.tracker.emit_progress(&ProgressEvent::AgentUnavailable);

        let decision = match self.config.on_missing_agent {
            MissingAgentPolicy::Degrade => UserDecision::Degrade,
            MissingAgentPolicy::Abort => UserDecision::Abort,
            MissingAgentPolicy::Ask => self.ask_user(session).await,
        };

        match decision {
            UserDecision::Degrade => PathChoice::Degraded,
            UserDecision::Abort => PathChoice::Abort,
        }
    }

    /// Bounded wait for the user's answer; no answer means degrade.
    async fn ask_user(&self, session: &SessionId) -> UserDecision {
        let wait = self
            .tracker
            .wait_for_user_decision(session, MISSING_AGENT_PROMPT);
        match tokio::time::timeout(self.config.decision_timeout, wait).await {
            Ok(Some(decision)) => {
                info!(?decision, "user decided");
                decision
            }
            Ok(None) => UserDecision::Degrade,
            Err(_) => {
                info!(
                    secs = self.config.decision_timeout.as_secs(),
                    "no decision in time, degrading"
                );
                UserDecision::Degrade
            }
        }
    }

    fn enter_path(&self, state: &mut RunState, path: RunPath) {
        info!(path = path.as_str(), "run path selected");
        state.path = Some(path);
        self.tracker.emit_progress(&ProgressEvent::PathSelected {
            path: path.as_str().to_string(),
        });
    }

    fn abort(&self, state: &mut RunState, dimensions: &[Dimension]) {
        info!("run aborted by user decision");
        state.outcome = RunOutcome::Aborted;
        for dim in dimensions {
            self.skip(state, &dim.id, REASON_ABORTED);
        }
    }

    // -----------------------------------------------------------------------
    // Degraded path
    // -----------------------------------------------------------------------

    #[instrument(skip_all)]
    async fn run_degraded(&self, state: &mut RunState, dimensions: &[Dimension]) {
        let total = dimensions.len();
        for (index, dim) in dimensions.iter().enumerate() {
            if self.superseded(state).await {
                break;
            }
            if self.skip_resumed(state, dim) {
                continue;
            }
            self.start_dimension(dim, index, total);

            let extracted = stage::attempt(
                Stage::Evidence,
                &dim.id,
                self.supplier
                    .extract(dim, &state.files, &state.targets, &state.pipeline),
            )
            .await;

            match extracted {
                StageOutcome::Done(candidates) | StageOutcome::Recovered { value: candidates, .. } => {
                    self.settle_heuristics(state, dim, candidates, SourceTag::HeuristicOnly, 0)
                        .await;
                }
                StageOutcome::Failed(e) => self.fail_without_evidence(state, dim, &e),
            }

            self.checkpoint(state).await;
        }
    }

    // -----------------------------------------------------------------------
    // AI path
    // -----------------------------------------------------------------------

    #[instrument(skip_all)]
    async fn run_ai(
        &self,
        state: &mut RunState,
        dimensions: &[Dimension],
        agent: Arc<dyn ProductionAgent>,
    ) {
        // --- Phase 2a: signals for every dimension ---
        let mut evidence: BTreeMap<String, Result<SignalExtraction>> = BTreeMap::new();
        for dim in dimensions {
            if self.superseded(state).await {
                return;
            }
            if self.skip_resumed(state, dim) {
                continue;
            }
            let extraction = self.extract_dimension(state, dim).await;
            if let Ok(x) = &extraction {
                self.tracker.emit_progress(&ProgressEvent::SignalsExtracted {
                    dim_id: dim.id.clone(),
                    signals: x.signals.len(),
                    candidates: x.candidates.len(),
                });
            }
            evidence.insert(dim.id.clone(), extraction);
        }

        // --- Phase 2b: production, strictly in order ---
        let total = dimensions.len();
        for (index, dim) in dimensions.iter().enumerate() {
            if self.superseded(state).await {
                return;
            }
            let Some(extraction) = evidence.remove(&dim.id) else {
                continue;
            };
            self.start_dimension(dim, index, total);

            match extraction {
                Err(e) => {
                    state
                        .context
                        .add_dimension_digest(&dim.id, DimensionDigest::failure(&dim.id, &dim.label, &e.to_string()));
                    self.fail_without_evidence(state, dim, &e);
                }
                Ok(x) if x.signals.is_empty() => {
                    debug!(dimension = %dim.id, "no signals, short-circuiting to heuristics");
                    self.settle_heuristics(state, dim, x.candidates, SourceTag::Fallback, 0)
                        .await;
                }
                Ok(x) => self.produce_dimension(state, dim, x, &agent).await,
            }

            self.checkpoint(state).await;
        }
    }

    /// Signals for one dimension; on supplier failure, re-extract raw
    /// candidates so the scanned evidence is kept for heuristic fallback.
    async fn extract_dimension(&self, state: &RunState, dim: &Dimension) -> Result<SignalExtraction> {
        let supplier = &self.supplier;
        let files = &state.files;
        let targets = &state.targets;
        let pipeline = &state.pipeline;

        let outcome = stage::attempt_with_fallback(
            Stage::Signals,
            &dim.id,
            async move {
                let raw = supplier.extract(dim, files, targets, pipeline).await?;
                Ok(extract_signals(dim, raw))
            },
            || async move {
                let raw = supplier.extract(dim, files, targets, pipeline).await?;
                Ok(SignalExtraction {
                    signals: Vec::new(),
                    candidates: raw,
                })
            },
        )
        .await;

        match outcome {
            StageOutcome::Done(x) => Ok(x),
            StageOutcome::Recovered { value, cause } => {
                debug!(dimension = %dim.id, %cause, "kept raw evidence without signals");
                Ok(value)
            }
            StageOutcome::Failed(e) => Err(e),
        }
    }

    async fn produce_dimension(
        &self,
        state: &mut RunState,
        dim: &Dimension,
        extraction: SignalExtraction,
        agent: &Arc<dyn ProductionAgent>,
    ) {
        let signal_count = extraction.signals.len();
        let snapshot = state.context.build_context_for_dimension(&dim.id);
        let budget = compute_budget(dim.output_kind(), signal_count);
        let request = ProductionRequest {
            budget,
            dimension: dim.into(),
            conversation_id: format!("{}:{}", state.session, dim.id),
        };

        info!(
            dimension = %dim.id,
            signals = signal_count,
            max_submits = budget.max_submits,
            "producing dimension"
        );
        self.tracker.emit_progress(&ProgressEvent::ProductionStarted {
            dim_id: dim.id.clone(),
        });

        let call = async {
            let prompt = self
                .prompts
                .build(dim, &extraction.signals, &snapshot, &budget)?;
            self.race(Arc::clone(agent), prompt, request).await
        };

        match stage::attempt(Stage::Production, &dim.id, call).await {
            StageOutcome::Done(reply) | StageOutcome::Recovered { value: reply, .. } => {
                self.on_production_success(state, dim, extraction.candidates, signal_count, reply)
                    .await;
            }
            StageOutcome::Failed(e) => {
                self.on_production_failure(state, dim, extraction.candidates, signal_count, e)
                    .await;
            }
        }
    }

    /// Race the agent call against the production ceiling.
    ///
    /// The call runs on its own task; on timeout that task is left to finish
    /// on its own and whatever it already did stands.
    async fn race(
        &self,
        agent: Arc<dyn ProductionAgent>,
        prompt: String,
        request: ProductionRequest,
    ) -> Result<ProductionReply> {
        let ceiling = self.config.production_timeout;
        let call = tokio::spawn(async move { agent.execute(&prompt, &request).await });

        match tokio::time::timeout(ceiling, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(RepoloreError::Production(format!(
                "production task ended abnormally: {e}"
            ))),
            Err(_) => Err(RepoloreError::Timeout {
                secs: ceiling.as_secs(),
            }),
        }
    }

    async fn on_production_success(
        &self,
        state: &mut RunState,
        dim: &Dimension,
        candidates: Vec<RawCandidate>,
        signals: usize,
        reply: ProductionReply,
    ) {
        let submissions: Vec<CandidateFields> = reply
            .tool_calls
            .iter()
            .filter_map(ToolCall::accepted_submission)
            .collect();
        let submitted = submissions.len();
        let titles: Vec<String> = submissions
            .iter()
            .map(|s| s.display_title().to_string())
            .collect();
        for s in &submissions {
            state.context.add_submitted_candidate(&dim.id, s.info());
        }

        let mut persisted = 0;
        if dim.is_digest_only() {
            if submitted > 0 {
                warn!(dimension = %dim.id, submitted, "digest-only dimension submitted candidates, not persisting");
            }
        } else {
            persisted += self
                .persist_all(state, dim, submissions, SourceTag::Agent)
                .await;
        }

        let digest = parse_digest(&reply.reply).unwrap_or_else(|| {
            debug!(dimension = %dim.id, "no digest in reply, using stub");
            DimensionDigest::stub(&dim.label, titles)
        });
        let digest_summary = digest.summary.clone();
        if let Ok(value) = serde_json::to_value(&digest) {
            state.pipeline.cache_result(&dim.id, DIGEST_RESULT_KEY, value);
        }
        state.context.add_dimension_digest(&dim.id, digest);

        let mut fallback = false;
        if submitted == 0 && !dim.is_digest_only() && !candidates.is_empty() {
            info!(
                dimension = %dim.id,
                heuristics = candidates.len(),
                "agent accepted no candidates, persisting heuristics"
            );
            persisted += self
                .persist_heuristics(state, dim, &candidates, SourceTag::Fallback)
                .await;
            fallback = true;
        }

        let update = TaskUpdate {
            source_count: signals,
            extracted: candidates.len(),
            digest: Some(digest_summary),
            fallback,
            ..Default::default()
        };
        {
            let report = state.report_mut(&dim.id);
            report.signals = signals;
            report.extracted = candidates.len();
            report.submitted = submitted;
            report.persisted = persisted;
            report.fallback = fallback;
        }
        retain(state, dim, candidates);

        if dim.is_digest_only() {
            state.pending.insert(dim.id.clone(), update);
        } else {
            self.complete(state, &dim.id, update);
        }
    }

    async fn on_production_failure(
        &self,
        state: &mut RunState,
        dim: &Dimension,
        candidates: Vec<RawCandidate>,
        signals: usize,
        error: RepoloreError,
    ) {
        if error.is_timeout() {
            warn!(dimension = %dim.id, "production call timed out");
        }
        state.record_error(&dim.id, None, &error);
        let message = error.to_string();

        let persisted = self
            .persist_heuristics(state, dim, &candidates, SourceTag::Fallback)
            .await;
        let digest = DimensionDigest::failure(&dim.id, &dim.label, &message);
        let digest_summary = digest.summary.clone();
        state.context.add_dimension_digest(&dim.id, digest);

        let update = TaskUpdate {
            source_count: signals,
            extracted: candidates.len(),
            digest: Some(digest_summary),
            fallback: persisted > 0,
            error: Some(message),
            ..Default::default()
        };
        {
            let report = state.report_mut(&dim.id);
            report.signals = signals;
            report.extracted = candidates.len();
            report.persisted = persisted;
            report.fallback = persisted > 0;
        }
        retain(state, dim, candidates);
        self.fail(state, &dim.id, update);
    }

    // -----------------------------------------------------------------------
    // Shared dimension steps
    // -----------------------------------------------------------------------

    fn start_dimension(&self, dim: &Dimension, index: usize, total: usize) {
        info!(dimension = %dim.id, index, total, "dimension started");
        self.tracker.mark_task_filling(&dim.id);
        self.tracker.emit_progress(&ProgressEvent::DimensionStarted {
            dim_id: dim.id.clone(),
            index,
            total,
        });
    }

    /// Persist raw candidates without refinement, reserve them for
    /// aggregation, and leave a heuristic digest behind.
    async fn settle_heuristics(
        &self,
        state: &mut RunState,
        dim: &Dimension,
        candidates: Vec<RawCandidate>,
        tag: SourceTag,
        signals: usize,
    ) {
        let extracted = candidates.len();
        if candidates.is_empty() {
            debug!(dimension = %dim.id, "nothing extracted");
            let update = TaskUpdate {
                source_count: signals,
                reason: Some(REASON_EMPTY.into()),
                ..Default::default()
            };
            self.complete(state, &dim.id, update);
            return;
        }

        let persisted = self.persist_heuristics(state, dim, &candidates, tag).await;
        let titles = candidates
            .iter()
            .map(|c| c.display_title().to_string())
            .collect();
        let digest = DimensionDigest::heuristic(&dim.label, titles);
        let digest_summary = digest.summary.clone();
        state.context.add_dimension_digest(&dim.id, digest);

        let fallback = tag == SourceTag::Fallback && persisted > 0;
        let update = TaskUpdate {
            source_count: signals,
            extracted,
            digest: Some(digest_summary),
            fallback,
            ..Default::default()
        };
        {
            let report = state.report_mut(&dim.id);
            report.signals = signals;
            report.extracted = extracted;
            report.persisted = persisted;
            report.fallback = fallback;
        }
        retain(state, dim, candidates);

        if dim.is_digest_only() {
            state.pending.insert(dim.id.clone(), update);
        } else {
            self.complete(state, &dim.id, update);
        }
    }

    /// Persist raw candidates. Digest-only dimensions never persist directly.
    async fn persist_heuristics(
        &self,
        state: &mut RunState,
        dim: &Dimension,
        candidates: &[RawCandidate],
        tag: SourceTag,
    ) -> usize {
        if dim.is_digest_only() {
            debug!(dimension = %dim.id, count = candidates.len(), "reserved for aggregation");
            return 0;
        }
        let fields = candidates.iter().map(CandidateFields::from_raw).collect();
        self.persist_all(state, dim, fields, tag).await
    }

    /// Persist each candidate on its own; failures are recorded and skipped.
    async fn persist_all(
        &self,
        state: &mut RunState,
        dim: &Dimension,
        fields: Vec<CandidateFields>,
        tag: SourceTag,
    ) -> usize {
        let opts = PersistOptions {
            session: state.session.clone(),
            dimension_id: dim.id.clone(),
        };
        let mut persisted = 0;
        for f in &fields {
            match self
                .sink
                .create_from_tool_params(f, tag, &opts, &self.config.actor)
                .await
            {
                Ok(()) => {
                    state.results.created += 1;
                    persisted += 1;
                }
                Err(e) => {
                    warn!(dimension = %dim.id, sub_topic = %f.sub_topic, error = %e, "failed to persist candidate");
                    state.results.failed += 1;
                    state.record_error(&dim.id, Some(&f.sub_topic), &e);
                }
            }
        }
        debug!(dimension = %dim.id, tag = tag.as_str(), persisted, "candidates persisted");
        persisted
    }

    fn fail_without_evidence(&self, state: &mut RunState, dim: &Dimension, error: &RepoloreError) {
        state.record_error(&dim.id, None, error);
        let update = TaskUpdate {
            error: Some(error.to_string()),
            ..Default::default()
        };
        self.fail(state, &dim.id, update);
    }

    // -----------------------------------------------------------------------
    // Task bookkeeping
    // -----------------------------------------------------------------------

    fn complete(&self, state: &mut RunState, dim_id: &str, update: TaskUpdate) {
        self.tracker.mark_task_completed(dim_id, &update);
        let report = state.report_mut(dim_id);
        report.status = DimensionStatus::Completed;
        report.reason = update.reason;
    }

    fn fail(&self, state: &mut RunState, dim_id: &str, update: TaskUpdate) {
        self.tracker.mark_task_failed(dim_id, &update);
        let report = state.report_mut(dim_id);
        report.status = DimensionStatus::Failed;
        report.reason = update.error;
    }

    fn skip(&self, state: &mut RunState, dim_id: &str, reason: &str) {
        self.tracker.mark_task_skipped(dim_id, reason);
        let report = state.report_mut(dim_id);
        report.status = DimensionStatus::Skipped;
        report.reason = Some(reason.to_string());
    }

    /// Mark every dimension that never finished as skipped.
    fn skip_unfinished(&self, state: &mut RunState, reason: &str) {
        state.pending.clear();
        let unfinished: Vec<String> = state
            .reports
            .iter()
            .filter(|r| r.status == DimensionStatus::Pending)
            .map(|r| r.dim_id.clone())
            .collect();
        for dim_id in unfinished {
            self.skip(state, &dim_id, reason);
        }
    }

    fn skip_resumed(&self, state: &mut RunState, dim: &Dimension) -> bool {
        if !self.config.resume || !state.context.has_completed_digest(&dim.id) {
            return false;
        }
        debug!(dimension = %dim.id, "already digested, skipping");
        self.complete(state, &dim.id, TaskUpdate::reason(REASON_RESUMED));
        true
    }

    /// Whether a newer run has taken over this session.
    async fn superseded(&self, state: &mut RunState) -> bool {
        if self.tracker.is_session_valid(&state.session).await {
            return false;
        }
        info!(session = %state.session, "session superseded, stopping");
        state.outcome = RunOutcome::Superseded;
        true
    }

    async fn checkpoint(&self, state: &RunState) {
        match state.context.to_json() {
            Ok(json) => self.tracker.checkpoint(&state.session, &json).await,
            Err(e) => warn!(error = %e, "failed to serialize checkpoint"),
        }
    }

    // -----------------------------------------------------------------------
    // Aggregation
    // -----------------------------------------------------------------------

    #[instrument(skip_all)]
    async fn aggregate(&self, state: &mut RunState, dimensions: &[Dimension]) {
        let mut inputs = Vec::new();
        for dim in dimensions.iter().filter(|d| d.skill_worthy) {
            match state.retained.remove(&dim.id) {
                Some(candidates) => inputs.push(AggregationInput {
                    dimension: dim.clone(),
                    candidates,
                    digest: state.context.digest(&dim.id).map(|s| s.digest.clone()),
                }),
                None => self.resolve_pending(state, &dim.id, REASON_EMPTY, None),
            }
        }

        if inputs.is_empty() {
            debug!("nothing to aggregate");
            return;
        }

        let ids: Vec<String> = inputs.iter().map(|i| i.dimension.id.clone()).collect();
        self.tracker.emit_progress(&ProgressEvent::AggregationStarted {
            dimensions: ids.len(),
        });

        match self.aggregator.aggregate(&state.session, &inputs).await {
            Ok(skills) => {
                info!(skills, dimensions = ids.len(), "aggregation complete");
                for id in &ids {
                    self.resolve_pending(state, id, REASON_AGGREGATED, None);
                }
                state.aggregated = ids;
            }
            Err(e) => {
                error!(error = %e, "aggregation pass failed");
                state.record_error("aggregation", None, &e);
                for id in &ids {
                    self.resolve_pending(state, id, REASON_AGGREGATED, Some(&e));
                }
            }
        }
    }

    /// Settle a digest-only dimension that was waiting for aggregation.
    fn resolve_pending(
        &self,
        state: &mut RunState,
        dim_id: &str,
        reason: &str,
        error: Option<&RepoloreError>,
    ) {
        let Some(mut update) = state.pending.remove(dim_id) else {
            return;
        };
        match error {
            None => {
                update.reason = Some(reason.to_string());
                self.complete(state, dim_id, update);
            }
            Some(e) => {
                update.error = Some(e.to_string());
                self.fail(state, dim_id, update);
            }
        }
    }
}

/// Keep a skill-worthy dimension's raw candidates for the aggregation pass.
fn retain(state: &mut RunState, dim: &Dimension, candidates: Vec<RawCandidate>) {
    if dim.skill_worthy && !candidates.is_empty() {
        state.retained.insert(dim.id.clone(), candidates);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
