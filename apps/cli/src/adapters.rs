//! CLI implementations of the orchestrator's collaborators.
//!
//! Evidence comes from a pre-computed scan file, candidates and skills go to
//! libSQL storage, and progress is rendered with an indicatif spinner.

use std::collections::{BTreeMap, HashSet};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use repolore_core::collaborators::{
    AggregationInput, CandidateFields, CandidateSink, EvidenceSupplier, PersistOptions,
    ProgressEvent, SkillAggregator, SourceTag, TaskTracker, TaskUpdate, UserDecision,
};
use repolore_core::digest::DimensionDigest;
use repolore_core::pipeline_context::PipelineContext;
use repolore_shared::{
    Dimension, FileSet, ProjectFacts, RawCandidate, RepoloreError, Result, SessionId, TargetMap,
    default_dimensions,
};
use repolore_storage::{NewCandidate, Storage};

// ---------------------------------------------------------------------------
// Scan file
// ---------------------------------------------------------------------------

/// Pre-computed scanner output for one project.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ScanFile {
    pub project: ProjectFacts,
    /// Overrides the built-in catalog when present.
    #[serde(default)]
    pub dimensions: Option<Vec<Dimension>>,
    #[serde(default)]
    pub files: FileSet,
    #[serde(default)]
    pub targets: TargetMap,
    #[serde(default)]
    pub evidence: BTreeMap<String, Vec<RawCandidate>>,
}

impl ScanFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RepoloreError::io(path, e))?;
        Self::parse(&content)
    }

    pub fn parse(json: &str) -> Result<Self> {
        let scan: Self = serde_json::from_str(json)?;
        scan.validate()?;
        Ok(scan)
    }

    fn validate(&self) -> Result<()> {
        let Some(dimensions) = &self.dimensions else {
            return Ok(());
        };
        if dimensions.is_empty() {
            return Err(RepoloreError::validation("scan file lists no dimensions"));
        }
        let mut seen = HashSet::new();
        for dim in dimensions {
            if dim.id.trim().is_empty() {
                return Err(RepoloreError::validation("dimension with empty id"));
            }
            if !seen.insert(dim.id.as_str()) {
                return Err(RepoloreError::validation(format!(
                    "duplicate dimension id '{}'",
                    dim.id
                )));
            }
        }
        Ok(())
    }

    /// The run's dimension list, falling back to the built-in catalog.
    pub fn resolved_dimensions(&self) -> Vec<Dimension> {
        self.dimensions.clone().unwrap_or_else(default_dimensions)
    }

    /// Evidence entries that no dimension of the run will ask for.
    pub fn orphaned_evidence(&self) -> Vec<String> {
        let dims = self.resolved_dimensions();
        self.evidence
            .keys()
            .filter(|id| !dims.iter().any(|d| &d.id == *id))
            .cloned()
            .collect()
    }
}

/// [`EvidenceSupplier`] serving a scan file's stored candidates.
pub(crate) struct ScanFileSupplier {
    evidence: BTreeMap<String, Vec<RawCandidate>>,
}

impl ScanFileSupplier {
    pub fn new(evidence: BTreeMap<String, Vec<RawCandidate>>) -> Self {
        Self { evidence }
    }
}

#[async_trait]
impl EvidenceSupplier for ScanFileSupplier {
    async fn extract(
        &self,
        dimension: &Dimension,
        _files: &FileSet,
        _targets: &TargetMap,
        context: &PipelineContext,
    ) -> Result<Vec<RawCandidate>> {
        let key = format!("scan-evidence:{}", dimension.id);
        let candidates = context.get_or_compute(&key, || {
            self.evidence
                .get(&dimension.id)
                .cloned()
                .unwrap_or_default()
        });
        debug!(dimension = %dimension.id, candidates = candidates.len(), "evidence loaded");
        Ok(candidates.as_ref().clone())
    }
}

// ---------------------------------------------------------------------------
// Storage-backed sink and aggregator
// ---------------------------------------------------------------------------

/// [`CandidateSink`] writing to the `candidates` table.
pub(crate) struct StorageSink {
    storage: Arc<Storage>,
}

impl StorageSink {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl CandidateSink for StorageSink {
    async fn create_from_tool_params(
        &self,
        fields: &CandidateFields,
        source: SourceTag,
        opts: &PersistOptions,
        actor: &str,
    ) -> Result<()> {
        let candidate = NewCandidate {
            session_id: opts.session.to_string(),
            dimension_id: opts.dimension_id.clone(),
            source: source.as_str().to_string(),
            title: fields.display_title().to_string(),
            sub_topic: fields.sub_topic.clone(),
            summary: fields.summary.clone(),
            code: fields.code.clone(),
            language: fields.language.clone(),
            knowledge_type: fields.knowledge_type.clone(),
            tags: fields.tags.clone(),
            sources: fields.sources.clone(),
            actor: actor.to_string(),
        };
        self.storage
            .insert_candidate(&candidate)
            .await
            .map_err(|e| match e {
                RepoloreError::Persistence(_) => e,
                other => RepoloreError::Persistence(other.to_string()),
            })?;
        Ok(())
    }
}

/// Stored payload of one aggregated dimension.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SkillBundle<'a> {
    dimension: &'a str,
    label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<&'a DimensionDigest>,
    candidates: &'a [RawCandidate],
}

/// [`SkillAggregator`] writing one JSON bundle per dimension to `skills`.
pub(crate) struct StorageAggregator {
    storage: Arc<Storage>,
}

impl StorageAggregator {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl SkillAggregator for StorageAggregator {
    async fn aggregate(&self, session: &SessionId, inputs: &[AggregationInput]) -> Result<usize> {
        let session_id = session.to_string();
        for input in inputs {
            let bundle = SkillBundle {
                dimension: &input.dimension.id,
                label: &input.dimension.label,
                digest: input.digest.as_ref(),
                candidates: &input.candidates,
            };
            let payload = serde_json::to_string(&bundle)?;
            self.storage
                .upsert_skill(&session_id, &input.dimension.id, &payload)
                .await
                .map_err(|e| RepoloreError::Aggregation(e.to_string()))?;
        }
        Ok(inputs.len())
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// [`TaskTracker`] rendering progress on a spinner and writing checkpoints.
pub(crate) struct CliTracker {
    spinner: ProgressBar,
    storage: Arc<Storage>,
}

impl CliTracker {
    pub fn new(storage: Arc<Storage>, quiet: bool) -> Self {
        let spinner = if quiet {
            ProgressBar::hidden()
        } else {
            let spinner = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
                spinner.set_style(
                    style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
                );
            }
            spinner.enable_steady_tick(Duration::from_millis(80));
            spinner
        };
        Self { spinner, storage }
    }

    pub fn finish(&self) {
        self.spinner.finish_and_clear();
    }

    fn line(&self, msg: String) {
        self.spinner.println(msg);
    }
}

#[async_trait]
impl TaskTracker for CliTracker {
    fn mark_task_filling(&self, dim_id: &str) {
        self.spinner.set_message(format!("{dim_id}: working"));
    }

    fn mark_task_completed(&self, dim_id: &str, update: &TaskUpdate) {
        let note = match (&update.reason, update.fallback) {
            (Some(reason), _) => format!(" ({reason})"),
            (None, true) => " (fallback)".to_string(),
            (None, false) => String::new(),
        };
        self.line(format!(
            "  ✓ {dim_id}: {} source(s), {} extracted{note}",
            update.source_count, update.extracted
        ));
    }

    fn mark_task_failed(&self, dim_id: &str, update: &TaskUpdate) {
        let error = update.error.as_deref().unwrap_or("unknown error");
        self.line(format!("  ✗ {dim_id}: {error}"));
    }

    fn mark_task_skipped(&self, dim_id: &str, reason: &str) {
        self.line(format!("  - {dim_id}: skipped ({reason})"));
    }

    fn emit_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::AgentUnavailable => {
                self.line("  ! no production agent available".to_string());
            }
            ProgressEvent::PathSelected { path } => {
                self.spinner.set_message(format!("running {path} path"));
            }
            ProgressEvent::DimensionStarted {
                dim_id,
                index,
                total,
            } => {
                self.spinner
                    .set_message(format!("[{}/{total}] {dim_id}", index + 1));
            }
            ProgressEvent::SignalsExtracted {
                dim_id, signals, ..
            } => {
                self.spinner
                    .set_message(format!("{dim_id}: {signals} signal(s)"));
            }
            ProgressEvent::ProductionStarted { dim_id } => {
                self.spinner.set_message(format!("{dim_id}: producing"));
            }
            ProgressEvent::AggregationStarted { dimensions } => {
                self.spinner
                    .set_message(format!("aggregating {dimensions} dimension(s)"));
            }
            ProgressEvent::RunFinished { outcome } => {
                self.spinner.set_message(format!("run {outcome}"));
            }
        }
    }

    async fn wait_for_user_decision(
        &self,
        _session: &SessionId,
        message: &str,
    ) -> Option<UserDecision> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let prompt = prompt_line(message);

        // A detached thread, so an unanswered prompt never holds up shutdown.
        self.spinner.suspend(|| {
            eprint!("{prompt}");
            let _ = std::io::stderr().flush();
        });
        std::thread::spawn(move || {
            let mut answer = String::new();
            let decision = match std::io::stdin().lock().read_line(&mut answer) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(parse_answer(&answer)),
            };
            let _ = tx.send(decision);
        });

        rx.await.ok().flatten()
    }

    async fn checkpoint(&self, session: &SessionId, snapshot: &str) {
        if let Err(e) = self
            .storage
            .save_checkpoint(&session.to_string(), snapshot)
            .await
        {
            warn!(session = %session, error = %e, "failed to save checkpoint");
        }
    }
}

/// `y`/`yes` degrades; anything else aborts.
/// The orchestrator's message already ends in its question; only the choices
/// are added.
fn prompt_line(message: &str) -> String {
    format!("{} [Y/n] ", message.trim_end())
}

/// Degrading is the default; only an explicit no aborts.
fn parse_answer(answer: &str) -> UserDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "n" | "no" => UserDecision::Abort,
        _ => UserDecision::Degrade,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repolore_shared::OutputKind;
    use uuid::Uuid;

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("repolore_cli_test_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    const SCAN: &str = r#"{
        "project": { "name": "Demo", "primaryLanguage": "objc" },
        "dimensions": [
            { "id": "code-standard", "label": "Code standards" },
            { "id": "agent-guidelines", "label": "Guidelines", "skillWorthy": true }
        ],
        "evidence": {
            "code-standard": [
                { "subTopic": "naming", "summary": "XY prefix in 12 files", "sources": ["a.m"] }
            ],
            "legacy": []
        }
    }"#;

    #[test]
    fn scan_file_parses() {
        let scan = ScanFile::parse(SCAN).expect("parse");
        assert_eq!(scan.project.name, "Demo");
        let dims = scan.resolved_dimensions();
        assert_eq!(dims.len(), 2);
        assert_eq!(dims[1].output_kind(), OutputKind::DigestOnly);
        assert_eq!(scan.evidence["code-standard"][0].sub_topic, "naming");
        assert_eq!(scan.orphaned_evidence(), vec!["legacy".to_string()]);
    }

    #[test]
    fn scan_file_without_dimensions_uses_catalog() {
        let scan = ScanFile::parse(r#"{ "project": { "name": "Demo" } }"#).expect("parse");
        assert_eq!(scan.resolved_dimensions(), default_dimensions());
        assert!(scan.evidence.is_empty());
    }

    #[test]
    fn duplicate_dimension_ids_rejected() {
        let json = r#"{
            "project": { "name": "Demo" },
            "dimensions": [ { "id": "a", "label": "A" }, { "id": "a", "label": "A again" } ]
        }"#;
        let err = ScanFile::parse(json).unwrap_err();
        assert!(err.to_string().contains("duplicate dimension id 'a'"));
    }

    #[tokio::test]
    async fn supplier_is_repeatable() {
        let scan = ScanFile::parse(SCAN).expect("parse");
        let dims = scan.resolved_dimensions();
        let supplier = ScanFileSupplier::new(scan.evidence);
        let ctx = PipelineContext::new();

        let first = supplier
            .extract(&dims[0], &Vec::new(), &TargetMap::new(), &ctx)
            .await
            .expect("extract");
        let second = supplier
            .extract(&dims[0], &Vec::new(), &TargetMap::new(), &ctx)
            .await
            .expect("extract again");
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);

        let none = supplier
            .extract(&dims[1], &Vec::new(), &TargetMap::new(), &ctx)
            .await
            .expect("extract missing");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn sink_writes_and_reports_duplicates() {
        let storage = test_storage().await;
        let sink = StorageSink::new(storage.clone());
        let session = SessionId::new();
        let opts = PersistOptions {
            session: session.clone(),
            dimension_id: "code-standard".into(),
        };
        let fields = CandidateFields {
            sub_topic: "naming".into(),
            summary: "XY prefix".into(),
            ..Default::default()
        };

        sink.create_from_tool_params(&fields, SourceTag::Fallback, &opts, "tester")
            .await
            .expect("first write");
        let err = sink
            .create_from_tool_params(&fields, SourceTag::Fallback, &opts, "tester")
            .await
            .unwrap_err();
        assert!(matches!(err, RepoloreError::Persistence(_)));

        let stored = storage
            .list_candidates(&session.to_string())
            .await
            .expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "naming");
        assert_eq!(stored[0].source, "fallback");
        assert_eq!(stored[0].actor, "tester");
    }

    #[tokio::test]
    async fn aggregator_stores_one_bundle_per_dimension() {
        let storage = test_storage().await;
        let aggregator = StorageAggregator::new(storage.clone());
        let session = SessionId::new();
        let dimension = Dimension {
            id: "agent-guidelines".into(),
            label: "Guidelines".into(),
            guide: String::new(),
            skill_worthy: true,
            dual_output: false,
            knowledge_types: vec![],
        };
        let inputs = vec![AggregationInput {
            dimension,
            candidates: vec![RawCandidate {
                sub_topic: "review".into(),
                ..Default::default()
            }],
            digest: Some(DimensionDigest {
                summary: "rules".into(),
                ..Default::default()
            }),
        }];

        let written = aggregator.aggregate(&session, &inputs).await.expect("aggregate");
        assert_eq!(written, 1);

        let skills = storage.list_skills(&session.to_string()).await.expect("list");
        assert_eq!(skills.len(), 1);
        let payload: serde_json::Value = serde_json::from_str(&skills[0].1).expect("json");
        assert_eq!(payload["dimension"], "agent-guidelines");
        assert_eq!(payload["digest"]["summary"], "rules");
        assert_eq!(payload["candidates"][0]["subTopic"], "review");
    }

    #[tokio::test]
    async fn tracker_checkpoints_to_storage() {
        let storage = test_storage().await;
        let tracker = CliTracker::new(storage.clone(), true);
        let session = SessionId::new();

        tracker.checkpoint(&session, r#"{"project":{}}"#).await;
        let cp = storage
            .get_checkpoint(&session.to_string())
            .await
            .expect("get")
            .expect("saved");
        assert_eq!(cp.snapshot_json, r#"{"project":{}}"#);
        tracker.finish();
    }

    #[test]
    fn answers_map_to_decisions() {
        assert_eq!(parse_answer("y\n"), UserDecision::Degrade);
        assert_eq!(parse_answer(" YES "), UserDecision::Degrade);
        assert_eq!(parse_answer("\n"), UserDecision::Degrade);
        assert_eq!(parse_answer(""), UserDecision::Degrade);
        assert_eq!(parse_answer("n\n"), UserDecision::Abort);
        assert_eq!(parse_answer(" No "), UserDecision::Abort);
    }

    #[test]
    fn prompt_asks_a_single_question() {
        let line = prompt_line("No production agent is available. Continue with heuristic-only extraction?");
        assert_eq!(
            line,
            "No production agent is available. Continue with heuristic-only extraction? [Y/n] "
        );
        assert_eq!(line.matches('?').count(), 1);
    }
}
