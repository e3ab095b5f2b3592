//! Cross-dimension accumulator.
//!
//! Holds the run's immutable project facts plus everything completed
//! dimensions left behind: one digest per dimension and a flat list of
//! submitted candidate summaries. The orchestrator drives dimensions in a
//! fixed order, so a snapshot built for dimension N only ever contains
//! digests of dimensions that ran before it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use repolore_shared::{ProjectFacts, Result};

use crate::digest::DimensionDigest;

/// A digest as stored in the context, stamped with its completion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDigest {
    #[serde(flatten)]
    pub digest: DimensionDigest,
    pub dim_id: String,
    pub completed_at: DateTime<Utc>,
}

/// Summary of an accepted candidate, kept only for de-duplication context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSummary {
    pub dim_id: String,
    pub title: String,
    pub sub_topic: String,
    pub summary: String,
}

/// What a production step reports about one accepted candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateInfo {
    pub title: String,
    pub sub_topic: String,
    pub summary: String,
}

/// Digest fields visible to later dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousDimension {
    pub summary: String,
    pub candidate_count: usize,
    pub key_findings: Vec<String>,
    pub cross_refs: BTreeMap<String, String>,
    pub gaps: Vec<String>,
    pub remaining_tasks: Vec<String>,
}

/// Candidate reference visible to later dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingCandidate {
    pub dim_id: String,
    pub title: String,
    pub sub_topic: String,
}

/// Immutable view of the accumulated state handed to one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub project: ProjectFacts,
    pub previous_dimensions: BTreeMap<String, PreviousDimension>,
    pub existing_candidates: Vec<ExistingCandidate>,
    pub current_dimension: String,
}

/// Serialized form used for checkpoints.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedContext {
    project: ProjectFacts,
    digests: BTreeMap<String, StoredDigest>,
    submitted_candidates: Vec<CandidateSummary>,
}

/// Accumulated knowledge of completed dimensions for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimensionContext {
    project: ProjectFacts,
    digests: BTreeMap<String, StoredDigest>,
    candidates: Vec<CandidateSummary>,
}

impl DimensionContext {
    pub fn new(project: ProjectFacts) -> Self {
        Self {
            project,
            ..Default::default()
        }
    }

    pub fn project(&self) -> &ProjectFacts {
        &self.project
    }

    /// Record a dimension's digest, replacing any earlier one for the same id.
    pub fn add_dimension_digest(&mut self, dim_id: &str, digest: DimensionDigest) {
        self.digests.insert(
            dim_id.to_string(),
            StoredDigest {
                digest,
                dim_id: dim_id.to_string(),
                completed_at: Utc::now(),
            },
        );
    }

    /// Append an accepted candidate.
    ///
    /// Entries are never removed, so re-running a dimension leaves its earlier
    /// entries in place next to the new ones.
    pub fn add_submitted_candidate(&mut self, dim_id: &str, info: CandidateInfo) {
        self.candidates.push(CandidateSummary {
            dim_id: dim_id.to_string(),
            title: info.title,
            sub_topic: info.sub_topic,
            summary: info.summary,
        });
    }

    pub fn digest(&self, dim_id: &str) -> Option<&StoredDigest> {
        self.digests.get(dim_id)
    }

    pub fn has_digest(&self, dim_id: &str) -> bool {
        self.digests.contains_key(dim_id)
    }

    /// Whether `dim_id` has a digest for work that actually finished.
    pub fn has_completed_digest(&self, dim_id: &str) -> bool {
        self.digests.get(dim_id).is_some_and(|s| !s.digest.failed)
    }

    pub fn digests(&self) -> &BTreeMap<String, StoredDigest> {
        &self.digests
    }

    pub fn submitted_candidates(&self) -> &[CandidateSummary] {
        &self.candidates
    }

    /// Build the snapshot handed to `current_dim_id`'s production step.
    ///
    /// The current dimension's own earlier digest (from a re-run) is not
    /// listed among the previous dimensions.
    pub fn build_context_for_dimension(&self, current_dim_id: &str) -> ContextSnapshot {
        let previous_dimensions = self
            .digests
            .iter()
            .filter(|(id, _)| id.as_str() != current_dim_id)
            .map(|(id, stored)| {
                let d = &stored.digest;
                (
                    id.clone(),
                    PreviousDimension {
                        summary: d.summary.clone(),
                        candidate_count: d.candidate_count,
                        key_findings: d.key_findings.clone(),
                        cross_refs: d.cross_refs.clone(),
                        gaps: d.gaps.clone(),
                        remaining_tasks: d.remaining_tasks.clone(),
                    },
                )
            })
            .collect();

        let existing_candidates = self
            .candidates
            .iter()
            .map(|c| ExistingCandidate {
                dim_id: c.dim_id.clone(),
                title: c.title.clone(),
                sub_topic: c.sub_topic.clone(),
            })
            .collect();

        ContextSnapshot {
            project: self.project.clone(),
            previous_dimensions,
            existing_candidates,
            current_dimension: current_dim_id.to_string(),
        }
    }

    /// Serialize the full digest map and candidate list.
    pub fn to_json(&self) -> Result<String> {
        let persisted = PersistedContext {
            project: self.project.clone(),
            digests: self.digests.clone(),
            submitted_candidates: self.candidates.clone(),
        };
        Ok(serde_json::to_string(&persisted)?)
    }

    /// Restore a context written by [`DimensionContext::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        let persisted: PersistedContext = serde_json::from_str(json)?;
        Ok(Self {
            project: persisted.project,
            digests: persisted.digests,
            candidates: persisted.submitted_candidates,
        })
    }
}
