//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding persisted
//! candidates, aggregated skill bundles, and dimension-context checkpoints.
//!
//! **Access rules:**
//! - `repolore run`: read-write (sole writer) via [`Storage::open`]
//! - listing / inspection commands: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Row, params};
use repolore_shared::{RepoloreError, Result};
use sha2::{Digest, Sha256};
use uuid::Uuid;

fn storage_err(e: impl std::fmt::Display) -> RepoloreError {
    RepoloreError::Storage(e.to_string())
}

/// A candidate about to be written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewCandidate {
    pub session_id: String,
    pub dimension_id: String,
    /// Provenance tag (`agent`, `heuristic-only`, `fallback`).
    pub source: String,
    pub title: String,
    pub sub_topic: String,
    pub summary: String,
    pub code: String,
    pub language: String,
    pub knowledge_type: String,
    pub tags: Vec<String>,
    pub sources: Vec<String>,
    pub actor: String,
}

impl NewCandidate {
    /// SHA-256 over the fields that make two candidates the same knowledge.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            &self.dimension_id,
            &self.title,
            &self.sub_topic,
            &self.summary,
            &self.code,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A candidate as read back from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCandidate {
    pub id: String,
    pub session_id: String,
    pub dimension_id: String,
    pub source: String,
    pub title: String,
    pub sub_topic: String,
    pub summary: String,
    pub code: String,
    pub language: String,
    pub knowledge_type: String,
    pub tags: Vec<String>,
    pub sources: Vec<String>,
    pub actor: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A saved dimension-context snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub session_id: String,
    pub snapshot_json: String,
    pub updated_at: DateTime<Utc>,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RepoloreError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RepoloreError::Storage(format!(
                "database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        RepoloreError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(RepoloreError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Candidate operations
    // -----------------------------------------------------------------------

    /// Insert a candidate and return its id.
    ///
    /// A candidate whose content hash already exists in the same session is
    /// rejected with a persistence error.
    pub async fn insert_candidate(&self, candidate: &NewCandidate) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let hash = candidate.content_hash();
        let now = Utc::now().to_rfc3339();
        let tags = serde_json::to_string(&candidate.tags)?;
        let sources = serde_json::to_string(&candidate.sources)?;

        let inserted = self
            .conn
            .execute(
                "INSERT INTO candidates (id, session_id, dimension_id, source, title, sub_topic,
                    summary, code, language, knowledge_type, tags_json, sources_json, actor,
                    content_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(session_id, content_hash) DO NOTHING",
                params![
                    id.as_str(),
                    candidate.session_id.as_str(),
                    candidate.dimension_id.as_str(),
                    candidate.source.as_str(),
                    candidate.title.as_str(),
                    candidate.sub_topic.as_str(),
                    candidate.summary.as_str(),
                    candidate.code.as_str(),
                    candidate.language.as_str(),
                    candidate.knowledge_type.as_str(),
                    tags.as_str(),
                    sources.as_str(),
                    candidate.actor.as_str(),
                    hash.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;

        if inserted == 0 {
            return Err(RepoloreError::Persistence(format!(
                "duplicate candidate '{}' in {}",
                candidate.title, candidate.dimension_id
            )));
        }
        Ok(id)
    }

    /// List a session's candidates in insertion order.
    pub async fn list_candidates(&self, session_id: &str) -> Result<Vec<StoredCandidate>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, session_id, dimension_id, source, title, sub_topic, summary, code,
                        language, knowledge_type, tags_json, sources_json, actor, content_hash,
                        created_at
                 FROM candidates WHERE session_id = ?1 ORDER BY id",
                params![session_id],
            )
            .await
            .map_err(storage_err)?;

        let mut candidates = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            candidates.push(row_to_candidate(&row)?);
        }
        Ok(candidates)
    }

    /// Candidate counts per dimension and source tag for a session.
    pub async fn candidate_counts(&self, session_id: &str) -> Result<Vec<(String, String, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT dimension_id, source, COUNT(*) FROM candidates
                 WHERE session_id = ?1
                 GROUP BY dimension_id, source
                 ORDER BY dimension_id, source",
                params![session_id],
            )
            .await
            .map_err(storage_err)?;

        let mut counts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            counts.push((
                row.get::<String>(0).map_err(storage_err)?,
                row.get::<String>(1).map_err(storage_err)?,
                row.get::<u64>(2).map_err(storage_err)?,
            ));
        }
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Skill operations
    // -----------------------------------------------------------------------

    /// Store (or replace) the aggregated bundle of one dimension.
    pub async fn upsert_skill(
        &self,
        session_id: &str,
        dimension_id: &str,
        payload_json: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO skills (session_id, dimension_id, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id, dimension_id) DO UPDATE SET
                   payload_json = excluded.payload_json,
                   created_at = excluded.created_at",
                params![session_id, dimension_id, payload_json, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// List a session's skills as `(dimension_id, payload_json)`.
    pub async fn list_skills(&self, session_id: &str) -> Result<Vec<(String, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT dimension_id, payload_json FROM skills
                 WHERE session_id = ?1 ORDER BY dimension_id",
                params![session_id],
            )
            .await
            .map_err(storage_err)?;

        let mut skills = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            skills.push((
                row.get::<String>(0).map_err(storage_err)?,
                row.get::<String>(1).map_err(storage_err)?,
            ));
        }
        Ok(skills)
    }

    // -----------------------------------------------------------------------
    // Checkpoint operations
    // -----------------------------------------------------------------------

    /// Save the latest dimension-context snapshot of a session.
    pub async fn save_checkpoint(&self, session_id: &str, snapshot_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO checkpoints (session_id, snapshot_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET
                   snapshot_json = excluded.snapshot_json,
                   updated_at = excluded.updated_at",
                params![session_id, snapshot_json, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn get_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let mut rows = self
            .conn
            .query(
                "SELECT session_id, snapshot_json, updated_at FROM checkpoints
                 WHERE session_id = ?1",
                params![session_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(Checkpoint {
                session_id: row.get::<String>(0).map_err(storage_err)?,
                snapshot_json: row.get::<String>(1).map_err(storage_err)?,
                updated_at: parse_timestamp(&row.get::<String>(2).map_err(storage_err)?)?,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Sessions with a checkpoint, most recently updated first.
    pub async fn list_checkpoints(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT session_id, updated_at FROM checkpoints ORDER BY updated_at DESC",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut sessions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            sessions.push((
                row.get::<String>(0).map_err(storage_err)?,
                parse_timestamp(&row.get::<String>(1).map_err(storage_err)?)?,
            ));
        }
        Ok(sessions)
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepoloreError::Storage(format!("invalid date: {e}")))
}

fn parse_list(json: &str) -> Result<Vec<String>> {
    Ok(serde_json::from_str(json)?)
}

/// Convert a database row to a [`StoredCandidate`].
fn row_to_candidate(row: &Row) -> Result<StoredCandidate> {
    Ok(StoredCandidate {
        id: row.get::<String>(0).map_err(storage_err)?,
        session_id: row.get::<String>(1).map_err(storage_err)?,
        dimension_id: row.get::<String>(2).map_err(storage_err)?,
        source: row.get::<String>(3).map_err(storage_err)?,
        title: row.get::<String>(4).map_err(storage_err)?,
        sub_topic: row.get::<String>(5).map_err(storage_err)?,
        summary: row.get::<String>(6).map_err(storage_err)?,
        code: row.get::<String>(7).map_err(storage_err)?,
        language: row.get::<String>(8).map_err(storage_err)?,
        knowledge_type: row.get::<String>(9).map_err(storage_err)?,
        tags: parse_list(&row.get::<String>(10).map_err(storage_err)?)?,
        sources: parse_list(&row.get::<String>(11).map_err(storage_err)?)?,
        actor: row.get::<String>(12).map_err(storage_err)?,
        content_hash: row.get::<String>(13).map_err(storage_err)?,
        created_at: parse_timestamp(&row.get::<String>(14).map_err(storage_err)?)?,
    })
}
