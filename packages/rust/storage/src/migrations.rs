//! SQL migration definitions for the repolore database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: candidates, skills, checkpoints",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Persisted knowledge candidates
CREATE TABLE IF NOT EXISTS candidates (
    id             TEXT PRIMARY KEY,
    session_id     TEXT NOT NULL,
    dimension_id   TEXT NOT NULL,
    source         TEXT NOT NULL,
    title          TEXT NOT NULL,
    sub_topic      TEXT NOT NULL,
    summary        TEXT NOT NULL,
    code           TEXT NOT NULL,
    language       TEXT NOT NULL,
    knowledge_type TEXT NOT NULL,
    tags_json      TEXT NOT NULL,
    sources_json   TEXT NOT NULL,
    actor          TEXT NOT NULL,
    content_hash   TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    UNIQUE(session_id, content_hash)
);

CREATE INDEX IF NOT EXISTS idx_candidates_session ON candidates(session_id);
CREATE INDEX IF NOT EXISTS idx_candidates_dimension ON candidates(session_id, dimension_id);

-- Aggregated skill bundles, one per dimension per session
CREATE TABLE IF NOT EXISTS skills (
    session_id   TEXT NOT NULL,
    dimension_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (session_id, dimension_id)
);

-- Latest dimension-context snapshot per session
CREATE TABLE IF NOT EXISTS checkpoints (
    session_id    TEXT PRIMARY KEY,
    snapshot_json TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
