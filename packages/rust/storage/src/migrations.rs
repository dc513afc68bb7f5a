//! SQL migration definitions for the admitsync database.
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
            description: "Initial schema: institutions, programs, candidates, combination_ranks",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Institutions, keyed by their catalog code
CREATE TABLE IF NOT EXISTS institutions (
    code        TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    full_name   TEXT,
    location    TEXT,
    category    TEXT,
    website     TEXT,
    description TEXT,
    quota       INTEGER,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- Programs, owned by one institution; identity within it is (name, note)
CREATE TABLE IF NOT EXISTS programs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    institution_code TEXT NOT NULL REFERENCES institutions(code) ON DELETE CASCADE,
    position         INTEGER NOT NULL DEFAULT 0,
    name             TEXT NOT NULL,
    note             TEXT NOT NULL DEFAULT '',
    code             TEXT,
    combinations     TEXT,
    method           TEXT,
    scores_json      TEXT NOT NULL DEFAULT '{}',
    quota            INTEGER,
    UNIQUE(institution_code, name, note)
);

CREATE INDEX IF NOT EXISTS idx_programs_institution ON programs(institution_code);

-- Exam candidates, keyed by candidate number
CREATE TABLE IF NOT EXISTS candidates (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    number        TEXT NOT NULL UNIQUE,
    region        TEXT NOT NULL,
    exam_year     INTEGER NOT NULL,
    scores_json   TEXT NOT NULL,
    eligible_json TEXT NOT NULL DEFAULT '[]',
    provenance    TEXT NOT NULL,
    fetched_at    TEXT NOT NULL
);

-- Per-combination ranking facts; replaced wholesale with their candidate
CREATE TABLE IF NOT EXISTS combination_ranks (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    candidate_id        INTEGER NOT NULL REFERENCES candidates(id) ON DELETE CASCADE,
    combination         TEXT NOT NULL,
    total_score         REAL NOT NULL,
    rank_position       INTEGER NOT NULL,
    candidates_at_score INTEGER,
    candidates_above    INTEGER,
    total_candidates    INTEGER NOT NULL,
    percentile          REAL NOT NULL,
    estimated           INTEGER NOT NULL DEFAULT 1,
    UNIQUE(candidate_id, combination)
);

CREATE INDEX IF NOT EXISTS idx_ranks_candidate ON combination_ranks(candidate_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Batch crawl run history",
            sql: r#"
CREATE TABLE IF NOT EXISTS crawl_runs (
    id          TEXT PRIMARY KEY,
    mode_json   TEXT NOT NULL,
    status      TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

CREATE INDEX IF NOT EXISTS idx_crawl_runs_started ON crawl_runs(started_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
