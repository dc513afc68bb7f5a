//! libSQL storage layer for institutions, programs, candidates and crawl runs.
//!
//! The [`Storage`] struct wraps a local libSQL database. Reads go straight to
//! the shared connection. Every write takes a single write lock, and
//! multi-statement writes run in a transaction under it, so a write never
//! lands inside another task's transaction.

mod migrations;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use admitsync_shared::{
    AdmitError, Candidate, Combination, CombinationRank, Institution, Program, Provenance, Result,
    Subject,
};
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    write_lock: Mutex<()>,
}

/// Listing row for the institution query hook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstitutionSummary {
    pub code: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub program_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// One row of batch crawl history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlRunRecord {
    pub id: String,
    pub mode_json: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats_json: Option<String>,
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| AdmitError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(AdmitError::storage)?;
        let conn = db.connect().map_err(AdmitError::storage)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .await
            .map_err(AdmitError::storage)?;

        let storage = Self {
            db,
            conn,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        debug!(path = %path.display(), "storage opened");
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        AdmitError::Storage(format!("migration v{} failed: {e}", migration.version))
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

    // -----------------------------------------------------------------------
    // Institutions
    // -----------------------------------------------------------------------

    #[cfg(test)]
    async fn institution_exists(&self, code: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM institutions WHERE code = ?1", params![code])
            .await
            .map_err(AdmitError::storage)?;
        Ok(matches!(rows.next().await, Ok(Some(_))))
    }

    /// Every stored institution code.
    pub async fn existing_codes(&self) -> Result<HashSet<String>> {
        let mut rows = self
            .conn
            .query("SELECT code FROM institutions", params![])
            .await
            .map_err(AdmitError::storage)?;

        let mut codes = HashSet::new();
        while let Ok(Some(row)) = rows.next().await {
            codes.insert(row.get::<String>(0).map_err(AdmitError::storage)?);
        }
        Ok(codes)
    }

    /// Load an institution with its programs in stored order.
    pub async fn get_institution(&self, code: &str) -> Result<Option<Institution>> {
        let mut rows = self
            .conn
            .query(
                "SELECT code, name, full_name, location, category, website, description, quota,
                        created_at, updated_at
                 FROM institutions WHERE code = ?1",
                params![code],
            )
            .await
            .map_err(AdmitError::storage)?;

        let mut institution = match rows.next().await {
            Ok(Some(row)) => row_to_institution(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(AdmitError::storage(e)),
        };
        institution.programs = self.programs_of(code).await?;
        Ok(Some(institution))
    }

    async fn programs_of(&self, code: &str) -> Result<Vec<Program>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, institution_code, name, note, code, combinations, method, scores_json, quota
                 FROM programs WHERE institution_code = ?1
                 ORDER BY position, id",
                params![code],
            )
            .await
            .map_err(AdmitError::storage)?;

        let mut programs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            programs.push(row_to_program(&row)?);
        }
        Ok(programs)
    }

    /// Summaries of every institution, ordered by code.
    pub async fn list_institutions(&self) -> Result<Vec<InstitutionSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT i.code, i.name, i.location, i.category, i.updated_at, COUNT(p.id)
                 FROM institutions i
                 LEFT JOIN programs p ON p.institution_code = i.code
                 GROUP BY i.code
                 ORDER BY i.code",
                params![],
            )
            .await
            .map_err(AdmitError::storage)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(InstitutionSummary {
                code: row.get::<String>(0).map_err(AdmitError::storage)?,
                name: row.get::<String>(1).map_err(AdmitError::storage)?,
                location: row.get::<String>(2).ok(),
                category: row.get::<String>(3).ok(),
                updated_at: parse_ts(&row.get::<String>(4).map_err(AdmitError::storage)?)?,
                program_count: row.get::<u32>(5).unwrap_or(0),
            });
        }
        Ok(results)
    }

    /// Persist a reconciled institution.
    ///
    /// The entity row is upserted (`created_at` survives updates). Programs
    /// carrying a stored id are updated in place, programs without one are
    /// inserted, and stored programs absent from `institution` are deleted.
    /// Returns the institution as stored, with ids and timestamps.
    pub async fn save_institution(&self, institution: &Institution) -> Result<Institution> {
        {
            let _guard = self.write_lock.lock().await;
            let tx = self.conn.transaction().await.map_err(AdmitError::storage)?;
            match write_institution(&tx, institution).await {
                Ok(()) => tx.commit().await.map_err(AdmitError::storage)?,
                Err(e) => {
                    if let Err(rb) = tx.rollback().await {
                        warn!(error = %rb, "rollback failed");
                    }
                    return Err(e);
                }
            }
        }

        self.get_institution(&institution.code).await?.ok_or_else(|| {
            AdmitError::Storage(format!("institution {} missing after save", institution.code))
        })
    }

    // -----------------------------------------------------------------------
    // Candidates
    // -----------------------------------------------------------------------

    pub async fn get_candidate(&self, number: &str) -> Result<Option<Candidate>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, number, region, exam_year, scores_json, eligible_json, provenance, fetched_at
                 FROM candidates WHERE number = ?1",
                params![number],
            )
            .await
            .map_err(AdmitError::storage)?;

        let (id, mut candidate) = match rows.next().await {
            Ok(Some(row)) => row_to_candidate(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(AdmitError::storage(e)),
        };

        let mut rows = self
            .conn
            .query(
                "SELECT combination, total_score, rank_position, candidates_at_score,
                        candidates_above, total_candidates, percentile, estimated
                 FROM combination_ranks WHERE candidate_id = ?1 ORDER BY id",
                params![id],
            )
            .await
            .map_err(AdmitError::storage)?;
        while let Ok(Some(row)) = rows.next().await {
            candidate.rankings.push(row_to_rank(&row)?);
        }

        Ok(Some(candidate))
    }

    /// Replace a candidate and all of its rankings in one transaction.
    pub async fn replace_candidate(&self, candidate: &Candidate) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(AdmitError::storage)?;
        match write_candidate(&tx, candidate).await {
            Ok(()) => {
                tx.commit().await.map_err(AdmitError::storage)?;
                debug!(
                    number = %candidate.number,
                    rankings = candidate.rankings.len(),
                    "candidate stored"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Delete a candidate and its rankings. Returns whether a row existed.
    pub async fn delete_candidate(&self, number: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "DELETE FROM combination_ranks
                 WHERE candidate_id IN (SELECT id FROM candidates WHERE number = ?1)",
                params![number],
            )
            .await
            .map_err(AdmitError::storage)?;
        let affected = self
            .conn
            .execute("DELETE FROM candidates WHERE number = ?1", params![number])
            .await
            .map_err(AdmitError::storage)?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Crawl runs
    // -----------------------------------------------------------------------

    pub async fn insert_crawl_run(&self, id: &str, mode_json: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO crawl_runs (id, mode_json, status, started_at) VALUES (?1, ?2, 'running', ?3)",
                params![id, mode_json, now.as_str()],
            )
            .await
            .map_err(AdmitError::storage)?;
        Ok(())
    }

    pub async fn finish_crawl_run(&self, id: &str, status: &str, stats_json: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE crawl_runs SET status = ?1, finished_at = ?2, stats_json = ?3 WHERE id = ?4",
                params![status, now.as_str(), stats_json, id],
            )
            .await
            .map_err(AdmitError::storage)?;
        Ok(())
    }

    /// Most recently started run, if any.
    pub async fn latest_crawl_run(&self) -> Result<Option<CrawlRunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, mode_json, status, started_at, finished_at, stats_json
                 FROM crawl_runs ORDER BY started_at DESC, rowid DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(AdmitError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(CrawlRunRecord {
                id: row.get::<String>(0).map_err(AdmitError::storage)?,
                mode_json: row.get::<String>(1).map_err(AdmitError::storage)?,
                status: row.get::<String>(2).map_err(AdmitError::storage)?,
                started_at: parse_ts(&row.get::<String>(3).map_err(AdmitError::storage)?)?,
                finished_at: row
                    .get::<String>(4)
                    .ok()
                    .map(|s| parse_ts(&s))
                    .transpose()?,
                stats_json: row.get::<String>(5).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(AdmitError::storage(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies
// ---------------------------------------------------------------------------

async fn write_institution(conn: &Connection, inst: &Institution) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let created_at = inst
        .created_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| now.clone());

    conn.execute(
        "INSERT INTO institutions
           (code, name, full_name, location, category, website, description, quota, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(code) DO UPDATE SET
           name = excluded.name,
           full_name = excluded.full_name,
           location = excluded.location,
           category = excluded.category,
           website = excluded.website,
           description = excluded.description,
           quota = excluded.quota,
           updated_at = excluded.updated_at",
        params![
            inst.code.as_str(),
            inst.name.as_str(),
            inst.full_name.as_deref(),
            inst.location.as_deref(),
            inst.category.as_deref(),
            inst.website.as_deref(),
            inst.description.as_deref(),
            inst.quota.map(i64::from),
            created_at.as_str(),
            now.as_str(),
        ],
    )
    .await
    .map_err(AdmitError::storage)?;

    let mut stored: HashSet<i64> = HashSet::new();
    let mut rows = conn
        .query(
            "SELECT id FROM programs WHERE institution_code = ?1",
            params![inst.code.as_str()],
        )
        .await
        .map_err(AdmitError::storage)?;
    while let Ok(Some(row)) = rows.next().await {
        stored.insert(row.get::<i64>(0).map_err(AdmitError::storage)?);
    }

    let kept: HashSet<i64> = inst.programs.iter().filter_map(|p| p.id).collect();
    for id in stored.difference(&kept) {
        conn.execute("DELETE FROM programs WHERE id = ?1", params![*id])
            .await
            .map_err(AdmitError::storage)?;
    }

    for (position, program) in inst.programs.iter().enumerate() {
        let scores_json = serde_json::to_string(&program.scores)
            .map_err(|e| AdmitError::Storage(format!("serialize scores: {e}")))?;
        let key = program.key();
        let position = position as i64;

        match program.id.filter(|id| stored.contains(id)) {
            Some(id) => {
                conn.execute(
                    "UPDATE programs SET position = ?1, name = ?2, note = ?3, code = ?4,
                       combinations = ?5, method = ?6, scores_json = ?7, quota = ?8
                     WHERE id = ?9 AND institution_code = ?10",
                    params![
                        position,
                        key.name.as_str(),
                        key.note.as_str(),
                        program.code.as_deref(),
                        program.combinations.as_deref(),
                        program.method.as_deref(),
                        scores_json.as_str(),
                        program.quota.map(i64::from),
                        id,
                        inst.code.as_str(),
                    ],
                )
                .await
                .map_err(AdmitError::storage)?;
            }
            None => {
                conn.execute(
                    "INSERT INTO programs
                       (institution_code, position, name, note, code, combinations, method, scores_json, quota)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        inst.code.as_str(),
                        position,
                        key.name.as_str(),
                        key.note.as_str(),
                        program.code.as_deref(),
                        program.combinations.as_deref(),
                        program.method.as_deref(),
                        scores_json.as_str(),
                        program.quota.map(i64::from),
                    ],
                )
                .await
                .map_err(AdmitError::storage)?;
            }
        }
    }

    Ok(())
}

async fn write_candidate(conn: &Connection, candidate: &Candidate) -> Result<()> {
    conn.execute(
        "DELETE FROM combination_ranks
         WHERE candidate_id IN (SELECT id FROM candidates WHERE number = ?1)",
        params![candidate.number.as_str()],
    )
    .await
    .map_err(AdmitError::storage)?;
    conn.execute(
        "DELETE FROM candidates WHERE number = ?1",
        params![candidate.number.as_str()],
    )
    .await
    .map_err(AdmitError::storage)?;

    let scores_json = serde_json::to_string(&candidate.scores)
        .map_err(|e| AdmitError::Storage(format!("serialize scores: {e}")))?;
    let eligible_json = serde_json::to_string(&candidate.eligible)
        .map_err(|e| AdmitError::Storage(format!("serialize eligible set: {e}")))?;

    conn.execute(
        "INSERT INTO candidates
           (number, region, exam_year, scores_json, eligible_json, provenance, fetched_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            candidate.number.as_str(),
            candidate.region.as_str(),
            i64::from(candidate.exam_year),
            scores_json.as_str(),
            eligible_json.as_str(),
            candidate.provenance.as_str(),
            candidate.fetched_at.to_rfc3339(),
        ],
    )
    .await
    .map_err(AdmitError::storage)?;
    let candidate_id = conn.last_insert_rowid();

    for rank in &candidate.rankings {
        conn.execute(
            "INSERT INTO combination_ranks
               (candidate_id, combination, total_score, rank_position, candidates_at_score,
                candidates_above, total_candidates, percentile, estimated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                candidate_id,
                rank.combination.code(),
                rank.total_score,
                i64::from(rank.rank_position),
                rank.candidates_at_score.map(i64::from),
                rank.candidates_above.map(i64::from),
                i64::from(rank.total_candidates),
                rank.percentile,
                i64::from(rank.estimated),
            ],
        )
        .await
        .map_err(AdmitError::storage)?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AdmitError::Storage(format!("invalid date '{s}': {e}")))
}

fn row_to_institution(row: &libsql::Row) -> Result<Institution> {
    let mut inst = Institution::new(
        row.get::<String>(0).map_err(AdmitError::storage)?,
        row.get::<String>(1).map_err(AdmitError::storage)?,
    );
    inst.full_name = row.get::<String>(2).ok();
    inst.location = row.get::<String>(3).ok();
    inst.category = row.get::<String>(4).ok();
    inst.website = row.get::<String>(5).ok();
    inst.description = row.get::<String>(6).ok();
    inst.quota = row.get::<i64>(7).ok().and_then(|q| u32::try_from(q).ok());
    inst.created_at = Some(parse_ts(&row.get::<String>(8).map_err(AdmitError::storage)?)?);
    inst.updated_at = Some(parse_ts(&row.get::<String>(9).map_err(AdmitError::storage)?)?);
    Ok(inst)
}

fn row_to_program(row: &libsql::Row) -> Result<Program> {
    let scores_json: String = row.get(7).map_err(AdmitError::storage)?;
    let scores: BTreeMap<i32, f64> = serde_json::from_str(&scores_json)
        .map_err(|e| AdmitError::Storage(format!("invalid program scores: {e}")))?;

    Ok(Program {
        id: Some(row.get::<i64>(0).map_err(AdmitError::storage)?),
        institution_code: row.get::<String>(1).map_err(AdmitError::storage)?,
        name: row.get::<String>(2).map_err(AdmitError::storage)?,
        note: row.get::<String>(3).unwrap_or_default(),
        code: row.get::<String>(4).ok(),
        combinations: row.get::<String>(5).ok(),
        method: row.get::<String>(6).ok(),
        scores,
        quota: row.get::<i64>(8).ok().and_then(|q| u32::try_from(q).ok()),
    })
}

fn row_to_candidate(row: &libsql::Row) -> Result<(i64, Candidate)> {
    let scores_json: String = row.get(4).map_err(AdmitError::storage)?;
    let scores: BTreeMap<Subject, f64> = serde_json::from_str(&scores_json)
        .map_err(|e| AdmitError::Storage(format!("invalid candidate scores: {e}")))?;
    let eligible_json: String = row.get(5).map_err(AdmitError::storage)?;
    let eligible: Vec<Combination> = serde_json::from_str(&eligible_json)
        .map_err(|e| AdmitError::Storage(format!("invalid eligible set: {e}")))?;
    let provenance: Provenance = row
        .get::<String>(6)
        .map_err(AdmitError::storage)?
        .parse()
        .map_err(AdmitError::storage)?;

    Ok((
        row.get::<i64>(0).map_err(AdmitError::storage)?,
        Candidate {
            number: row.get::<String>(1).map_err(AdmitError::storage)?,
            region: row.get::<String>(2).map_err(AdmitError::storage)?,
            exam_year: row.get::<i32>(3).map_err(AdmitError::storage)?,
            scores,
            eligible,
            rankings: Vec::new(),
            provenance,
            fetched_at: parse_ts(&row.get::<String>(7).map_err(AdmitError::storage)?)?,
        },
    ))
}

fn row_to_rank(row: &libsql::Row) -> Result<CombinationRank> {
    let combination: Combination = row
        .get::<String>(0)
        .map_err(AdmitError::storage)?
        .parse()
        .map_err(AdmitError::storage)?;
    let count = |idx: i32| row.get::<i64>(idx).ok().and_then(|v| u32::try_from(v).ok());

    Ok(CombinationRank {
        combination,
        total_score: row.get::<f64>(1).map_err(AdmitError::storage)?,
        rank_position: count(2).unwrap_or(0),
        candidates_at_score: count(3),
        candidates_above: count(4),
        total_candidates: count(5).unwrap_or(0),
        percentile: row.get::<f64>(6).map_err(AdmitError::storage)?,
        estimated: row.get::<i64>(7).map_err(AdmitError::storage)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("admitsync_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test storage")
    }

    fn program(name: &str, note: &str, year: i32, score: f64) -> Program {
        let mut p = Program::new("BKA", name);
        p.note = note.into();
        p.scores.insert(year, score);
        p
    }

    fn candidate(number: &str, ranks: usize) -> Candidate {
        let mut scores = BTreeMap::new();
        scores.insert(Subject::Math, 8.5);
        scores.insert(Subject::Physics, 7.0);
        scores.insert(Subject::Chemistry, 9.0);
        Candidate {
            number: number.into(),
            region: "ha-noi".into(),
            exam_year: 2024,
            scores,
            eligible: vec![Combination::A00],
            rankings: (0..ranks)
                .map(|i| CombinationRank {
                    combination: admitsync_shared::ALL_COMBINATIONS[i],
                    total_score: 24.5,
                    rank_position: 1200,
                    candidates_at_score: None,
                    candidates_above: None,
                    total_candidates: 330_000,
                    percentile: 89.2,
                    estimated: true,
                })
                .collect(),
            provenance: Provenance::StrategyA,
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("admitsync_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn institution_round_trip_assigns_ids() {
        let storage = test_storage().await;
        let mut inst = Institution::new("BKA", "Đại học Bách khoa Hà Nội");
        inst.website = Some("https://hust.edu.vn".into());
        inst.quota = Some(7985);
        inst.programs = vec![
            program("Khoa học Máy tính", "", 2024, 28.53),
            program("Công nghệ thông tin", "CLC", 2024, 27.85),
        ];

        let saved = storage.save_institution(&inst).await.expect("save");
        assert!(storage.institution_exists("BKA").await.unwrap());
        assert!(!storage.institution_exists("NTH").await.unwrap());
        assert_eq!(saved.programs.len(), 2);
        assert!(saved.programs.iter().all(|p| p.id.is_some()));
        assert_eq!(saved.programs[0].name, "Khoa học Máy tính");
        assert_eq!(saved.programs[1].scores.get(&2024), Some(&27.85));
        assert_eq!(saved.quota, Some(7985));
        assert!(saved.created_at.is_some());

        let codes = storage.existing_codes().await.unwrap();
        assert!(codes.contains("BKA"));
    }

    #[tokio::test]
    async fn save_updates_kept_and_prunes_missing_programs() {
        let storage = test_storage().await;
        let mut inst = Institution::new("BKA", "Bách khoa");
        inst.programs = vec![
            program("A", "x", 2023, 5.0),
            program("B", "", 2023, 6.0),
        ];
        let saved = storage.save_institution(&inst).await.unwrap();
        let a_id = saved.programs[0].id;

        let mut next = saved.clone();
        next.programs.truncate(1);
        next.programs[0].scores.insert(2024, 7.0);
        let saved_again = storage.save_institution(&next).await.unwrap();

        assert_eq!(saved_again.programs.len(), 1);
        assert_eq!(saved_again.programs[0].id, a_id);
        assert_eq!(saved_again.programs[0].scores.len(), 2);
        assert_eq!(saved_again.created_at, saved.created_at);

        let listed = storage.list_institutions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].program_count, 1);
    }

    #[tokio::test]
    async fn duplicate_program_key_is_rejected() {
        let storage = test_storage().await;
        let mut inst = Institution::new("BKA", "Bách khoa");
        inst.programs = vec![program("A", "", 2024, 5.0), program("A", "", 2023, 4.0)];
        let err = storage.save_institution(&inst).await.unwrap_err();
        assert!(matches!(err, AdmitError::Storage(_)));
        // The failed transaction left nothing behind.
        assert!(!storage.institution_exists("BKA").await.unwrap());
    }

    #[tokio::test]
    async fn candidate_replace_is_wholesale() {
        let storage = test_storage().await;
        storage.replace_candidate(&candidate("12345678", 3)).await.unwrap();

        let stored = storage.get_candidate("12345678").await.unwrap().unwrap();
        assert_eq!(stored.rankings.len(), 3);
        assert_eq!(stored.provenance, Provenance::StrategyA);
        assert_eq!(stored.scores.get(&Subject::Math), Some(&8.5));
        assert_eq!(stored.eligible, vec![Combination::A00]);

        storage.replace_candidate(&candidate("12345678", 1)).await.unwrap();
        let stored = storage.get_candidate("12345678").await.unwrap().unwrap();
        assert_eq!(stored.rankings.len(), 1);
        assert_eq!(stored.rankings[0].combination, Combination::A00);
        assert!(stored.rankings[0].estimated);
    }

    #[tokio::test]
    async fn candidate_delete_cascades() {
        let storage = test_storage().await;
        storage.replace_candidate(&candidate("12345678", 2)).await.unwrap();

        assert!(storage.delete_candidate("12345678").await.unwrap());
        assert!(!storage.delete_candidate("12345678").await.unwrap());
        assert!(storage.get_candidate("12345678").await.unwrap().is_none());

        let mut rows = storage
            .conn
            .query("SELECT COUNT(*) FROM combination_ranks", params![])
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 0);
    }

    #[tokio::test]
    async fn crawl_run_lifecycle() {
        let storage = test_storage().await;
        assert!(storage.latest_crawl_run().await.unwrap().is_none());

        let id = Uuid::now_v7().to_string();
        storage
            .insert_crawl_run(&id, r#"{"force_update":false,"skip_existing":true}"#)
            .await
            .unwrap();
        let run = storage.latest_crawl_run().await.unwrap().unwrap();
        assert_eq!(run.status, "running");
        assert!(run.finished_at.is_none());

        storage
            .finish_crawl_run(&id, "completed", r#"{"processed":10}"#)
            .await
            .unwrap();
        let run = storage.latest_crawl_run().await.unwrap().unwrap();
        assert_eq!(run.id, id);
        assert_eq!(run.status, "completed");
        assert!(run.finished_at.is_some());
        assert_eq!(run.stats_json.as_deref(), Some(r#"{"processed":10}"#));
    }

    #[tokio::test]
    async fn crawl_run_writes_survive_unrelated_rollback() {
        let storage = Arc::new(test_storage().await);

        // Another writer holds the lock with a transaction open.
        let guard = storage.write_lock.lock().await;
        let tx = storage.conn.transaction().await.unwrap();
        let insert = {
            let storage = storage.clone();
            tokio::spawn(async move { storage.insert_crawl_run("job-1", "{}").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!insert.is_finished());
        tx.rollback().await.unwrap();
        drop(guard);
        insert.await.unwrap().unwrap();

        let run = storage.latest_crawl_run().await.unwrap().unwrap();
        assert_eq!(run.id, "job-1");
        assert_eq!(run.status, "running");

        let guard = storage.write_lock.lock().await;
        let tx = storage.conn.transaction().await.unwrap();
        let finish = {
            let storage = storage.clone();
            tokio::spawn(async move { storage.finish_crawl_run("job-1", "completed", "{}").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!finish.is_finished());
        tx.rollback().await.unwrap();
        drop(guard);
        finish.await.unwrap().unwrap();

        let run = storage.latest_crawl_run().await.unwrap().unwrap();
        assert_eq!(run.status, "completed");
        assert!(run.finished_at.is_some());
    }
}
