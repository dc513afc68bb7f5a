//! Merge an extracted institution into its stored counterpart.

use std::collections::HashMap;

use admitsync_shared::{Institution, Program, ProgramKey, Result};
use admitsync_storage::Storage;
use serde::Serialize;
use tracing::{info, instrument};

use crate::locks::KeyLocks;

/// Whether reconciliation created a new entity or updated a stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileAction {
    Created,
    Updated,
}

/// Result of persisting one reconciled institution.
#[derive(Debug, Clone, Serialize)]
pub struct UpsertOutcome {
    pub institution: Institution,
    pub action: ReconcileAction,
    /// Programs after minus programs before.
    pub program_delta: i64,
}

// ---------------------------------------------------------------------------
// Pure merge
// ---------------------------------------------------------------------------

/// Merge `incoming` into `existing`.
///
/// Incoming scalars overwrite only when present and non-blank. Programs are
/// matched on `(name, note)`: a match keeps its row id and takes the
/// incoming volatile fields (year scores merge, incoming years win); an
/// unmatched incoming program is new; a stored program missing from
/// `incoming` is dropped.
pub fn reconcile(existing: Option<Institution>, incoming: Institution) -> (Institution, ReconcileAction) {
    let Some(mut current) = existing else {
        let mut created = incoming;
        let code = created.code.clone();
        created.programs = merge_programs(Vec::new(), std::mem::take(&mut created.programs), &code);
        return (created, ReconcileAction::Created);
    };

    if !incoming.name.trim().is_empty() {
        current.name = incoming.name;
    }
    overwrite(&mut current.full_name, incoming.full_name);
    overwrite(&mut current.location, incoming.location);
    overwrite(&mut current.category, incoming.category);
    overwrite(&mut current.website, incoming.website);
    overwrite(&mut current.description, incoming.description);
    if incoming.quota.is_some() {
        current.quota = incoming.quota;
    }

    let code = current.code.clone();
    let stored = std::mem::take(&mut current.programs);
    current.programs = merge_programs(stored, incoming.programs, &code);

    (current, ReconcileAction::Updated)
}

fn overwrite(slot: &mut Option<String>, incoming: Option<String>) {
    if let Some(value) = incoming.filter(|v| !v.trim().is_empty()) {
        *slot = Some(value);
    }
}

fn merge_programs(stored: Vec<Program>, incoming: Vec<Program>, code: &str) -> Vec<Program> {
    let mut by_key: HashMap<ProgramKey, Program> =
        stored.into_iter().map(|p| (p.key(), p)).collect();
    let mut merged: Vec<Program> = Vec::with_capacity(incoming.len());
    let mut placed: HashMap<ProgramKey, usize> = HashMap::new();

    for mut program in incoming {
        let key = program.key();
        program.name = key.name.clone();
        program.note = key.note.clone();
        program.institution_code = code.to_string();

        if let Some(&i) = placed.get(&key) {
            merge_into(&mut merged[i], program);
        } else if let Some(mut existing) = by_key.remove(&key) {
            merge_into(&mut existing, program);
            placed.insert(key, merged.len());
            merged.push(existing);
        } else {
            program.id = None;
            placed.insert(key, merged.len());
            merged.push(program);
        }
    }

    merged
}

fn merge_into(target: &mut Program, incoming: Program) {
    overwrite(&mut target.code, incoming.code);
    overwrite(&mut target.combinations, incoming.combinations);
    overwrite(&mut target.method, incoming.method);
    if incoming.quota.is_some() {
        target.quota = incoming.quota;
    }
    target.scores.extend(incoming.scores);
}

// ---------------------------------------------------------------------------
// Persisted merge
// ---------------------------------------------------------------------------

/// Reconcile `incoming` against the store and persist the result.
///
/// Holds the per-code lock for the whole read-merge-write.
#[instrument(skip_all, fields(code = %incoming.code))]
pub async fn upsert_institution(
    storage: &Storage,
    locks: &KeyLocks,
    incoming: Institution,
) -> Result<UpsertOutcome> {
    let _guard = locks.lock(&incoming.code).await;

    let existing = storage.get_institution(&incoming.code).await?;
    let before = existing.as_ref().map_or(0, |i| i.programs.len()) as i64;

    let (merged, action) = reconcile(existing, incoming);
    let institution = storage.save_institution(&merged).await?;
    let program_delta = institution.programs.len() as i64 - before;

    info!(action = ?action, programs = institution.programs.len(), program_delta, "institution reconciled");
    Ok(UpsertOutcome {
        institution,
        action,
        program_delta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn program(name: &str, note: &str, scores: &[(i32, f64)]) -> Program {
        let mut p = Program::new("BKA", name);
        p.note = note.into();
        p.scores = scores.iter().copied().collect();
        p
    }

    fn with_programs(programs: Vec<Program>) -> Institution {
        let mut inst = Institution::new("BKA", "Đại học Bách khoa Hà Nội");
        inst.programs = programs;
        inst
    }

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("admitsync_core_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test storage")
    }

    #[test]
    fn first_sight_is_created() {
        let (inst, action) = reconcile(None, with_programs(vec![program("A", "", &[(2024, 25.0)])]));
        assert_eq!(action, ReconcileAction::Created);
        assert_eq!(inst.programs.len(), 1);
    }

    #[test]
    fn blank_incoming_scalars_never_clobber() {
        let mut stored = with_programs(vec![]);
        stored.website = Some("https://hust.edu.vn".into());
        stored.location = Some("Hà Nội".into());
        stored.quota = Some(7985);

        let mut incoming = with_programs(vec![]);
        incoming.website = None;
        incoming.location = Some("   ".into());
        incoming.category = Some("Công lập".into());

        let (merged, action) = reconcile(Some(stored), incoming);
        assert_eq!(action, ReconcileAction::Updated);
        assert_eq!(merged.website.as_deref(), Some("https://hust.edu.vn"));
        assert_eq!(merged.location.as_deref(), Some("Hà Nội"));
        assert_eq!(merged.category.as_deref(), Some("Công lập"));
        assert_eq!(merged.quota, Some(7985));
    }

    #[test]
    fn child_merge_keeps_identity() {
        let mut a = program("A", "x", &[(2023, 5.0)]);
        a.id = Some(41);
        let stored = with_programs(vec![a]);
        let incoming = with_programs(vec![
            program("A", "x", &[(2023, 7.0)]),
            program("B", "", &[(2023, 3.0)]),
        ]);

        let (merged, _) = reconcile(Some(stored), incoming);
        assert_eq!(merged.programs.len(), 2);
        assert_eq!(merged.programs[0].id, Some(41));
        assert_eq!(merged.programs[0].scores.get(&2023), Some(&7.0));
        assert_eq!(merged.programs[1].id, None);
        assert_eq!(merged.programs[1].name, "B");
    }

    #[test]
    fn year_scores_merge_incoming_wins() {
        let stored = with_programs(vec![program("A", "", &[(2022, 24.0), (2023, 25.0)])]);
        let incoming = with_programs(vec![program("A", "", &[(2023, 25.5), (2024, 26.0)])]);

        let (merged, _) = reconcile(Some(stored), incoming);
        let scores = &merged.programs[0].scores;
        assert_eq!(scores.len(), 3);
        assert_eq!(scores.get(&2022), Some(&24.0));
        assert_eq!(scores.get(&2023), Some(&25.5));
    }

    #[test]
    fn prune_by_absence() {
        let stored = with_programs(vec![program("A", "", &[]), program("B", "", &[])]);
        let incoming = with_programs(vec![program("A", "", &[(2024, 20.0)])]);

        let (merged, _) = reconcile(Some(stored), incoming);
        let names: Vec<_> = merged.programs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["A"]);
    }

    #[test]
    fn duplicate_incoming_keys_collapse() {
        let incoming = with_programs(vec![
            program(" A ", "", &[(2023, 20.0)]),
            program("A", "", &[(2024, 21.0)]),
        ]);
        let (merged, _) = reconcile(None, incoming);
        assert_eq!(merged.programs.len(), 1);
        assert_eq!(merged.programs[0].scores.len(), 2);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let storage = test_storage().await;
        let locks = KeyLocks::new();
        let incoming = with_programs(vec![
            program("A", "x", &[(2024, 25.0)]),
            program("B", "", &[(2024, 22.0)]),
        ]);

        let first = upsert_institution(&storage, &locks, incoming.clone()).await.unwrap();
        assert_eq!(first.action, ReconcileAction::Created);
        assert_eq!(first.program_delta, 2);

        let second = upsert_institution(&storage, &locks, incoming).await.unwrap();
        assert_eq!(second.action, ReconcileAction::Updated);
        assert_eq!(second.program_delta, 0);

        let strip = |i: &Institution| {
            let mut i = i.clone();
            i.updated_at = None;
            i
        };
        assert_eq!(strip(&first.institution), strip(&second.institution));
    }

    #[tokio::test]
    async fn upsert_child_merge_and_prune() {
        let storage = test_storage().await;
        let locks = KeyLocks::new();

        let first = upsert_institution(
            &storage,
            &locks,
            with_programs(vec![program("A", "x", &[(2024, 5.0)]), program("C", "", &[])]),
        )
        .await
        .unwrap();
        let a_id = first.institution.programs[0].id;

        let second = upsert_institution(
            &storage,
            &locks,
            with_programs(vec![program("A", "x", &[(2024, 7.0)]), program("B", "", &[(2024, 3.0)])]),
        )
        .await
        .unwrap();

        let stored = storage.get_institution("BKA").await.unwrap().unwrap();
        assert_eq!(second.program_delta, 0);
        assert_eq!(stored.programs.len(), 2);
        assert_eq!(stored.programs[0].id, a_id);
        assert_eq!(stored.programs[0].scores.get(&2024), Some(&7.0));
        assert_eq!(stored.programs[1].name, "B");
        assert!(stored.programs.iter().all(|p| p.name != "C"));
    }
}
