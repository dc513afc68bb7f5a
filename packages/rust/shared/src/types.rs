//! Core domain types for the admissions catalog.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AdmitError, Result};
use crate::subjects::{Combination, Subject};

/// Accepted candidate-number lengths.
pub const CANDIDATE_NUMBER_LEN: RangeInclusive<usize> = 8..=8;

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Which extraction strategy (or the store) produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Served from the local store without extraction.
    Store,
    /// Static HTML table parse.
    StrategyA,
    /// Headless browser automation.
    StrategyB,
    /// Synthetic, non-authoritative reference data.
    Synthetic,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::StrategyA => "strategy_a",
            Self::StrategyB => "strategy_b",
            Self::Synthetic => "synthetic",
        }
    }

    /// `false` only for the synthetic fallback.
    pub fn is_authoritative(&self) -> bool {
        !matches!(self, Self::Synthetic)
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provenance {
    type Err = AdmitError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "store" => Ok(Self::Store),
            "strategy_a" => Ok(Self::StrategyA),
            "strategy_b" => Ok(Self::StrategyB),
            "synthetic" => Ok(Self::Synthetic),
            other => Err(AdmitError::validation(format!("unknown provenance '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Institutions & programs
// ---------------------------------------------------------------------------

/// Lightweight discovery result preceding full extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstitutionStub {
    /// Natural key, e.g. `BKA`.
    pub code: String,
    /// Anchor text from the catalog index.
    pub name: String,
    /// Absolute URL of the detail page.
    pub detail_url: String,
}

/// An institution (university) and its programs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Institution {
    /// Natural key, unique across the store.
    pub code: String,
    /// Display name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Public / private / etc.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<u32>,
    /// Owned programs, in source order.
    #[serde(default)]
    pub programs: Vec<Program>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Institution {
    /// An institution with only its identity filled in.
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            full_name: None,
            location: None,
            category: None,
            website: None,
            description: None,
            quota: None,
            programs: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }
}

/// Composite identity of a program within its institution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramKey {
    pub name: String,
    pub note: String,
}

/// A program (major) offered by an institution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Row id once persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Natural key of the owning institution.
    pub institution_code: String,
    pub name: String,
    /// Free-text note; empty when the source has none.
    #[serde(default)]
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Subject-combination tag text, e.g. `A00; A01; D07`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combinations: Option<String>,
    /// Admission method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Benchmark score per year.
    #[serde(default)]
    pub scores: BTreeMap<i32, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<u32>,
}

impl Program {
    pub fn new(institution_code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: None,
            institution_code: institution_code.into(),
            name: name.into(),
            note: String::new(),
            code: None,
            combinations: None,
            method: None,
            scores: BTreeMap::new(),
            quota: None,
        }
    }

    pub fn key(&self) -> ProgramKey {
        ProgramKey {
            name: self.name.trim().to_string(),
            note: self.note.trim().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// Ranking facts for one subject combination of a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationRank {
    pub combination: Combination,
    pub total_score: f64,
    /// 1-based rank among all candidates of the combination.
    pub rank_position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates_at_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates_above: Option<u32>,
    /// Size of the candidate pool used for the rank.
    pub total_candidates: u32,
    /// 0–100.
    pub percentile: f64,
    /// `true` when derived from the normal approximation rather than scraped counts.
    pub estimated: bool,
}

/// An exam candidate looked up by candidate number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Natural key (digits only).
    pub number: String,
    pub region: String,
    pub exam_year: i32,
    /// Base subject scores (sparse).
    pub scores: BTreeMap<Subject, f64>,
    /// Combinations whose required subjects are all present.
    #[serde(default)]
    pub eligible: Vec<Combination>,
    #[serde(default)]
    pub rankings: Vec<CombinationRank>,
    pub provenance: Provenance,
    pub fetched_at: DateTime<Utc>,
}

impl Candidate {
    /// A record is complete once it has base scores and derived rankings.
    pub fn is_complete(&self) -> bool {
        !self.scores.is_empty() && !self.rankings.is_empty()
    }
}

/// Check a candidate number's shape before any lookup.
///
/// Rejects wrong lengths, non-digits, all-zero and single-repeated-digit keys.
pub fn validate_candidate_number(number: &str) -> Result<()> {
    if !CANDIDATE_NUMBER_LEN.contains(&number.len()) {
        return Err(AdmitError::validation(format!(
            "candidate number must be {}-{} digits, got {}",
            CANDIDATE_NUMBER_LEN.start(),
            CANDIDATE_NUMBER_LEN.end(),
            number.len()
        )));
    }
    if !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AdmitError::validation(
            "candidate number must contain digits only",
        ));
    }
    let first = number.as_bytes()[0];
    if number.bytes().all(|b| b == first) {
        return Err(AdmitError::validation(
            "candidate number cannot be a single repeated digit",
        ));
    }
    Ok(())
}
