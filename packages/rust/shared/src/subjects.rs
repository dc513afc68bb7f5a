//! Fixed lookup tables: subjects, their localized synonyms, and the
//! subject combinations used for admission with their reference statistics.

use serde::{Deserialize, Serialize};

use crate::error::AdmitError;

// ---------------------------------------------------------------------------
// Subjects
// ---------------------------------------------------------------------------

/// Canonical exam subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Math,
    Literature,
    Physics,
    Chemistry,
    Biology,
    History,
    Geography,
    English,
    Civics,
}

/// Every subject, in table order.
pub const ALL_SUBJECTS: [Subject; 9] = [
    Subject::Math,
    Subject::Literature,
    Subject::Physics,
    Subject::Chemistry,
    Subject::Biology,
    Subject::History,
    Subject::Geography,
    Subject::English,
    Subject::Civics,
];

/// Mean and standard deviation of a score distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distribution {
    pub mean: f64,
    pub stddev: f64,
}

impl Subject {
    /// Stable key used in storage and JSON.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Math => "math",
            Self::Literature => "literature",
            Self::Physics => "physics",
            Self::Chemistry => "chemistry",
            Self::Biology => "biology",
            Self::History => "history",
            Self::Geography => "geography",
            Self::English => "english",
            Self::Civics => "civics",
        }
    }

    /// Localized labels seen on the source site, longest first so that
    /// `Ngữ văn` wins over `Văn` when both could match.
    pub fn synonyms(&self) -> &'static [&'static str] {
        match self {
            Self::Math => &["Toán học", "Toán", "Math", "Mathematics"],
            Self::Literature => &["Ngữ văn", "Ngữ Văn", "Văn học", "Văn", "Literature"],
            Self::Physics => &["Vật lí", "Vật lý", "Vật Lý", "Lí", "Lý", "Physics"],
            Self::Chemistry => &["Hóa học", "Hoá học", "Hóa", "Hoá", "Chemistry"],
            Self::Biology => &["Sinh học", "Sinh", "Biology"],
            Self::History => &["Lịch sử", "Lịch Sử", "Sử", "History"],
            Self::Geography => &["Địa lí", "Địa lý", "Địa Lý", "Địa", "Geography"],
            Self::English => &["Tiếng Anh", "Ngoại ngữ", "Anh văn", "English"],
            Self::Civics => &["Giáo dục công dân", "GDCD", "Civic education", "Civics"],
        }
    }

    /// National reference distribution, used by the synthetic fallback.
    pub fn reference(&self) -> Distribution {
        let (mean, stddev) = match self {
            Self::Math => (6.45, 1.4),
            Self::Literature => (7.2, 1.2),
            Self::Physics => (6.7, 1.5),
            Self::Chemistry => (6.7, 1.6),
            Self::Biology => (6.3, 1.4),
            Self::History => (6.6, 1.6),
            Self::Geography => (7.2, 1.3),
            Self::English => (5.5, 1.8),
            Self::Civics => (8.2, 1.1),
        };
        Distribution { mean, stddev }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Map a localized label (e.g. `"Vật lý:"`) to its canonical subject.
pub fn canonical_subject(label: &str) -> Option<Subject> {
    let normalized = label.trim().trim_end_matches(':').trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    if let Ok(subject) = serde_json::from_value::<Subject>(serde_json::Value::String(
        normalized.clone(),
    )) {
        return Some(subject);
    }
    ALL_SUBJECTS.into_iter().find(|subject| {
        subject
            .synonyms()
            .iter()
            .any(|syn| syn.to_lowercase() == normalized)
    })
}

// ---------------------------------------------------------------------------
// Combinations
// ---------------------------------------------------------------------------

/// Admission subject combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Combination {
    A00,
    A01,
    B00,
    C00,
    C01,
    D01,
    D07,
    D14,
}

/// Every combination, in table order.
pub const ALL_COMBINATIONS: [Combination; 8] = [
    Combination::A00,
    Combination::A01,
    Combination::B00,
    Combination::C00,
    Combination::C01,
    Combination::D01,
    Combination::D07,
    Combination::D14,
];

/// Reference statistics of a combination's total-score distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinationStats {
    pub mean: f64,
    pub stddev: f64,
    /// Approximate number of candidates sitting the combination.
    pub pool: u32,
}

impl Combination {
    pub fn code(&self) -> &'static str {
        match self {
            Self::A00 => "A00",
            Self::A01 => "A01",
            Self::B00 => "B00",
            Self::C00 => "C00",
            Self::C01 => "C01",
            Self::D01 => "D01",
            Self::D07 => "D07",
            Self::D14 => "D14",
        }
    }

    /// Required subjects; the total is only defined when all are present.
    pub fn subjects(&self) -> [Subject; 3] {
        use Subject::*;
        match self {
            Self::A00 => [Math, Physics, Chemistry],
            Self::A01 => [Math, Physics, English],
            Self::B00 => [Math, Chemistry, Biology],
            Self::C00 => [Literature, History, Geography],
            Self::C01 => [Literature, Math, Physics],
            Self::D01 => [Math, Literature, English],
            Self::D07 => [Math, Chemistry, English],
            Self::D14 => [Literature, History, English],
        }
    }

    pub fn stats(&self) -> CombinationStats {
        let (mean, stddev, pool) = match self {
            Self::A00 => (20.0, 3.6, 330_000),
            Self::A01 => (19.0, 3.9, 310_000),
            Self::B00 => (19.5, 3.5, 230_000),
            Self::C00 => (21.0, 3.4, 280_000),
            Self::C01 => (20.2, 3.5, 240_000),
            Self::D01 => (19.2, 3.8, 780_000),
            Self::D07 => (19.3, 3.9, 290_000),
            Self::D14 => (19.4, 3.7, 210_000),
        };
        CombinationStats { mean, stddev, pool }
    }
}

impl std::fmt::Display for Combination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl std::str::FromStr for Combination {
    type Err = AdmitError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        ALL_COMBINATIONS
            .into_iter()
            .find(|c| c.code() == upper)
            .ok_or_else(|| AdmitError::validation(format!("unknown combination '{s}'")))
    }
}
