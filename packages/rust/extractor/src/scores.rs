//! Subject/score extraction from free row text.
//!
//! Shared by the static parser and the browser strategy: both end up with a
//! list of row texts such as `"Toán: 8.6  Ngữ văn: 7.25"` or `"Vật lí\t6.5"`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use admitsync_shared::{ALL_COMBINATIONS, ALL_SUBJECTS, Combination, Subject};
use regex::Regex;

use crate::static_parse::parse_number;

/// Plausible range of a single subject score.
pub const SUBJECT_SCORE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=10.0;

/// One compiled pattern per synonym, longest synonym first across all
/// subjects, so `Địa lí` is consumed before the physics synonym `Lí` runs.
static SYNONYM_PATTERNS: LazyLock<Vec<(Subject, Regex)>> = LazyLock::new(|| {
    let mut pairs: Vec<(Subject, &str)> = ALL_SUBJECTS
        .into_iter()
        .flat_map(|s| s.synonyms().iter().map(move |syn| (s, *syn)))
        .collect();
    pairs.sort_by_key(|(_, syn)| std::cmp::Reverse(syn.chars().count()));

    pairs
        .into_iter()
        .map(|(subject, syn)| {
            let pattern = format!(
                r"(?i)(?:^|[^\p{{L}}]){}\s*[:：\-–]?\s*(\d{{1,2}}(?:[.,]\d{{1,3}})?)(?:[^\d]|$)",
                regex::escape(syn)
            );
            (subject, Regex::new(&pattern).expect("synonym regex"))
        })
        .collect()
});

/// `<combo> ... cao hơn: N ... bằng điểm: M ... tổng: P` (thousand separators allowed).
static PEER_RE: LazyLock<Regex> = LazyLock::new(|| {
    let codes = ALL_COMBINATIONS
        .iter()
        .map(|c| c.code())
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(
        r"(?i)\b({codes})\b.*?cao hơn\s*:?\s*(\d[\d.,]*).*?bằng(?: điểm)?\s*:?\s*(\d[\d.,]*).*?tổng(?: số)?(?: thí sinh)?\s*:?\s*(\d[\d.,]*)"
    ))
    .expect("peer regex")
});

/// Peer counts scraped for one combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCounts {
    /// Candidates with a strictly higher total.
    pub above: u32,
    /// Candidates with exactly the same total.
    pub at_score: u32,
    /// Everyone who sat the combination.
    pub total: u32,
}

/// Everything a result page yields for one candidate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreSheet {
    pub scores: BTreeMap<Subject, f64>,
    pub peers: BTreeMap<Combination, PeerCounts>,
    /// Exam year when the page states it.
    pub exam_year: Option<i32>,
}

impl ScoreSheet {
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Build a sheet from row texts: subject scores plus any peer counts.
pub fn score_sheet_from_rows<'a, I>(rows: I) -> ScoreSheet
where
    I: IntoIterator<Item = &'a str>,
    I::IntoIter: Clone,
{
    let rows = rows.into_iter();
    ScoreSheet {
        scores: extract_subject_scores(rows.clone()),
        peers: extract_peer_counts(rows),
        exam_year: None,
    }
}

/// Extract subject scores from row texts.
///
/// The first match per canonical subject wins; later duplicates are ignored.
/// Matched spans are blanked so shorter synonyms cannot re-match inside them.
pub fn extract_subject_scores<'a, I>(rows: I) -> BTreeMap<Subject, f64>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut scores = BTreeMap::new();

    for row in rows {
        let mut text = row.to_string();
        for (subject, re) in SYNONYM_PATTERNS.iter() {
            if let Some(caps) = re.captures(&text) {
                if !scores.contains_key(subject) {
                    if let Some(value) = parse_number(&caps[1], SUBJECT_SCORE_RANGE) {
                        scores.insert(*subject, value);
                    }
                }
                text = re.replace_all(&text, " ").into_owned();
            }
        }
    }

    scores
}

/// Extract peer counts per combination from row texts.
pub fn extract_peer_counts<'a, I>(rows: I) -> BTreeMap<Combination, PeerCounts>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut peers = BTreeMap::new();

    for row in rows {
        for caps in PEER_RE.captures_iter(row) {
            let Ok(combo) = caps[1].parse::<Combination>() else {
                continue;
            };
            let (Some(above), Some(at_score), Some(total)) =
                (parse_count(&caps[2]), parse_count(&caps[3]), parse_count(&caps[4]))
            else {
                continue;
            };
            if total == 0 {
                continue;
            }
            peers.entry(combo).or_insert(PeerCounts {
                above,
                at_score,
                total,
            });
        }
    }

    peers
}

/// Parse a count written with `.`/`,` thousand separators.
fn parse_count(raw: &str) -> Option<u32> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_inline_pairs() {
        let scores = extract_subject_scores(["Toán: 8.6  Ngữ văn: 7,25  Tiếng Anh: 9.4"]);
        assert_eq!(scores.get(&Subject::Math), Some(&8.6));
        assert_eq!(scores.get(&Subject::Literature), Some(&7.25));
        assert_eq!(scores.get(&Subject::English), Some(&9.4));
        assert_eq!(scores.len(), 3);
    }

    #[test]
    fn longer_synonym_consumed_first() {
        // `Lí` alone would otherwise read geography's score as physics.
        let scores = extract_subject_scores(["Địa lí: 7.5", "Lịch sử\t6.0"]);
        assert_eq!(scores.get(&Subject::Geography), Some(&7.5));
        assert_eq!(scores.get(&Subject::History), Some(&6.0));
        assert!(!scores.contains_key(&Subject::Physics));
    }

    #[test]
    fn first_match_per_subject_wins() {
        let scores = extract_subject_scores(["Toán 8.0", "Toán học 3.0", "Math: 1.0"]);
        assert_eq!(scores.get(&Subject::Math), Some(&8.0));
    }

    #[test]
    fn rejects_out_of_range_and_long_numbers() {
        let scores = extract_subject_scores(["Vật lý: 11.5", "Hóa học 12345678", "Sinh học: 6.75"]);
        assert!(!scores.contains_key(&Subject::Physics));
        assert!(!scores.contains_key(&Subject::Chemistry));
        assert_eq!(scores.get(&Subject::Biology), Some(&6.75));
    }

    #[test]
    fn extracts_peer_counts() {
        let peers = extract_peer_counts([
            "A00: 25.35 điểm, cao hơn: 1.234 thí sinh, bằng điểm: 56, tổng số thí sinh: 330.000",
            "D01 — cao hơn 10, bằng 2, tổng 0",
        ]);
        assert_eq!(
            peers.get(&Combination::A00),
            Some(&PeerCounts {
                above: 1234,
                at_score: 56,
                total: 330_000
            })
        );
        assert!(!peers.contains_key(&Combination::D01));
    }
}
