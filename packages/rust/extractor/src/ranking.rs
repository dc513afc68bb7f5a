//! Derived ranking facts: combination totals, percentiles and rank positions.

use std::collections::BTreeMap;

use admitsync_shared::{
    ALL_COMBINATIONS, Candidate, Combination, CombinationRank, Provenance, Subject,
};
use chrono::{Datelike, Utc};

use crate::scores::{PeerCounts, ScoreSheet};

/// Share of a normal distribution within one standard deviation of the mean, in percent.
const ONE_SIGMA_PERCENT: f64 = 34.1;

/// Sum of the combination's required subjects, only when every one is present.
pub fn combination_total(combo: Combination, scores: &BTreeMap<Subject, f64>) -> Option<f64> {
    let mut total = 0.0;
    for subject in combo.subjects() {
        total += scores.get(&subject)?;
    }
    Some(round2(total))
}

/// Combinations whose required subjects are all present, in table order.
pub fn eligible_combinations(scores: &BTreeMap<Subject, f64>) -> Vec<Combination> {
    ALL_COMBINATIONS
        .into_iter()
        .filter(|c| combination_total(*c, scores).is_some())
        .collect()
}

/// Normal-approximation percentile: `clamp(0, 100, 50 + 34.1·z)`.
pub fn approximate_percentile(combo: Combination, total: f64) -> f64 {
    let stats = combo.stats();
    let z = (total - stats.mean) / stats.stddev;
    (50.0 + ONE_SIGMA_PERCENT * z).clamp(0.0, 100.0)
}

/// Percentile from scraped counts: share of the pool strictly below the total.
pub fn counted_percentile(peers: &PeerCounts) -> f64 {
    let below = peers
        .total
        .saturating_sub(peers.above)
        .saturating_sub(peers.at_score);
    (100.0 * f64::from(below) / f64::from(peers.total)).clamp(0.0, 100.0)
}

/// Build one ranking per eligible combination.
///
/// Scraped peer counts are used when present for a combination; otherwise
/// the percentile and rank are estimated from the reference constants.
pub fn build_rankings(
    scores: &BTreeMap<Subject, f64>,
    peers: &BTreeMap<Combination, PeerCounts>,
) -> Vec<CombinationRank> {
    ALL_COMBINATIONS
        .into_iter()
        .filter_map(|combo| {
            let total_score = combination_total(combo, scores)?;
            let rank = match peers.get(&combo) {
                Some(counts) if counts.total > 0 => CombinationRank {
                    combination: combo,
                    total_score,
                    rank_position: counts.above.saturating_add(1),
                    candidates_at_score: Some(counts.at_score),
                    candidates_above: Some(counts.above),
                    total_candidates: counts.total,
                    percentile: round2(counted_percentile(counts)),
                    estimated: false,
                },
                _ => {
                    let pool = combo.stats().pool;
                    let percentile = approximate_percentile(combo, total_score);
                    let behind = (f64::from(pool) * (100.0 - percentile) / 100.0).round() as u32;
                    CombinationRank {
                        combination: combo,
                        total_score,
                        rank_position: behind.saturating_add(1).min(pool),
                        candidates_at_score: None,
                        candidates_above: None,
                        total_candidates: pool,
                        percentile: round2(percentile),
                        estimated: true,
                    }
                }
            };
            Some(rank)
        })
        .collect()
}

/// Turn a score sheet into a candidate with its derived facts filled in.
pub fn assemble_candidate(
    number: &str,
    region: &str,
    sheet: ScoreSheet,
    provenance: Provenance,
) -> Candidate {
    let fetched_at = Utc::now();
    Candidate {
        number: number.to_string(),
        region: region.to_string(),
        exam_year: sheet.exam_year.unwrap_or_else(|| fetched_at.year()),
        eligible: eligible_combinations(&sheet.scores),
        rankings: build_rankings(&sheet.scores, &sheet.peers),
        scores: sheet.scores,
        provenance,
        fetched_at,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(Subject, f64)]) -> BTreeMap<Subject, f64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn total_requires_every_subject() {
        let s = scores(&[(Subject::Math, 8.0), (Subject::Physics, 7.5)]);
        assert_eq!(combination_total(Combination::A00, &s), None);

        let s = scores(&[
            (Subject::Math, 8.0),
            (Subject::Physics, 7.5),
            (Subject::Chemistry, 9.25),
        ]);
        assert_eq!(combination_total(Combination::A00, &s), Some(24.75));
    }

    #[test]
    fn eligible_set_follows_coverage() {
        let s = scores(&[
            (Subject::Math, 8.0),
            (Subject::Literature, 7.0),
            (Subject::English, 9.0),
            (Subject::Physics, 6.0),
        ]);
        assert_eq!(
            eligible_combinations(&s),
            vec![Combination::A01, Combination::C01, Combination::D01]
        );
    }

    #[test]
    fn percentile_is_monotone_in_total() {
        for combo in ALL_COMBINATIONS {
            let mut last = -1.0;
            let mut total = 0.0;
            while total <= 30.0 {
                let p = approximate_percentile(combo, total);
                assert!(p >= last, "{combo}: {p} < {last} at {total}");
                assert!((0.0..=100.0).contains(&p));
                last = p;
                total += 0.25;
            }
        }
    }

    #[test]
    fn percentile_at_mean_is_fifty() {
        let mean = Combination::D01.stats().mean;
        assert!((approximate_percentile(Combination::D01, mean) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn rankings_prefer_scraped_counts() {
        let s = scores(&[
            (Subject::Math, 9.0),
            (Subject::Physics, 8.5),
            (Subject::Chemistry, 8.75),
            (Subject::English, 9.0),
        ]);
        let mut peers = BTreeMap::new();
        peers.insert(
            Combination::A00,
            PeerCounts {
                above: 99,
                at_score: 10,
                total: 1000,
            },
        );

        let ranks = build_rankings(&s, &peers);
        assert_eq!(ranks.len(), 3); // A00, A01, D07

        let a00 = ranks.iter().find(|r| r.combination == Combination::A00).unwrap();
        assert!(!a00.estimated);
        assert_eq!(a00.rank_position, 100);
        assert_eq!(a00.percentile, 89.1);

        let a01 = ranks.iter().find(|r| r.combination == Combination::A01).unwrap();
        assert!(a01.estimated);
        assert_eq!(a01.total_candidates, Combination::A01.stats().pool);
        assert!(a01.rank_position >= 1);
        assert!(a01.percentile > 50.0);
    }

    #[test]
    fn assembled_candidate_carries_derived_facts() {
        let sheet = ScoreSheet {
            scores: scores(&[
                (Subject::Math, 8.0),
                (Subject::Literature, 7.0),
                (Subject::English, 6.5),
            ]),
            peers: BTreeMap::new(),
            exam_year: Some(2024),
        };
        let candidate = assemble_candidate("12345678", "ha-noi", sheet, Provenance::StrategyA);
        assert_eq!(candidate.exam_year, 2024);
        assert_eq!(candidate.eligible, vec![Combination::D01]);
        assert_eq!(candidate.rankings.len(), 1);
        assert_eq!(candidate.rankings[0].total_score, 21.5);
        assert!(candidate.is_complete());
    }
}
