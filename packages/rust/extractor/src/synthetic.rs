//! Strategy C: deterministic, non-authoritative reference data.
//!
//! Only used for demos and offline development. The same candidate number
//! always yields the same record.

use std::collections::BTreeMap;

use admitsync_shared::{Subject, validate_candidate_number};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::scores::ScoreSheet;

/// Every candidate sits these.
const MANDATORY: [Subject; 3] = [Subject::Math, Subject::Literature, Subject::English];
const NATURAL_SCIENCES: [Subject; 3] = [Subject::Physics, Subject::Chemistry, Subject::Biology];
const SOCIAL_SCIENCES: [Subject; 3] = [Subject::History, Subject::Geography, Subject::Civics];

/// Generate a score sheet for `number` from the subject reference distributions.
///
/// Returns `None` for numbers that fail the shape check.
pub fn synthesize(number: &str) -> Option<ScoreSheet> {
    validate_candidate_number(number).ok()?;
    let mut rng = StdRng::seed_from_u64(seed(number));

    let track = if rng.gen_bool(0.5) {
        NATURAL_SCIENCES
    } else {
        SOCIAL_SCIENCES
    };

    let scores: BTreeMap<Subject, f64> = MANDATORY
        .into_iter()
        .chain(track)
        .map(|subject| {
            let dist = subject.reference();
            let raw = dist.mean + dist.stddev * standard_normal(&mut rng);
            (subject, quantize(raw))
        })
        .collect();

    Some(ScoreSheet {
        scores,
        peers: BTreeMap::new(),
        exam_year: None,
    })
}

fn seed(number: &str) -> u64 {
    number
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |acc, b| {
            (acc ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        })
}

/// Irwin-Hall approximation: sum of 12 uniforms minus 6.
fn standard_normal(rng: &mut StdRng) -> f64 {
    (0..12).map(|_| rng.r#gen::<f64>()).sum::<f64>() - 6.0
}

/// Clamp to the subject range and round to the 0.25 grading step.
fn quantize(raw: f64) -> f64 {
    ((raw.clamp(0.0, 10.0) * 4.0).round() / 4.0).clamp(0.0, 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_number_same_record() {
        let a = synthesize("12345678").unwrap();
        let b = synthesize("12345678").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.scores.len(), 6);
        assert!(a.peers.is_empty());
    }

    #[test]
    fn scores_are_plausible() {
        for n in 10_000_000..10_000_050u32 {
            let sheet = synthesize(&n.to_string()).unwrap();
            for subject in MANDATORY {
                assert!(sheet.scores.contains_key(&subject));
            }
            for score in sheet.scores.values() {
                assert!((0.0..=10.0).contains(score));
                assert_eq!((score * 4.0).fract(), 0.0);
            }
        }
    }

    #[test]
    fn invalid_numbers_yield_nothing() {
        assert!(synthesize("00000000").is_none());
        assert!(synthesize("12ab5678").is_none());
    }
}
