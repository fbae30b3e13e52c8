use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ArtifactId, RunId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRow {
    pub run_id: RunId,
    pub artifact_id: ArtifactId,
    pub judge_model: String,
    pub dimension: String,
    pub iteration: u32,
    /// 1..=5, or None when `failed_parse` is set.
    pub score: Option<u8>,
    pub rationale: Option<String>,
    pub failed_parse: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    A,
    B,
    Tie,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairwiseResult {
    pub run_id: RunId,
    pub artifact_a: ArtifactId,
    pub artifact_b: ArtifactId,
    pub judge_model: String,
    pub iteration: u32,
    /// None when the judge call failed terminally (does not update Elo).
    pub winner: Option<Winner>,
    pub created_at: DateTime<Utc>,
}

/// Canonicalizes an unordered artifact pair to `(a, b)` with `a < b`.
/// Returns whether the inputs were swapped, so callers can undo a presentation-order flip
/// recorded separately in call metadata.
pub fn canonicalize_pair(x: ArtifactId, y: ArtifactId) -> (ArtifactId, ArtifactId, bool) {
    if x <= y {
        (x, y, false)
    } else {
        (y, x, true)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EloRating {
    pub run_id: RunId,
    pub artifact_id: ArtifactId,
    pub rating: f64,
    pub games_played: u32,
}

pub const ELO_START: f64 = 1500.0;
pub const ELO_K: f64 = 32.0;

impl EloRating {
    pub fn starting(run_id: RunId, artifact_id: ArtifactId) -> Self {
        Self {
            run_id,
            artifact_id,
            rating: ELO_START,
            games_played: 0,
        }
    }
}

/// Standard Elo update for one pairwise outcome. `score_a` is 1.0 for an A
/// win, 0.0 for a B win, 0.5 for a tie.
pub fn elo_update(rating_a: f64, rating_b: f64, score_a: f64) -> (f64, f64) {
    let expected_a = 1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0));
    let expected_b = 1.0 - expected_a;
    let score_b = 1.0 - score_a;
    let new_a = rating_a + ELO_K * (score_a - expected_a);
    let new_b = rating_b + ELO_K * (score_b - expected_b);
    (new_a, new_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_pair_is_symmetric() {
        let a = ArtifactId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ArtifactId::new();
        assert_eq!(canonicalize_pair(a, b), canonicalize_pair(b, a));
    }

    #[test]
    fn swapping_sides_and_inverting_winner_yields_the_same_update() {
        let (new_a, new_b) = elo_update(1500.0, 1600.0, 1.0);
        let (swapped_b, swapped_a) = elo_update(1600.0, 1500.0, 0.0);
        assert!((new_a - swapped_a).abs() < 1e-9);
        assert!((new_b - swapped_b).abs() < 1e-9);
    }

    #[test]
    fn tie_moves_both_ratings_toward_each_other() {
        let (new_a, new_b) = elo_update(1500.0, 1700.0, 0.5);
        assert!(new_a > 1500.0);
        assert!(new_b < 1700.0);
    }
}
