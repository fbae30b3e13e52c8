//! Single-doc grading retries a bounded number of times with a reformat prompt
//! before giving up; pairwise tournaments canonicalize the pair, flip presentation
//! order to fight position bias, then hand the outcome to the pure Elo update in
//! `pc_types::eval`.

pub mod prompts;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pc_providers::{JudgeClient, ProviderError};
use pc_ratelimit::RateLimiter;
use pc_store::{MetadataStore, StoreError};
use pc_types::{
    canonicalize_pair, elo_update, Artifact, EloRating, EvaluationRow, PairwiseResult, RunId,
    Winner,
};
use thiserror::Error;

/// Single-doc grading retries up to this many times total, reformatting the prompt
/// after each parse failure, before giving up and recording `failed_parse`.
const MAX_SINGLE_ATTEMPTS: u32 = 3;
const RATE_LIMIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("rate limit error: {0}")]
    RateLimit(String),
}

pub struct JudgeRunner {
    client: Arc<dyn JudgeClient>,
    limiter: Arc<RateLimiter>,
    store: Arc<MetadataStore>,
}

impl JudgeRunner {
    pub fn new(client: Arc<dyn JudgeClient>, limiter: Arc<RateLimiter>, store: Arc<MetadataStore>) -> Self {
        Self { client, limiter, store }
    }

    /// Grades one `(artifact, judge_model, dimension, iteration)` cell. Never
    /// overwrites a prior successful row with the same unique key.
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate_single(
        &self,
        run_id: RunId,
        artifact: &Artifact,
        artifact_content: &str,
        judge_provider: &str,
        judge_model: &str,
        dimension: &str,
        rubric_override: Option<&str>,
        iteration: u32,
    ) -> Result<EvaluationRow, JudgeError> {
        if let Some(existing) = self
            .store
            .list_evaluation_rows_by_run(&run_id)
            .await?
            .into_iter()
            .find(|row| {
                row.artifact_id == artifact.artifact_id
                    && row.judge_model == judge_model
                    && row.dimension == dimension
                    && row.iteration == iteration
                    && !row.failed_parse
            })
        {
            return Ok(existing);
        }

        let rubric = rubric_override.unwrap_or_else(|| prompts::default_rubric(dimension));
        let mut last_response = String::new();
        let mut parsed = None;

        for attempt in 0..MAX_SINGLE_ATTEMPTS {
            let prompt = if attempt == 0 {
                prompts::build_single_prompt(artifact_content, dimension, rubric)
            } else {
                prompts::build_reformat_prompt(artifact_content, dimension, rubric, &last_response)
            };

            let permit = self
                .limiter
                .acquire(judge_provider, judge_model, estimate_tokens(&prompt), RATE_LIMIT_TIMEOUT)
                .await
                .map_err(|e| JudgeError::RateLimit(e.to_string()))?;

            let endpoint = format!("https://{judge_provider}/judge");
            let credentials = HashMap::new();
            let call = self.client.judge(&endpoint, &credentials, &prompt).await;

            match call {
                Ok((response, headers)) => {
                    self.limiter.release(permit, None, Some(&headers)).await;
                    last_response = response.clone();
                    if let Some((score, rationale)) = prompts::parse_single_response(&response) {
                        parsed = Some((score, rationale));
                        break;
                    }
                }
                Err(e) => {
                    self.limiter.release(permit, None, None).await;
                    tracing::warn!(attempt, error = %e, "judge call failed, retrying");
                }
            }
        }

        let row = EvaluationRow {
            run_id,
            artifact_id: artifact.artifact_id,
            judge_model: judge_model.to_string(),
            dimension: dimension.to_string(),
            iteration,
            score: parsed.as_ref().map(|(score, _)| *score),
            rationale: parsed.as_ref().map(|(_, rationale)| rationale.clone()),
            failed_parse: parsed.is_none(),
            created_at: chrono::Utc::now(),
        };
        self.store.insert_evaluation_row(&row).await?;
        Ok(row)
    }

    /// Judges one scheduled pair, updates Elo on a decisive outcome, and persists the
    /// pairwise result idempotently (safe to call again for the same unique key).
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate_pairwise(
        &self,
        run_id: RunId,
        artifact_a: &Artifact,
        artifact_b: &Artifact,
        content_a: &str,
        content_b: &str,
        judge_provider: &str,
        judge_model: &str,
        iteration: u32,
    ) -> Result<PairwiseResult, JudgeError> {
        let (canon_a, canon_b, was_swapped) = canonicalize_pair(artifact_a.artifact_id, artifact_b.artifact_id);

        if let Some(existing) = self
            .store
            .list_pairwise_results_by_run(&run_id)
            .await?
            .into_iter()
            .find(|r| {
                r.artifact_a == canon_a && r.artifact_b == canon_b && r.judge_model == judge_model && r.iteration == iteration
            })
        {
            return Ok(existing);
        }

        // `content_a`/`content_b` are caller-supplied in canonical (a, b) order already;
        // `was_swapped` only describes how (artifact_a, artifact_b) relates to (canon_a, canon_b).
        let (canon_content_a, canon_content_b) = if was_swapped {
            (content_b, content_a)
        } else {
            (content_a, content_b)
        };

        // Flip presentation order 50% of the time to mitigate position bias; undo it
        // when interpreting the judge's verdict.
        let flip_presentation = rand::random::<bool>();
        let (presented_first, presented_second) = if flip_presentation {
            (canon_content_b, canon_content_a)
        } else {
            (canon_content_a, canon_content_b)
        };

        let prompt = prompts::build_pairwise_prompt(presented_first, presented_second);
        let permit = self
            .limiter
            .acquire(judge_provider, judge_model, estimate_tokens(&prompt), RATE_LIMIT_TIMEOUT)
            .await
            .map_err(|e| JudgeError::RateLimit(e.to_string()))?;

        let endpoint = format!("https://{judge_provider}/judge");
        let call = self.client.judge(&endpoint, &HashMap::new(), &prompt).await;

        let winner = match call {
            Ok((response, headers)) => {
                self.limiter.release(permit, None, Some(&headers)).await;
                prompts::parse_pairwise_response(&response).map(|presented_winner| {
                    if flip_presentation {
                        flip_winner(presented_winner)
                    } else {
                        presented_winner
                    }
                })
            }
            Err(e) => {
                self.limiter.release(permit, None, None).await;
                tracing::warn!(error = %e, "pairwise judge call failed terminally");
                None
            }
        };

        let result = PairwiseResult {
            run_id,
            artifact_a: canon_a,
            artifact_b: canon_b,
            judge_model: judge_model.to_string(),
            iteration,
            winner,
            created_at: chrono::Utc::now(),
        };
        self.store.insert_pairwise_result(&result).await?;

        if let Some(winner) = winner {
            self.apply_elo(run_id, canon_a, canon_b, winner).await?;
        }
        Ok(result)
    }

    async fn apply_elo(
        &self,
        run_id: RunId,
        artifact_a: pc_types::ArtifactId,
        artifact_b: pc_types::ArtifactId,
        winner: Winner,
    ) -> Result<(), JudgeError> {
        let rating_a = self
            .store
            .get_elo_rating(&run_id, &artifact_a)
            .await?
            .unwrap_or_else(|| EloRating::starting(run_id, artifact_a));
        let rating_b = self
            .store
            .get_elo_rating(&run_id, &artifact_b)
            .await?
            .unwrap_or_else(|| EloRating::starting(run_id, artifact_b));

        let score_a = match winner {
            Winner::A => 1.0,
            Winner::B => 0.0,
            Winner::Tie => 0.5,
        };
        let (new_a, new_b) = elo_update(rating_a.rating, rating_b.rating, score_a);

        self.store
            .upsert_elo_rating(&EloRating {
                run_id,
                artifact_id: artifact_a,
                rating: new_a,
                games_played: rating_a.games_played + 1,
            })
            .await?;
        self.store
            .upsert_elo_rating(&EloRating {
                run_id,
                artifact_id: artifact_b,
                rating: new_b,
                games_played: rating_b.games_played + 1,
            })
            .await?;
        Ok(())
    }
}

fn estimate_tokens(prompt: &str) -> u64 {
    (prompt.len() / 4).max(1) as u64
}

/// Undoes a presentation-order flip: a verdict for "first"/"second" as shown to the
/// judge is translated back to a verdict over the canonical (a, b) pair.
fn flip_winner(winner: Winner) -> Winner {
    match winner {
        Winner::A => Winner::B,
        Winner::B => Winner::A,
        Winner::Tie => Winner::Tie,
    }
}

/// Builds the scheduled pairs for a tournament strategy.
pub fn schedule_pairs(
    strategy: pc_types::TournamentStrategy,
    artifacts: &[Artifact],
    ratings: &HashMap<pc_types::ArtifactId, f64>,
    top_n: Option<u32>,
) -> Vec<(pc_types::ArtifactId, pc_types::ArtifactId)> {
    match strategy {
        pc_types::TournamentStrategy::RoundRobin => round_robin_pairs(artifacts),
        pc_types::TournamentStrategy::Swiss => swiss_pairs(artifacts, ratings),
        pc_types::TournamentStrategy::TopK => {
            top_k_pairs(artifacts, ratings, top_n.unwrap_or(1) as usize)
        }
    }
}

fn round_robin_pairs(artifacts: &[Artifact]) -> Vec<(pc_types::ArtifactId, pc_types::ArtifactId)> {
    let mut pairs = Vec::new();
    for i in 0..artifacts.len() {
        for j in (i + 1)..artifacts.len() {
            pairs.push((artifacts[i].artifact_id, artifacts[j].artifact_id));
        }
    }
    pairs
}

fn swiss_pairs(
    artifacts: &[Artifact],
    ratings: &HashMap<pc_types::ArtifactId, f64>,
) -> Vec<(pc_types::ArtifactId, pc_types::ArtifactId)> {
    let mut sorted: Vec<_> = artifacts.to_vec();
    sorted.sort_by(|a, b| {
        let ra = ratings.get(&a.artifact_id).copied().unwrap_or(pc_types::ELO_START);
        let rb = ratings.get(&b.artifact_id).copied().unwrap_or(pc_types::ELO_START);
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });
    sorted
        .chunks(2)
        .filter(|chunk| chunk.len() == 2)
        .map(|chunk| (chunk[0].artifact_id, chunk[1].artifact_id))
        .collect()
}

fn top_k_pairs(
    artifacts: &[Artifact],
    ratings: &HashMap<pc_types::ArtifactId, f64>,
    k: usize,
) -> Vec<(pc_types::ArtifactId, pc_types::ArtifactId)> {
    if k >= artifacts.len() {
        return round_robin_pairs(artifacts);
    }
    let mut sorted: Vec<_> = artifacts.to_vec();
    sorted.sort_by(|a, b| {
        let ra = ratings.get(&a.artifact_id).copied().unwrap_or(pc_types::ELO_START);
        let rb = ratings.get(&b.artifact_id).copied().unwrap_or(pc_types::ELO_START);
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });
    let top = &sorted[..k];
    let rest = &sorted[k..];
    let mut pairs = Vec::new();
    for t in top {
        for r in rest {
            pairs.push((t.artifact_id, r.artifact_id));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use pc_types::GeneratorKind;

    fn sample_artifact(run_id: RunId) -> Artifact {
        Artifact::new(
            run_id,
            None,
            GeneratorKind::Fpf,
            "m-a".to_string(),
            "runs/r/a.txt".to_string(),
            "deadbeef".to_string(),
            0.01,
            100,
            500,
            serde_json::json!({}),
        )
    }

    #[test]
    fn round_robin_covers_every_unordered_pair() {
        let run_id = RunId::new();
        let artifacts = vec![sample_artifact(run_id), sample_artifact(run_id), sample_artifact(run_id)];
        let pairs = round_robin_pairs(&artifacts);
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn top_k_pairs_each_top_artifact_against_every_other() {
        let run_id = RunId::new();
        let artifacts: Vec<_> = (0..4).map(|_| sample_artifact(run_id)).collect();
        let ratings = HashMap::new();
        let pairs = top_k_pairs(&artifacts, &ratings, 1);
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn top_k_at_least_population_size_falls_back_to_round_robin() {
        let run_id = RunId::new();
        let artifacts: Vec<_> = (0..4).map(|_| sample_artifact(run_id)).collect();
        let ratings = HashMap::new();
        assert_eq!(top_k_pairs(&artifacts, &ratings, 4).len(), round_robin_pairs(&artifacts).len());
        assert_eq!(top_k_pairs(&artifacts, &ratings, 10).len(), round_robin_pairs(&artifacts).len());
    }
}
