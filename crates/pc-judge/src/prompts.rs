//! Rubric templates and the judge output-format contract: strict JSON, so parsing is a
//! single `serde_json::from_str` rather than screen-scraping prose.

use pc_types::Winner;
use serde::Deserialize;
use serde_json::Value;

/// Fixed single-doc grading dimensions. Per-run rubric overrides replace the rubric
/// text for a dimension, not the dimension set itself.
pub const DIMENSIONS: [&str; 5] = ["accuracy", "clarity", "completeness", "relevance", "coherence"];

pub fn default_rubric(dimension: &str) -> &'static str {
    match dimension {
        "accuracy" => "Score how factually correct the artifact is given the source document. 5 = no factual errors, 1 = pervasively wrong.",
        "clarity" => "Score how easy the artifact is to read and follow. 5 = clear and well organized, 1 = incoherent.",
        "completeness" => "Score how thoroughly the artifact covers the source document's content. 5 = nothing material omitted, 1 = large gaps.",
        "relevance" => "Score how on-topic the artifact stays relative to the source document. 5 = fully on-topic, 1 = mostly irrelevant.",
        "coherence" => "Score how internally consistent the artifact's claims and structure are. 5 = fully consistent, 1 = self-contradictory.",
        _ => "Score the artifact on the named dimension from 1 (worst) to 5 (best).",
    }
}

#[derive(Debug, Deserialize)]
struct SingleVerdict {
    score: u8,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct PairwiseVerdict {
    winner: String,
}

pub fn build_single_prompt(artifact_content: &str, dimension: &str, rubric: &str) -> String {
    format!(
        "Grade the following artifact on the dimension \"{dimension}\".\n\
         Rubric: {rubric}\n\n\
         Artifact:\n{artifact_content}\n\n\
         Respond with a single JSON object of the exact shape \
         {{\"score\": <integer 1-5>, \"rationale\": \"<one sentence>\"}} and nothing else."
    )
}

pub fn build_reformat_prompt(artifact_content: &str, dimension: &str, rubric: &str, prior_response: &str) -> String {
    format!(
        "Your previous response could not be parsed as the required JSON verdict. \
         Previous response was:\n{prior_response}\n\n\
         Re-grade the following artifact on the dimension \"{dimension}\".\n\
         Rubric: {rubric}\n\n\
         Artifact:\n{artifact_content}\n\n\
         Respond with ONLY a single JSON object of the exact shape \
         {{\"score\": <integer 1-5>, \"rationale\": \"<one sentence>\"}}."
    )
}

/// Parses a single-doc verdict, enforcing the `1..=5` score range. An out-of-range
/// score is treated the same as a parse failure.
pub fn parse_single_response(response: &str) -> Option<(u8, String)> {
    let verdict: SingleVerdict = serde_json::from_str(response.trim()).ok()?;
    if (1..=5).contains(&verdict.score) {
        Some((verdict.score, verdict.rationale))
    } else {
        None
    }
}

pub fn build_pairwise_prompt(first: &str, second: &str) -> String {
    format!(
        "Compare the following two artifacts and decide which better satisfies the same \
         source document. Respond with ONLY a single JSON object of the exact shape \
         {{\"winner\": \"first\" | \"second\" | \"tie\"}}.\n\n\
         Artifact (first):\n{first}\n\n\
         Artifact (second):\n{second}"
    )
}

pub fn parse_pairwise_response(response: &str) -> Option<Winner> {
    let raw: Value = serde_json::from_str(response.trim()).ok()?;
    let verdict: PairwiseVerdict = serde_json::from_value(raw).ok()?;
    match verdict.winner.as_str() {
        "first" => Some(Winner::A),
        "second" => Some(Winner::B),
        "tie" => Some(Winner::Tie),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_single_verdict() {
        let (score, rationale) = parse_single_response(r#"{"score": 4, "rationale": "solid"}"#).unwrap();
        assert_eq!(score, 4);
        assert_eq!(rationale, "solid");
    }

    #[test]
    fn rejects_an_out_of_range_score() {
        assert!(parse_single_response(r#"{"score": 7, "rationale": "bad"}"#).is_none());
    }

    #[test]
    fn rejects_unparseable_prose() {
        assert!(parse_single_response("The artifact looks pretty good, I'd say a 4.").is_none());
    }

    #[test]
    fn parses_each_pairwise_outcome() {
        assert_eq!(parse_pairwise_response(r#"{"winner": "first"}"#), Some(Winner::A));
        assert_eq!(parse_pairwise_response(r#"{"winner": "second"}"#), Some(Winner::B));
        assert_eq!(parse_pairwise_response(r#"{"winner": "tie"}"#), Some(Winner::Tie));
        assert!(parse_pairwise_response(r#"{"winner": "neither"}"#).is_none());
    }
}
