use serde::{Deserialize, Serialize};

use crate::error::TypeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSpec {
    pub kind: String,
    pub provider: String,
    pub model: String,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct PhaseConcurrency {
    #[serde(default)]
    pub generation: Option<u32>,
    #[serde(default)]
    pub single_doc_eval: Option<u32>,
    #[serde(default)]
    pub pairwise_eval: Option<u32>,
    #[serde(default)]
    pub combine: Option<u32>,
    #[serde(default)]
    pub post_combine_eval: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    Single,
    Pairwise,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeSpec {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TournamentStrategy {
    #[default]
    RoundRobin,
    Swiss,
    TopK,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    #[serde(default)]
    pub auto_run: bool,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default)]
    pub pairwise_top_n: Option<u32>,
    pub mode: EvalMode,
    #[serde(default)]
    pub judges: Vec<JudgeSpec>,
    #[serde(default)]
    pub tournament: TournamentStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CombineConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_iterations")]
    pub iterations_default: u32,
    pub generators: Vec<GeneratorSpec>,
    #[serde(default)]
    pub concurrency: PhaseConcurrency,
    pub eval: EvalConfig,
    #[serde(default)]
    pub combine: CombineConfig,
}

fn default_iterations() -> u32 {
    1
}

pub const DEFAULT_PHASE_CONCURRENCY: u32 = 2;
pub const MIN_PHASE_CONCURRENCY: u32 = 1;
pub const MAX_PHASE_CONCURRENCY: u32 = 20;

impl RunConfig {
    /// Parses and validates the recognized config keys; the caller freezes the
    /// original JSON value as the opaque stored blob once this succeeds.
    pub fn validate(raw: &serde_json::Value) -> Result<Self, TypeError> {
        let config: RunConfig = serde_json::from_value(raw.clone())
            .map_err(|e| TypeError::Validation(format!("invalid run config: {e}")))?;
        if config.generators.is_empty() {
            return Err(TypeError::Validation(
                "run config must list at least one generator".to_string(),
            ));
        }
        for field in [
            config.concurrency.generation,
            config.concurrency.single_doc_eval,
            config.concurrency.pairwise_eval,
            config.concurrency.combine,
            config.concurrency.post_combine_eval,
        ]
        .into_iter()
        .flatten()
        {
            if !(MIN_PHASE_CONCURRENCY..=MAX_PHASE_CONCURRENCY).contains(&field) {
                return Err(TypeError::Validation(format!(
                    "phase concurrency must be {MIN_PHASE_CONCURRENCY}..={MAX_PHASE_CONCURRENCY}, got {field}"
                )));
            }
        }
        if config.eval.mode != EvalMode::Single && config.eval.judges.is_empty() {
            return Err(TypeError::Validation(
                "pairwise/both eval mode requires at least one judge".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn concurrency_for(&self, phase: &str) -> u32 {
        let configured = match phase {
            "generation" => self.concurrency.generation,
            "single_doc_eval" => self.concurrency.single_doc_eval,
            "pairwise_eval" => self.concurrency.pairwise_eval,
            "combine" => self.concurrency.combine,
            "post_combine_eval" => self.concurrency.post_combine_eval,
            _ => None,
        };
        configured.unwrap_or(DEFAULT_PHASE_CONCURRENCY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_config() -> serde_json::Value {
        json!({
            "generators": [{"kind": "fpf", "provider": "openai", "model": "m-a", "iterations": 1}],
            "eval": {"mode": "both", "iterations": 1, "judges": [{"provider": "openai", "model": "m-a"}]},
            "concurrency": {"generation": 2}
        })
    }

    #[test]
    fn accepts_a_well_formed_config() {
        let config = RunConfig::validate(&valid_config()).unwrap();
        assert_eq!(config.concurrency_for("generation"), 2);
        assert_eq!(config.concurrency_for("combine"), DEFAULT_PHASE_CONCURRENCY);
    }

    #[test]
    fn rejects_empty_generators() {
        let mut raw = valid_config();
        raw["generators"] = json!([]);
        assert!(RunConfig::validate(&raw).is_err());
    }

    #[test]
    fn rejects_out_of_range_concurrency() {
        let mut raw = valid_config();
        raw["concurrency"]["generation"] = json!(21);
        assert!(RunConfig::validate(&raw).is_err());
    }

    #[test]
    fn rejects_pairwise_mode_without_judges() {
        let mut raw = valid_config();
        raw["eval"]["mode"] = json!("pairwise");
        raw["eval"]["judges"] = json!([]);
        assert!(RunConfig::validate(&raw).is_err());
    }
}
