//! CLI-local configuration file: the server URL and credential the other
//! subcommands talk to. Grounded on the engine binary's `resolve_state_dir`
//! (env var override, else a dotdir under the cwd) generalized to a small
//! JSON settings file instead of the full engine config store.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub server_url: String,
    pub api_key: Option<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
        }
    }
}

pub fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("PIPELINE_ENGINE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".pipeline-engine")
}

pub fn config_path(state_dir: &Path) -> PathBuf {
    state_dir.join("config.json")
}

pub fn load(state_dir: &Path) -> anyhow::Result<CliConfig> {
    let path = config_path(state_dir);
    match std::fs::read(&path) {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CliConfig::default()),
        Err(e) => Err(e.into()),
    }
}

pub fn save(state_dir: &Path, config: &CliConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let path = config_path(state_dir);
    std::fs::write(path, serde_json::to_vec_pretty(config)?)?;
    Ok(())
}
