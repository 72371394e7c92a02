use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Configuration for the companion backend.
///
/// Loaded from `solace.toml` (or the path in `SOLACE_CONFIG`), with every
/// field optional in the file. Environment variables override the LLM
/// connection settings so the backend can be pointed at a different model
/// server without editing the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Companion identity
    #[serde(default = "default_persona_name")]
    pub persona_name: String,

    // Persistence
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Scheduler cadence
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_decision_interval")]
    pub decision_interval_secs: u64,
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_secs: u64,

    // Circuit breaker for the model backend
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,

    // Bounded trackers
    #[serde(default = "default_max_goals")]
    pub max_goals: usize,
    #[serde(default = "default_action_log_capacity")]
    pub action_log_capacity: usize,

    // Interval self-tuning (advisory, applied via the control surface)
    #[serde(default = "default_true")]
    pub optimization_enabled: bool,

    // Autonomous capability defaults
    #[serde(default = "default_true")]
    pub allow_web_research: bool,
    #[serde(default = "default_true")]
    pub allow_learning: bool,
    #[serde(default = "default_true")]
    pub allow_messaging: bool,

    // Shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    // Control API
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
}

fn default_llm_url() -> String {
    "http://127.0.0.1:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_persona_name() -> String {
    "Solace".to_string()
}

fn default_database_path() -> String {
    "solace.db".to_string()
}

fn default_tick_interval() -> u64 {
    5
}

fn default_task_timeout() -> u64 {
    120
}

fn default_decision_interval() -> u64 {
    30
}

fn default_decision_timeout() -> u64 {
    30
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> u64 {
    300
}

fn default_max_goals() -> usize {
    10
}

fn default_action_log_capacity() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_api_bind() -> String {
    "127.0.0.1:8790".to_string()
}

impl Default for CompanionConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize from defaults")
    }
}

impl CompanionConfig {
    pub fn config_path() -> PathBuf {
        env::var("SOLACE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("solace.toml"))
    }

    /// Load config from disk, falling back to defaults when the file is
    /// missing or unparsable. Env overrides are applied last.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut config = if path.exists() {
            match Self::load_from(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("{:#}; falling back to defaults", e);
                    Self::default()
                }
            }
        } else {
            tracing::info!("No config file at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        config
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }
        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key);
            }
        }
        if let Ok(bind) = env::var("SOLACE_API_BIND") {
            self.api_bind = bind;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: CompanionConfig = toml::from_str("").unwrap();
        assert_eq!(config.tick_interval_secs, 5);
        assert_eq!(config.task_timeout_secs, 120);
        assert_eq!(config.decision_interval_secs, 30);
        assert_eq!(config.breaker_failure_threshold, 5);
        assert_eq!(config.breaker_cooldown_secs, 300);
        assert_eq!(config.max_goals, 10);
        assert_eq!(config.action_log_capacity, 100);
        assert!(config.optimization_enabled);
        assert!(config.llm_api_key.is_none());
    }

    #[test]
    fn load_from_reads_a_file_and_reports_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solace.toml");
        std::fs::write(&path, "persona_name = \"Iris\"\n").unwrap();

        let config = CompanionConfig::load_from(&path).unwrap();
        assert_eq!(config.persona_name, "Iris");
        assert_eq!(config.tick_interval_secs, 5);

        let missing = dir.path().join("missing.toml");
        assert!(CompanionConfig::load_from(&missing).is_err());
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config: CompanionConfig = toml::from_str(
            r#"
            llm_model = "qwen2.5"
            tick_interval_secs = 2
            persona_name = "Iris"
            "#,
        )
        .unwrap();
        assert_eq!(config.llm_model, "qwen2.5");
        assert_eq!(config.tick_interval_secs, 2);
        assert_eq!(config.persona_name, "Iris");
        assert_eq!(config.task_timeout_secs, 120);
        assert_eq!(config.database_path, "solace.db");
    }
}
