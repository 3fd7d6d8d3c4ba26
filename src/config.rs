use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Remote OpenAI-compatible chat-completions endpoint.
    Remote,
    /// Local OpenAI-compatible server (ollama / llama.cpp style), no API key.
    Local,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autonomy {
    /// Pause for confirmation before risk-bearing commands.
    Interactive,
    /// Execute without confirmation, except where safe mode insists.
    Automatic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_idle_steps")]
    pub max_idle_steps: usize,
    #[serde(default = "default_safe_mode")]
    pub safe_mode: bool,
    #[serde(default = "default_autonomy")]
    pub autonomy: Autonomy,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    /// Extra regex patterns classified Blocked, on top of the built-in set.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    /// Extra regex patterns classified Dangerous.
    #[serde(default)]
    pub dangerous_patterns: Vec<String>,
    #[serde(default = "default_history_max_messages")]
    pub history_max_messages: usize,
    #[serde(default = "default_history_max_chars")]
    pub history_max_chars: usize,
    #[serde(default = "default_complete_history_lines")]
    pub complete_history_lines: usize,
}

impl Default for Config {
    fn default() -> Self {
        let (base_url, model, api_key_env) = backend_defaults(Backend::Remote);
        Self {
            backend: default_backend(),
            base_url,
            model,
            api_key_env,
            api_key: None,
            max_steps: default_max_steps(),
            max_idle_steps: default_max_idle_steps(),
            safe_mode: default_safe_mode(),
            autonomy: default_autonomy(),
            command_timeout_secs: default_command_timeout_secs(),
            llm_timeout_secs: default_llm_timeout_secs(),
            blocked_patterns: Vec::new(),
            dangerous_patterns: Vec::new(),
            history_max_messages: default_history_max_messages(),
            history_max_chars: default_history_max_chars(),
            complete_history_lines: default_complete_history_lines(),
        }
    }
}

fn default_backend() -> Backend {
    Backend::Remote
}

fn default_max_steps() -> usize {
    10
}

fn default_max_idle_steps() -> usize {
    2
}

fn default_safe_mode() -> bool {
    true
}

fn default_autonomy() -> Autonomy {
    Autonomy::Interactive
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_history_max_messages() -> usize {
    40
}

fn default_history_max_chars() -> usize {
    60_000
}

fn default_complete_history_lines() -> usize {
    200
}

/// Defaults applied when switching the backend without an explicit URL.
pub fn backend_defaults(backend: Backend) -> (String, String, String) {
    match backend {
        Backend::Remote => (
            "https://api.openai.com/v1/chat/completions".to_string(),
            "gpt-4o-mini".to_string(),
            "OPENAI_API_KEY".to_string(),
        ),
        Backend::Local => (
            "http://127.0.0.1:11434/v1/chat/completions".to_string(),
            "llama3.1".to_string(),
            String::new(),
        ),
    }
}

pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Cannot resolve home directory")?;
    Ok(home.join(".shellpilot"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn load_config_or_default() -> Result<Config> {
    let path = config_path()?;
    if !path.exists() {
        let cfg = Config::default();
        save_config(&cfg)?;
        return Ok(cfg);
    }

    let text =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&text).with_context(|| format!("Invalid config: {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config) -> Result<()> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config dir {}", parent.display()))?;
    }
    let text = toml::to_string_pretty(cfg)?;
    fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Resolve the API key for the remote backend. The local backend never
/// needs one. A missing key is a startup-time fatal error, not a runtime one.
pub fn resolve_api_key(cfg: &Config) -> Result<Option<String>, AgentError> {
    if cfg.backend == Backend::Local {
        return Ok(None);
    }
    if !cfg.api_key_env.is_empty()
        && let Ok(v) = env::var(&cfg.api_key_env)
        && !v.trim().is_empty()
    {
        return Ok(Some(v));
    }
    if let Some(v) = &cfg.api_key
        && !v.trim().is_empty()
    {
        return Ok(Some(v.clone()));
    }
    Err(AgentError::Configuration(format!(
        "missing API key for model {}. Set env var {} or run `shellpilot config set --api-key ...`",
        cfg.model, cfg.api_key_env
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let cfg = Config::default();
        assert_eq!(cfg.max_steps, 10);
        assert_eq!(cfg.max_idle_steps, 2);
        assert!(cfg.safe_mode);
        assert_eq!(cfg.autonomy, Autonomy::Interactive);
    }

    #[test]
    fn config_toml_round_trip() {
        let mut cfg = Config::default();
        cfg.backend = Backend::Local;
        cfg.max_steps = 3;
        cfg.dangerous_patterns = vec![r"\bterraform\s+apply\b".to_string()];
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.backend, Backend::Local);
        assert_eq!(back.max_steps, 3);
        assert_eq!(back.dangerous_patterns.len(), 1);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let text = r#"
base_url = "http://127.0.0.1:11434/v1/chat/completions"
model = "llama3.1"
api_key_env = ""
"#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.max_steps, 10);
        assert!(cfg.safe_mode);
        assert_eq!(cfg.command_timeout_secs, 30);
    }

    #[test]
    fn local_backend_needs_no_api_key() {
        let mut cfg = Config::default();
        cfg.backend = Backend::Local;
        cfg.api_key_env = String::new();
        assert!(resolve_api_key(&cfg).unwrap().is_none());
    }

    #[test]
    fn remote_backend_without_key_is_fatal() {
        let mut cfg = Config::default();
        cfg.api_key_env = "SHELLPILOT_TEST_KEY_THAT_DOES_NOT_EXIST".to_string();
        cfg.api_key = None;
        assert!(resolve_api_key(&cfg).is_err());
    }
}
