use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use scriptcraft_types::Dimension;
use serde::{Deserialize, Serialize};

use crate::report::ReportFormat;

pub const DEFAULT_BASE_URL: &str = "https://ark.cn-beijing.volces.com/api/v3";
pub const DEFAULT_MAX_SCRIPT_CHARS: usize = 50_000;

/// Connection settings for the chat-completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model name or endpoint id
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per request, the first one included
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff before the second attempt; doubles for each further attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `ARK_API_KEY`, `ARK_BASE_URL`, `MODEL_ENDPOINT`,
    /// `API_TIMEOUT` and `MAX_TOKENS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Fills the API key and model when unset and replaces the default base URL.
    /// `API_TIMEOUT` and `MAX_TOKENS` always override.
    pub fn apply_env(&mut self) {
        self.apply_vars(|name| std::env::var(name).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        if self.api_key.is_none() {
            self.api_key = non_empty("ARK_API_KEY");
        }
        if self.model.is_none() {
            self.model = non_empty("MODEL_ENDPOINT");
        }
        if let Some(url) = non_empty("ARK_BASE_URL") {
            if self.base_url == DEFAULT_BASE_URL {
                self.base_url = url;
            }
        }
        if let Some(timeout) = non_empty("API_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
            self.timeout_secs = timeout;
        }
        if let Some(max_tokens) = non_empty("MAX_TOKENS").and_then(|v| v.trim().parse().ok()) {
            self.max_tokens = max_tokens;
        }
    }

    /// Whether a usable key is present. The placeholder from sample `.env` files
    /// does not count.
    pub fn has_api_key(&self) -> bool {
        matches!(self.api_key.as_deref(), Some(k) if !k.trim().is_empty() && k != "your_api_key_here")
    }
}

/// Everything one evaluation run needs, loadable from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default = "default_dimensions")]
    pub dimensions: Vec<Dimension>,
    #[serde(default = "default_max_script_chars")]
    pub max_script_chars: usize,
    /// Directory of `<dimension>.txt` templates overriding the built-in prompts
    #[serde(default)]
    pub prompts_dir: Option<PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_formats")]
    pub formats: Vec<ReportFormat>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_history_db")]
    pub history_db: PathBuf,
}

fn default_dimensions() -> Vec<Dimension> {
    Dimension::ALL.to_vec()
}

fn default_max_script_chars() -> usize {
    DEFAULT_MAX_SCRIPT_CHARS
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_formats() -> Vec<ReportFormat> {
    vec![ReportFormat::Markdown]
}

fn default_concurrency() -> usize {
    1
}

fn default_history_db() -> PathBuf {
    PathBuf::from("history").join("scriptcraft.db")
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            dimensions: default_dimensions(),
            max_script_chars: default_max_script_chars(),
            prompts_dir: None,
            output_dir: default_output_dir(),
            formats: default_formats(),
            concurrency: default_concurrency(),
            history_db: default_history_db(),
        }
    }
}

impl EvalConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).context("Invalid evaluation config")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        Self::from_yaml_str(&content).with_context(|| format!("In config file {:?}", path))
    }

    /// Loads `path` when given, otherwise defaults; then fills client fields from
    /// the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_yaml_file(p)?,
            None => Self::default(),
        };
        config.client.apply_env();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_defaults_fill_missing_fields() {
        let config = EvalConfig::from_yaml_str(
            "dimensions: [structure, dialogue]\nformats: [markdown, json]\nclient:\n  model: ep-123\n",
        )
        .unwrap();

        assert_eq!(config.dimensions, vec![Dimension::Structure, Dimension::Dialogue]);
        assert_eq!(config.formats, vec![ReportFormat::Markdown, ReportFormat::Json]);
        assert_eq!(config.client.model.as_deref(), Some("ep-123"));
        assert_eq!(config.client.max_retries, 3);
        assert_eq!(config.client.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.max_script_chars, DEFAULT_MAX_SCRIPT_CHARS);
    }

    #[test]
    fn unknown_dimension_is_rejected() {
        assert!(EvalConfig::from_yaml_str("dimensions: [pacing]").is_err());
    }

    #[test]
    fn env_overlays_defaults_but_not_explicit_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ARK_API_KEY", "sk-env"),
            ("ARK_BASE_URL", "http://localhost:9000/v3"),
            ("MODEL_ENDPOINT", "ep-env"),
            ("API_TIMEOUT", "42"),
            ("MAX_TOKENS", "not-a-number"),
        ]);

        let mut config = ClientConfig {
            model: Some("ep-file".to_string()),
            ..ClientConfig::default()
        };
        config.apply_vars(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.model.as_deref(), Some("ep-file"));
        assert_eq!(config.base_url, "http://localhost:9000/v3");
        assert_eq!(config.timeout_secs, 42);
        assert_eq!(config.max_tokens, 4000);
    }

    #[test]
    fn placeholder_key_is_not_usable() {
        let config = ClientConfig {
            api_key: Some("your_api_key_here".to_string()),
            ..ClientConfig::default()
        };
        assert!(!config.has_api_key());
    }
}
