use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    pub backend: BackendConfig,
    /// Ollama model name -> backend model name. Unmapped names fall back to
    /// `default_model`, then pass through unchanged.
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the OpenAI-compatible backend, e.g. `http://vllm:8000/v1`.
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_idle")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_secs")]
    pub pool_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeaturesConfig {
    /// Forward tool definitions / tool calls. Off by default: requests that
    /// carry tools while this is off are rejected, not silently stripped.
    #[serde(default)]
    pub tools: bool,
    /// Forward image attachments as data URLs.
    #[serde(default)]
    pub images: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_capacity")]
    pub capacity: usize,
}

fn default_port() -> u16 {
    11434
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_idle() -> usize {
    16
}

fn default_pool_idle_secs() -> u64 {
    90
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

fn default_retry_on() -> Vec<u16> {
    vec![429, 502, 503, 504]
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_metrics_capacity() -> usize {
    1000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            retry_on: default_retry_on(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            capacity: default_metrics_capacity(),
        }
    }
}

impl ProxyConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(ProxyError::config(format!(
            "No config file found. Searched: {}. Create one from config.example.toml",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    fn validate(&self) -> Result<()> {
        if self.backend.base_url.is_empty() {
            return Err(ProxyError::config("backend.base_url must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ProxyError::config("retry.max_attempts must be at least 1"));
        }
        if self.metrics.capacity == 0 {
            return Err(ProxyError::config("metrics.capacity must be at least 1"));
        }
        Ok(())
    }

    /// Effective base URL with a `/v1` suffix guaranteed and no trailing slash.
    #[must_use]
    pub fn effective_base_url(&self) -> String {
        let trimmed = self.backend.base_url.trim_end_matches('/');
        if trimmed.ends_with("/v1") {
            trimmed.to_string()
        } else {
            format!("{trimmed}/v1")
        }
    }

    /// Resolve the API key from the configured environment variable.
    pub fn resolve_api_key(&self) -> Result<String> {
        std::env::var(&self.backend.api_key_env).map_err(|_| {
            ProxyError::config(format!(
                "Environment variable '{}' not set. Set it with your backend API key.",
                self.backend.api_key_env
            ))
        })
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.timeout_secs)
    }

    /// Resolve an inbound model name: mapping table first, then the
    /// configured default, then pass-through unchanged.
    #[must_use]
    pub fn resolve_model(&self, name: &str) -> String {
        if let Some(mapped) = self.models.get(name) {
            return mapped.clone();
        }
        if let Some(ref default) = self.default_model {
            return default.clone();
        }
        name.to_string()
    }
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("ollama-proxy.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("ollama-proxy")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("ollama-proxy").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("ollama-proxy").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".ollama-proxy.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

/// Minimal config for unit tests across the crate.
#[cfg(test)]
pub(crate) fn test_config() -> ProxyConfig {
    ProxyConfig {
        port: 11434,
        backend: BackendConfig {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
            pool_max_idle_per_host: 16,
            pool_idle_timeout_secs: 90,
        },
        models: HashMap::new(),
        default_model: None,
        limits: LimitsConfig::default(),
        retry: RetryConfig::default(),
        breaker: BreakerConfig::default(),
        features: FeaturesConfig::default(),
        metrics: MetricsConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 8080

[backend]
base_url = "http://vllm:8000"
api_key_env = "VLLM_API_KEY"

[models]
"llama2" = "gpt-3.5-turbo"

[retry]
max_attempts = 5

[features]
images = true
"#
        )
        .unwrap();

        let config = ProxyConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.backend.api_key_env, "VLLM_API_KEY");
        assert_eq!(
            config.models.get("llama2"),
            Some(&"gpt-3.5-turbo".to_string())
        );
        assert_eq!(config.retry.max_attempts, 5);
        // Unspecified retry fields keep their defaults
        assert_eq!(config.retry.retry_on, vec![429, 502, 503, 504]);
        assert!(config.features.images);
        assert!(!config.features.tools);
    }

    #[test]
    fn test_base_url_gets_v1_suffix() {
        let mut config = test_config();
        config.backend.base_url = "http://vllm:8000".to_string();
        assert_eq!(config.effective_base_url(), "http://vllm:8000/v1");

        config.backend.base_url = "http://vllm:8000/v1/".to_string();
        assert_eq!(config.effective_base_url(), "http://vllm:8000/v1");
    }

    #[test]
    fn test_resolve_model_priority() {
        let mut config = test_config();
        config
            .models
            .insert("llama2".to_string(), "gpt-3.5-turbo".to_string());
        config.default_model = Some("gpt-4o-mini".to_string());

        // Exact match wins
        assert_eq!(config.resolve_model("llama2"), "gpt-3.5-turbo");
        // Unmapped falls back to default
        assert_eq!(config.resolve_model("mistral"), "gpt-4o-mini");

        // Without a default, unmapped names pass through
        config.default_model = None;
        assert_eq!(config.resolve_model("mistral"), "mistral");
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
[backend]
base_url = "http://vllm:8000"

[retry]
max_attempts = 0
"#
        )
        .unwrap();

        assert!(ProxyConfig::load(f.path()).is_err());
    }
}
