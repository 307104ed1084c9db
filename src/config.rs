//! Application configuration surface, loaded from a YAML file via `serde`
//! and `serde_yaml`.

use crate::provider::{ProviderConfig, VectorDbKind as ProviderVectorDbKind};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Dev,
    Test,
    Prod,
}

impl Mode {
    /// Non-`prod` modes enable RPC server reflection.
    pub fn enables_reflection(&self) -> bool {
        !matches!(self, Mode::Prod)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorDbKind {
    Local,
    Remote,
    Mock,
}

impl From<VectorDbKind> for ProviderVectorDbKind {
    fn from(kind: VectorDbKind) -> Self {
        match kind {
            VectorDbKind::Local => ProviderVectorDbKind::Local,
            VectorDbKind::Remote => ProviderVectorDbKind::Remote,
            VectorDbKind::Mock => ProviderVectorDbKind::Mock,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Empty or `":memory:"` disables durable persistence: the store opens
    /// an in-memory connection and all writes "silently succeed" against
    /// it.
    #[serde(default)]
    pub data_source: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorDbConfig {
    #[serde(rename = "type")]
    pub kind: VectorDbKind,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EmbeddingProviderConfig {
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderDefaultConfig {
    #[serde(default)]
    pub api_endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry_count: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

impl From<&ProviderDefaultConfig> for ProviderConfig {
    fn from(defaults: &ProviderDefaultConfig) -> Self {
        Self {
            api_endpoint: defaults.api_endpoint.clone(),
            api_key: defaults.api_key.clone(),
            headers: HashMap::new(),
            timeout_secs: defaults.timeout_secs,
            retry_count: defaults.retry_count,
        }
    }
}

/// LM streaming calls use a longer default timeout than unary calls.
pub const STREAMING_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub mode: Mode,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub vector_db: VectorDbConfig,
    #[serde(default)]
    pub embedding_providers: HashMap<String, EmbeddingProviderConfig>,
    #[serde(default)]
    pub provider_defaults: HashMap<String, ProviderDefaultConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { data_source: String::new() }
    }
}

impl AppConfig {
    /// Pairs `provider_defaults`' endpoint with `embedding_providers`' API
    /// key for `provider_code`, exactly as the CLI's embedder wiring does —
    /// the one place both tables are joined to build an embedder.
    pub fn embedding_endpoint_and_key(&self, provider_code: &str) -> (String, String) {
        let endpoint = self.provider_defaults.get(provider_code).map(|c| c.api_endpoint.clone()).unwrap_or_default();
        let api_key = self.embedding_providers.get(provider_code).map(|c| c.api_key.clone()).unwrap_or_default();
        (endpoint, api_key)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mode: dev
database:
  data_source: ":memory:"
vector_db:
  type: mock
  endpoint: ""
  api_key: ""
embedding_providers:
  bailian:
    api_key: "sk-test"
provider_defaults:
  unified:
    api_endpoint: "https://api.example.com/v1/chat/completions"
    api_key: "sk-test"
    timeout_secs: 30
    retry_count: 3
"#;

    #[test]
    fn parses_minimal_config() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.mode, Mode::Dev);
        assert_eq!(config.database.data_source, ":memory:");
        assert_eq!(config.vector_db.kind, VectorDbKind::Mock);
        assert_eq!(config.embedding_providers["bailian"].api_key, "sk-test");
    }

    #[test]
    fn dev_and_test_mode_enable_reflection_but_prod_does_not() {
        assert!(Mode::Dev.enables_reflection());
        assert!(Mode::Test.enables_reflection());
        assert!(!Mode::Prod.enables_reflection());
    }

    #[test]
    fn missing_file_surfaces_as_read_error() {
        let err = AppConfig::load("/nonexistent/path/to/config.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
