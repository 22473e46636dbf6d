use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pr_telemetry_domain::PipelineError;
use pr_telemetry_hash_chain::{HashChain, MIN_KEY_BYTES};
use pr_telemetry_pipeline::PipelineConfig;
use pr_telemetry_qa::QaDispatchConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DB_PATH: &str = "./pr_telemetry.sqlite3";
pub const DEFAULT_BLOB_ROOT: &str = "./pr_telemetry_blobs";
pub const DEFAULT_HMAC_KEY_ENV: &str = "PR_TELEMETRY_HMAC_KEY";

/// Contents of the `--config` YAML file. Every section is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub database: Option<PathBuf>,
    pub blob_root: Option<PathBuf>,
    /// Environment variable holding the hash-chain key; the key itself never
    /// lives in the file.
    pub hmac_key_env: String,
    pub pipeline: PipelineConfig,
    pub qa: QaDispatchConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            database: None,
            blob_root: None,
            hmac_key_env: DEFAULT_HMAC_KEY_ENV.to_string(),
            pipeline: PipelineConfig::default(),
            qa: QaDispatchConfig::default(),
        }
    }
}

impl CliConfig {
    /// # Errors
    /// Returns a `Config` error when the file is unreadable, malformed, or
    /// carries invalid settings.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))
            .map_err(config_error)?;
        let config = Self::from_yaml(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// # Errors
    /// Returns a `Config` error for malformed YAML or invalid settings.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| PipelineError::Config(format!("config is not valid: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns the first invalid setting as a `Config` error.
    pub fn validate(&self) -> Result<()> {
        if self.hmac_key_env.trim().is_empty() {
            return Err(PipelineError::Config("hmac_key_env must not be empty".to_string()).into());
        }
        self.pipeline.validate()?;
        self.qa
            .validate()
            .map_err(|err| PipelineError::Config(err.to_string()))?;
        Ok(())
    }

    /// Command-line flags win over file values, which win over defaults.
    #[must_use]
    pub fn resolve(self, db: Option<PathBuf>, blob_root: Option<PathBuf>) -> ResolvedConfig {
        ResolvedConfig {
            database: db
                .or(self.database)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            blob_root: blob_root
                .or(self.blob_root)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BLOB_ROOT)),
            hmac_key_env: self.hmac_key_env,
            pipeline: self.pipeline,
            qa: self.qa,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub database: PathBuf,
    pub blob_root: PathBuf,
    pub hmac_key_env: String,
    pub pipeline: PipelineConfig,
    pub qa: QaDispatchConfig,
}

impl ResolvedConfig {
    /// Build the hash chain from the key in the configured environment variable.
    ///
    /// # Errors
    /// Returns a `Config` error when the variable is unset or the key is shorter
    /// than the minimum.
    pub fn hash_chain(&self) -> Result<HashChain> {
        let key = std::env::var(&self.hmac_key_env).map_err(|_| {
            PipelineError::Config(format!(
                "environment variable {} must hold the hash-chain key",
                self.hmac_key_env
            ))
        })?;
        if key.len() < MIN_KEY_BYTES {
            return Err(PipelineError::Config(format!(
                "hash-chain key in {} must be at least {MIN_KEY_BYTES} bytes",
                self.hmac_key_env
            ))
            .into());
        }
        let chain =
            HashChain::new(key.as_bytes()).map_err(|err| PipelineError::Config(err.to_string()))?;
        Ok(chain)
    }
}

fn config_error(err: anyhow::Error) -> anyhow::Error {
    PipelineError::Config(format!("{err:#}")).into()
}
