//! Node configuration loading and management.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tollgate_core::config::{ChainsConfig, PaymentsConfig, TransactorConfig};
use tollgate_core::types::Identity;
use tollgate_core::CoreError;

/// Full configuration for a Tollgate node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TollgateConfig {
    /// Invoicing and settlement tunables.
    #[serde(default)]
    pub payments: PaymentsConfig,

    /// Identity registration settings.
    #[serde(default)]
    pub transactor: TransactorConfig,

    /// Supported chains and their contract addresses.
    #[serde(default)]
    pub chains: ChainsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Provider this node sells service as.
    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the data directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// Identity registered on the active chain at startup.
    #[serde(default)]
    pub identity: Option<Identity>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl TollgateConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    ///
    /// The result is validated before it is returned.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<TollgateConfig>(&contents)?
        } else {
            Self::default()
        };
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.payments.validate()?;
        self.transactor.validate()?;
        self.chains.validate()
    }

    /// Save the current config to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }
}
