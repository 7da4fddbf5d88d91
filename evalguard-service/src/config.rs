use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use evalguard_audit::AuditSettings;
use evalguard_crypto::{CipherResult, EnvelopeCipher, MasterKey};
use evalguard_privacy::{AnonymityConfig, BudgetConfig};
use serde::Deserialize;
use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encryption: EncryptionSection,
    #[serde(default)]
    pub anonymity: AnonymityConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub audit: AuditSettings,
}

#[derive(Clone, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct EncryptionSection {
    /// Environment variable holding the 64-hex master key.
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,
    /// Inline key for local testing. Takes precedence over the environment.
    #[serde(default)]
    pub master_key: Option<String>,
    #[serde(default = "default_require_comment_encryption")]
    pub require_comment_encryption: bool,
}

impl std::fmt::Debug for EncryptionSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSection")
            .field("master_key_env", &self.master_key_env)
            .field("master_key", &self.master_key.as_ref().map(|_| ".."))
            .field("require_comment_encryption", &self.require_comment_encryption)
            .finish()
    }
}

fn default_master_key_env() -> String {
    "EVALGUARD_MASTER_KEY".into()
}

const fn default_require_comment_encryption() -> bool {
    true
}

impl Default for EncryptionSection {
    fn default() -> Self {
        Self {
            master_key_env: default_master_key_env(),
            master_key: None,
            require_comment_encryption: default_require_comment_encryption(),
        }
    }
}

impl EncryptionSection {
    /// Builds the cipher. An inline key must be valid; a missing or bad
    /// environment key leaves the cipher unconfigured.
    pub fn cipher(&self) -> CipherResult<EnvelopeCipher> {
        match &self.master_key {
            Some(inline) => EnvelopeCipher::from_hex(inline),
            None => Ok(EnvelopeCipher::from_env(&self.master_key_env)),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption.master_key_env.trim().is_empty() {
            return Err(ConfigError::Validation(
                "encryption.master-key-env must not be empty".into(),
            ));
        }
        if let Some(inline) = &self.encryption.master_key {
            MasterKey::from_hex(inline).map_err(|err| {
                ConfigError::Validation(format!("encryption.master-key: {err}"))
            })?;
        }

        let anonymity = &self.anonymity;
        if anonymity.delay_min_secs > anonymity.delay_max_secs {
            return Err(ConfigError::Validation(
                "anonymity.delay-min-secs must not exceed delay-max-secs".into(),
            ));
        }
        if anonymity.mixing_window_minutes == 0 {
            return Err(ConfigError::Validation(
                "anonymity.mixing-window-minutes must be greater than zero".into(),
            ));
        }
        if anonymity.min_group_size == 0 {
            return Err(ConfigError::Validation(
                "anonymity.min-group-size must be greater than zero".into(),
            ));
        }
        if anonymity.max_comment_chars == 0 {
            return Err(ConfigError::Validation(
                "anonymity.max-comment-chars must be greater than zero".into(),
            ));
        }

        let budget = &self.budget;
        if !(budget.total_budget.is_finite() && budget.total_budget > 0.0) {
            return Err(ConfigError::Validation(
                "budget.total-budget must be a positive number".into(),
            ));
        }
        if !(budget.default_epsilon.is_finite() && budget.default_epsilon > 0.0) {
            return Err(ConfigError::Validation(
                "budget.default-epsilon must be a positive number".into(),
            ));
        }
        if budget.max_queries == 0 || budget.window_secs == 0 {
            return Err(ConfigError::Validation(
                "budget.max-queries and budget.window-secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            encryption: EncryptionSection::default(),
            anonymity: AnonymityConfig::default(),
            budget: BudgetConfig::default(),
            audit: AuditSettings::default(),
        }
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, resolve_format(path, format))?;
    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format: ConfigFormat::Toml,
                details: err.to_string(),
            })
        }
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}
