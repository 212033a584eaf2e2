//! Configuration for the upload pipeline.
//!
//! A TOML document with one `[object_storage.<name>]` table per storage
//! destination the native client may be pointed at, plus the path of the
//! finalization signing secret. String values may reference environment
//! variables as `${VAR}`; references are resolved on the parsed document
//! before it is bound to the config types, so secrets can stay out of
//! the file itself.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Path of the base64-encoded HS256 secret used to sign finalization
    /// records.
    #[serde(default)]
    pub secret_file: Option<PathBuf>,

    /// Storage destinations for the native client, looked up by name.
    #[serde(default)]
    pub object_storage: HashMap<String, S3Config>,
}

impl Config {
    /// Load configuration from a file.
    ///
    /// The document is parsed first and `${VAR}` references are resolved
    /// on the resulting value tree, so expansion follows TOML semantics
    /// (only string values are touched, never keys or the raw syntax).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut document: toml::Value = toml::from_str(&content)?;
        resolve_env_references(&mut document);

        let config: Config = document.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a storage destination by the name the preparer supplies.
    pub fn object_storage(&self, name: &str) -> Option<&S3Config> {
        self.object_storage.get(name)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, storage) in &self.object_storage {
            if !storage.is_aws() {
                return Err(ConfigError::ValidationError(format!(
                    "object_storage.{name}: unsupported provider {:?}",
                    storage.provider
                )));
            }
            if storage.access_key.is_empty() != storage.secret_key.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "object_storage.{name}: access_key and secret_key must be set together"
                )));
            }
        }
        Ok(())
    }
}

/// Walk the document and substitute `${VAR}` in every string value with
/// the environment variable's content. Unset variables are left as
/// written so validation can point at them.
fn resolve_env_references(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => {
            if s.contains("${") {
                *s = substitute_env(s);
            }
        }
        toml::Value::Table(table) => {
            for (_, entry) in table.iter_mut() {
                resolve_env_references(entry);
            }
        }
        toml::Value::Array(items) => {
            for item in items.iter_mut() {
                resolve_env_references(item);
            }
        }
        _ => {}
    }
}

fn substitute_env(raw: &str) -> String {
    static REFERENCE: OnceLock<regex_lite::Regex> = OnceLock::new();
    let reference = REFERENCE
        .get_or_init(|| regex_lite::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

    reference
        .replace_all(raw, |caps: &regex_lite::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// One S3-compatible storage destination: the table shape in the config
/// file and, merged with the per-upload ticket, the input of the native
/// client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub path_style: bool,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
}

fn default_provider() -> String {
    "AWS".to_string()
}

impl S3Config {
    /// Whether the provider speaks the S3 dialect this crate supports.
    pub fn is_aws(&self) -> bool {
        self.provider.eq_ignore_ascii_case("AWS") || self.provider.eq_ignore_ascii_case("S3")
    }

    /// A destination is usable once it names a bucket and a region.
    pub fn is_valid(&self) -> bool {
        !self.bucket.is_empty() && !self.region.is_empty()
    }
}
