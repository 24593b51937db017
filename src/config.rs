//! Engine configuration
//!
//! Settings come from a YAML file, from a connection URL, or both: options
//! found in the URL override the file.
//!
//! ```yaml
//! database: shop
//! scan: medium          # fast | medium | full
//! expand: true
//! batch_size: 500
//! script:
//!   timeout_ms: 250
//! ```

use crate::cursor::CursorOptions;
use crate::schema::SchemaOptions;
use crate::script::ScriptConfig;
use crate::validation::validate_database_name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Invalid config: {0}")]
    Yaml(String),

    #[error("Invalid connection URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: &'static str },

    #[error("Invalid value '{value}' for option '{key}'")]
    InvalidOption { key: String, value: String },
}

/// How many documents are sampled to synthesize a schema
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStrategy {
    #[default]
    Fast,
    Medium,
    Full,
}

impl ScanStrategy {
    /// `None` samples the whole collection
    pub fn sample_size(self) -> Option<usize> {
        match self {
            ScanStrategy::Fast => Some(200),
            ScanStrategy::Medium => Some(1000),
            ScanStrategy::Full => None,
        }
    }
}

impl FromStr for ScanStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(ScanStrategy::Fast),
            "medium" => Ok(ScanStrategy::Medium),
            "full" => Ok(ScanStrategy::Full),
            _ => Err(ConfigError::InvalidOption {
                key: "scan".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Database statements run against
    pub database: String,
    pub scan: ScanStrategy,
    /// Overrides the sample size of `scan`
    pub sample_size: Option<usize>,
    /// Flatten embedded documents into dotted columns
    pub expand: bool,
    /// Order synthesized columns alphabetically
    pub sort_fields: bool,
    /// Use schema snapshots for `SELECT *` columns and written value kinds
    pub schema_hints: bool,
    /// Documents requested per store round trip
    pub batch_size: usize,
    /// Rows a scrollable cursor keeps for backward movement
    pub replay_buffer_rows: usize,
    /// Trailing `SELECT *` column for fields seen after the columns froze
    pub overflow_column: String,
    pub script: ScriptConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: "admin".to_string(),
            scan: ScanStrategy::Fast,
            sample_size: None,
            expand: false,
            sort_fields: false,
            schema_hints: true,
            batch_size: 100,
            replay_buffer_rows: 10_000,
            overflow_column: "_overflow".to_string(),
            script: ScriptConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a YAML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config = Self::from_yaml(&content)?;
        info!(path = %path.display(), database = %config.database, "Loaded config");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| ConfigError::Yaml(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, value: String| ConfigError::InvalidOption {
            key: key.to_string(),
            value,
        };
        validate_database_name(&self.database).map_err(|_| invalid("database", self.database.clone()))?;
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "0".to_string()));
        }
        if self.overflow_column.is_empty() || self.overflow_column.contains('.') {
            return Err(invalid("overflow_column", self.overflow_column.clone()));
        }
        if self.script.pool_size == 0 {
            return Err(invalid("script.pool_size", "0".to_string()));
        }
        Ok(())
    }

    /// Documents sampled per collection; `None` is a full scan
    pub fn effective_sample_size(&self) -> Option<usize> {
        self.sample_size.or_else(|| self.scan.sample_size())
    }

    pub fn schema_options(&self) -> SchemaOptions {
        SchemaOptions {
            sample_size: self.effective_sample_size(),
            expand: self.expand,
            sort_fields: self.sort_fields,
        }
    }

    pub fn cursor_options(&self, scrollable: bool) -> CursorOptions {
        CursorOptions {
            batch_size: self.batch_size,
            scrollable,
            replay_buffer_rows: self.replay_buffer_rows,
            expand: self.expand,
            overflow_column: self.overflow_column.clone(),
        }
    }
}

/// A parsed `mongodb://` connection URL
///
/// Driver options (`scan`, `expand`, `sort`, `sampleSize`, `batchSize`,
/// `scriptTimeoutMs`) are taken out; every other parameter stays in
/// [`client_url`](Self::client_url) for the native client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionConfig {
    /// URL for the native client, credentials included
    pub client_url: String,
    /// Database named in the URL path, `admin` if none
    pub database: String,
    /// Driver options as `(key, value)`, keys lowercased
    pub driver_options: Vec<(String, String)>,
}

impl ConnectionConfig {
    /// Parse a connection URL; `user` and `password` properties become the
    /// URL credentials, other properties are appended as query parameters
    pub fn parse(url: &str, properties: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let invalid = |reason| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason,
        };
        let url = url.strip_prefix("jdbc:").unwrap_or(url);
        if !url.starts_with("mongodb") {
            return Err(invalid("expected a mongodb:// or mongodb+srv:// URL"));
        }
        let scheme_end = url.find("//").map(|i| i + 2).ok_or_else(|| invalid("missing '//'"))?;

        let mut url = url.to_string();
        if let (Some(user), Some(password)) = (properties.get("user"), properties.get("password")) {
            let rest = match url[scheme_end..].find('@') {
                Some(at) => url[scheme_end + at + 1..].to_string(),
                None => url[scheme_end..].to_string(),
            };
            url = format!("{}{}:{}@{}", &url[..scheme_end], user, password, rest);
        }

        let (base, query) = match url.split_once('?') {
            Some((base, query)) => (base.to_string(), query.to_string()),
            None => (url.clone(), String::new()),
        };
        let mut pairs: Vec<String> = query.split('&').filter(|p| !p.is_empty()).map(str::to_string).collect();
        pairs.extend(
            properties
                .iter()
                .filter(|(k, _)| *k != "user" && *k != "password")
                .map(|(k, v)| format!("{}={}", k, v)),
        );

        let mut driver_options = Vec::new();
        let mut client_params = Vec::new();
        for pair in pairs {
            match pair.split_once('=') {
                Some((key, value)) if DRIVER_OPTIONS.contains(&key.to_ascii_lowercase().as_str()) => {
                    driver_options.push((key.to_ascii_lowercase(), value.to_string()))
                }
                _ => client_params.push(pair.clone()),
            }
        }

        // the path starts at the first '/' after the credentials
        let trimmed = base.trim_end_matches('/');
        let host_start = trimmed[scheme_end..]
            .rfind('@')
            .map_or(scheme_end, |at| scheme_end + at + 1);
        let database = match trimmed[host_start..].split_once('/') {
            Some((_, path)) if !path.is_empty() => path.to_string(),
            _ => "admin".to_string(),
        };

        let client_url = if client_params.is_empty() {
            base
        } else {
            format!("{}?{}", base, client_params.join("&"))
        };
        info!(database = %database, "Parsed connection URL");
        Ok(Self {
            client_url,
            database,
            driver_options,
        })
    }

    /// Apply the URL's database and driver options on top of `config`
    pub fn apply(&self, mut config: EngineConfig) -> Result<EngineConfig, ConfigError> {
        config.database = self.database.clone();
        for (key, value) in &self.driver_options {
            let invalid = || ConfigError::InvalidOption {
                key: key.clone(),
                value: value.clone(),
            };
            match key.as_str() {
                "scan" => config.scan = value.parse()?,
                "expand" => config.expand = value.parse().map_err(|_| invalid())?,
                "sort" => config.sort_fields = value.parse().map_err(|_| invalid())?,
                "samplesize" => config.sample_size = Some(value.parse().map_err(|_| invalid())?),
                "batchsize" => config.batch_size = value.parse().map_err(|_| invalid())?,
                "scripttimeoutms" => config.script.timeout_ms = value.parse().map_err(|_| invalid())?,
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }
}

const DRIVER_OPTIONS: &[&str] = &["scan", "expand", "sort", "samplesize", "batchsize", "scripttimeoutms"];
