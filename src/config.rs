// ABOUTME: TOML configuration: connection, retry, sync tuning and per-object options
// ABOUTME: Every field has a default so an absent file means a valid default configuration

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};

use crate::differ::DifferSettings;
use crate::remote::{BackoffPolicy, DEFAULT_API_URL};
use crate::source::{ObjectType, SourceSettings};
use crate::watermark::FileWatermarkStore;

/// Name looked up in the working directory when no `--config` is given
pub const LOCAL_CONFIG_FILE: &str = "monday-replicator.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub retry: RetryConfig,
    pub sync: SyncConfig,
    /// Per-object options keyed by object name
    pub objects: BTreeMap<String, ObjectOptions>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub endpoint: String,
    /// Sent as the `API-Version` header when set
    pub api_version: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_API_URL.to_string(),
            api_version: None,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub lookback_secs: u64,
    pub workers: usize,
    pub activity_log_page_size: usize,
    pub activity_log_retention_days: u64,
    pub cursor_validity_secs: u64,
    pub state_path: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lookback_secs: 60,
            workers: 4,
            activity_log_page_size: 1000,
            activity_log_retention_days: 7,
            cursor_validity_secs: 3600,
            state_path: FileWatermarkStore::default_path(),
        }
    }
}

/// Per-object query options, passed through to query variables unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObjectOptions {
    /// Restrict board-scoped objects to these boards; discover all when absent
    #[serde(deserialize_with = "de_board_ids")]
    pub board_ids: Option<Vec<String>>,
    pub page_size: Option<usize>,
    pub state: Option<String>,
    pub kind: Option<String>,
}

impl ObjectOptions {
    pub fn page_size_for(&self, object: ObjectType) -> usize {
        self.page_size.unwrap_or_else(|| object.default_page_size())
    }

    pub fn state_for(&self, object: ObjectType) -> Option<String> {
        self.state
            .clone()
            .or_else(|| object.default_state().map(str::to_string))
    }

    pub fn kind_for(&self, object: ObjectType) -> Option<String> {
        self.kind
            .clone()
            .or_else(|| object.default_kind().map(str::to_string))
    }
}

/// Split a comma-separated id list, dropping blanks.
pub fn parse_board_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Accepts `board_ids = "1, 2"` as well as `board_ids = [1, "2"]`.
fn de_board_ids<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Ids {
        Joined(String),
        List(Vec<Id>),
    }

    Ok(match Option::<Ids>::deserialize(deserializer)? {
        None => None,
        Some(Ids::Joined(raw)) => Some(parse_board_ids(&raw)),
        Some(Ids::List(ids)) => Some(
            ids.into_iter()
                .map(|id| match id {
                    Id::Text(s) => s.trim().to_string(),
                    Id::Number(n) => n.to_string(),
                })
                .filter(|s| !s.is_empty())
                .collect(),
        ),
    })
}

impl Config {
    /// Parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Explicit path if given (must exist), else `./monday-replicator.toml`,
    /// else `~/.monday-replicator/config.toml`, else defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::load(&local);
        }

        if let Some(home) = dirs::home_dir() {
            let user = home.join(".monday-replicator").join("config.toml");
            if user.exists() {
                return Self::load(&user);
            }
        }

        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, options) in &self.objects {
            let object: ObjectType = name
                .parse()
                .with_context(|| format!("Invalid [objects.{}] section", name))?;
            if options.page_size == Some(0) {
                bail!("[objects.{}] page_size must be greater than 0", name);
            }
            if options.board_ids.is_some() && !object.is_board_scoped() {
                tracing::warn!(
                    "[objects.{}] board_ids is ignored: {} is not board-scoped",
                    name,
                    object
                );
            }
        }
        if self.sync.workers == 0 {
            bail!("[sync] workers must be greater than 0");
        }
        if self.retry.max_attempts == 0 {
            bail!("[retry] max_attempts must be greater than 0");
        }
        if self.sync.activity_log_page_size == 0 {
            bail!("[sync] activity_log_page_size must be greater than 0");
        }
        url::Url::parse(&self.connection.endpoint)
            .with_context(|| format!("[connection] endpoint '{}' is not a URL", self.connection.endpoint))?;
        Ok(())
    }

    pub fn options_for(&self, object: ObjectType) -> ObjectOptions {
        self.objects
            .get(object.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn options_mut(&mut self, object: ObjectType) -> &mut ObjectOptions {
        self.objects.entry(object.as_str().to_string()).or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.connection.timeout_secs)
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.sync.lookback_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_backoff_ms),
            max_delay: Duration::from_secs(self.retry.max_backoff_secs),
        }
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            workers: self.sync.workers,
            cursor_validity: Duration::from_secs(self.sync.cursor_validity_secs),
            activity_log_limit: self.sync.activity_log_page_size,
        }
    }

    pub fn differ_settings(&self) -> DifferSettings {
        DifferSettings {
            retention: Duration::from_secs(self.sync.activity_log_retention_days * 24 * 60 * 60),
            page_size: self.sync.activity_log_page_size,
            workers: self.sync.workers,
        }
    }
}
