//! Engine configuration.
//!
//! Loaded in three layers: built-in defaults, an optional YAML file, then
//! `FAMILY_BANK_*` environment variables. The result is validated once at
//! startup so a bad value stops the process before the first tick.

use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::accrual_engine::EngineSettings;
use crate::domain::schedule::SchedulePolicy;

pub const CONFIG_PATH_ENV: &str = "FAMILY_BANK_CONFIG";

const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `sqlite:` URL of the ledger database
    pub database_url: String,
    pub tick_interval_secs: u64,
    pub store_call_timeout_secs: u64,
    pub max_concurrent_children: usize,
    /// Family-local offset used for weekday, day-of-month and time-of-day
    pub utc_offset_minutes: i32,
    pub max_db_connections: u32,
    /// Run a single tick and exit
    pub run_once: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: format!("sqlite:{}", default_database_path().display()),
            tick_interval_secs: 60,
            store_call_timeout_secs: 10,
            max_concurrent_children: 4,
            utc_offset_minutes: 0,
            max_db_connections: 5,
            run_once: false,
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("family-bank")
        .join("ledger.db")
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("family-bank").join("accrual.yaml"))
}

impl EngineConfig {
    /// Load from the default locations and the process environment
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let path = match explicit {
            Some(path) => Some(path),
            None => default_config_path().filter(|path| path.exists()),
        };
        Self::from_sources(path.as_deref(), |key| std::env::var(key).ok())
    }

    /// Layer an optional YAML file and an environment lookup over the defaults
    pub fn from_sources(file: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match file {
            Some(path) => {
                let yaml_content = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                let config: EngineConfig = serde_yaml::from_str(&yaml_content)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?;
                debug!("Loaded engine config from {:?}", path);
                config
            }
            None => EngineConfig::default(),
        };

        config.apply_env(env)?;
        config.validate()?;
        info!(
            database_url = %config.database_url,
            tick_interval_secs = config.tick_interval_secs,
            utc_offset_minutes = config.utc_offset_minutes,
            "Engine configuration loaded"
        );
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = env("FAMILY_BANK_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(value) = env("FAMILY_BANK_TICK_INTERVAL_SECS") {
            self.tick_interval_secs = parse_env("FAMILY_BANK_TICK_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = env("FAMILY_BANK_STORE_TIMEOUT_SECS") {
            self.store_call_timeout_secs = parse_env("FAMILY_BANK_STORE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = env("FAMILY_BANK_MAX_CONCURRENT_CHILDREN") {
            self.max_concurrent_children = parse_env("FAMILY_BANK_MAX_CONCURRENT_CHILDREN", &value)?;
        }
        if let Some(value) = env("FAMILY_BANK_UTC_OFFSET_MINUTES") {
            self.utc_offset_minutes = parse_env("FAMILY_BANK_UTC_OFFSET_MINUTES", &value)?;
        }
        if let Some(value) = env("FAMILY_BANK_RUN_ONCE") {
            self.run_once = matches!(value.trim(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.database_url.starts_with("sqlite:") {
            bail!("database_url must be a sqlite: URL, got '{}'", self.database_url);
        }
        if self.tick_interval_secs == 0 {
            bail!("tick_interval_secs must be greater than zero");
        }
        if self.store_call_timeout_secs == 0 {
            bail!("store_call_timeout_secs must be greater than zero");
        }
        if self.max_concurrent_children == 0 {
            bail!("max_concurrent_children must be greater than zero");
        }
        if self.max_db_connections == 0 {
            bail!("max_db_connections must be greater than zero");
        }
        if self.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            bail!("utc_offset_minutes {} is outside +/-14h", self.utc_offset_minutes);
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .with_context(|| format!("invalid utc offset of {} minutes", self.utc_offset_minutes))
    }

    pub fn engine_settings(&self) -> Result<EngineSettings> {
        let tick_interval = chrono::Duration::from_std(self.tick_interval())
            .context("tick interval is too large")?;

        Ok(EngineSettings {
            policy: SchedulePolicy {
                tick_interval,
                utc_offset: self.utc_offset()?,
            },
            store_call_timeout: Duration::from_secs(self.store_call_timeout_secs),
            max_concurrent_children: self.max_concurrent_children,
        })
    }

    /// Filesystem path of the database, when the URL names a file
    pub fn database_path(&self) -> Option<PathBuf> {
        let rest = self.database_url.strip_prefix("sqlite:")?;
        let path = rest.trim_start_matches("//").split('?').next().unwrap_or_default();
        if path.is_empty() || path == ":memory:" {
            return None;
        }
        Some(PathBuf::from(path))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid value '{}' for {}: {}", value, key, e))
}
