//! TOML configuration for the scheduler process.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scheduler::{RecurrenceEngine, ServiceOptions};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "PEWPEW_SCHEDULER_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/pewpew-scheduler/scheduler.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: TickConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SchedulerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "loaded scheduler configuration");
        Ok(config)
    }

    /// Resolve configuration, in order:
    /// 1. `explicit` (the `--config` flag). A failure here is an error.
    /// 2. The path in `PEWPEW_SCHEDULER_CONFIG`.
    /// 3. `/etc/pewpew-scheduler/scheduler.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PEWPEW_SCHEDULER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine().is_none() {
            anyhow::bail!(
                "scheduler.utc_offset_minutes {} is outside +/- 1439",
                self.scheduler.utc_offset_minutes
            );
        }
        if self.scheduler.tick_interval_secs == 0 || self.history.interval_secs == 0 {
            anyhow::bail!("tick intervals must be at least one second");
        }
        Ok(())
    }

    fn engine(&self) -> Option<RecurrenceEngine> {
        RecurrenceEngine::with_offset_minutes(self.scheduler.utc_offset_minutes)
    }

    pub fn service_options(&self) -> Result<ServiceOptions> {
        self.validate()?;
        Ok(ServiceOptions {
            schedule_key: self.storage.schedule_key.clone(),
            history_key: self.storage.history_key.clone(),
            retention_days: self.history.retention_days,
            engine: self.engine().unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Object storage layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory used as the object bucket.
    pub object_root: PathBuf,
    /// Key of the schedule map blob.
    pub schedule_key: String,
    /// Key of the history map blob.
    pub history_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            object_root: PathBuf::from("data/objects"),
            schedule_key: "settings/scheduledtests.json".to_string(),
            history_key: "settings/historicaltests.json".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// SQLite file backing the status store and the message queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/pewpew-scheduler.db".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler tick
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Seconds between dispatch passes.
    pub tick_interval_secs: u64,
    /// Offset from UTC, in minutes, that recurrence weekdays and times of
    /// day are evaluated in.
    pub utc_offset_minutes: i32,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            utc_offset_minutes: 0,
        }
    }
}

impl TickConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Seconds between janitor passes.
    pub interval_secs: u64,
    /// Events that started longer ago than this are pruned.
    pub retention_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            retention_days: 365,
        }
    }
}

impl HistoryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
