//! Scheduler Configuration Module
//!
//! Provides configuration loading for saga schedulers.
//! Supports loading from TOML files with environment-variable overrides.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Scheduler configuration
///
/// ```toml
/// name = "checkout"
/// max_live_tasks = 10000
/// max_steps_per_cycle = 100000
/// call_timeout_ms = 5000
/// trace_effects = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Human-readable scheduler name, attached to log records
    pub name: String,

    /// Upper bound on non-terminal tasks; `None` means unbounded
    pub max_live_tasks: Option<usize>,

    /// Resumptions allowed within one quiescence cycle
    pub max_steps_per_cycle: usize,

    /// Timeout applied to every Call effect; `None` disables it
    pub call_timeout_ms: Option<u64>,

    /// Emit a debug record for every interpreted effect
    pub trace_effects: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: defaults::SCHEDULER_NAME.to_string(),
            max_live_tasks: None,
            max_steps_per_cycle: defaults::MAX_STEPS_PER_CYCLE,
            call_timeout_ms: None,
            trace_effects: false,
        }
    }
}

impl SchedulerConfig {
    /// Create a default configuration with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the live task limit
    pub fn with_max_live_tasks(mut self, limit: usize) -> Self {
        self.max_live_tasks = Some(limit);
        self
    }

    /// Set the per-cycle step limit
    pub fn with_max_steps_per_cycle(mut self, limit: usize) -> Self {
        self.max_steps_per_cycle = limit;
        self
    }

    /// Set the Call timeout; durations beyond `u64::MAX` milliseconds saturate
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Enable per-effect debug records
    pub fn with_effect_tracing(mut self) -> Self {
        self.trace_effects = true;
        self
    }

    /// Call timeout as a `Duration`
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;

        config.validate()?;
        debug!(name = %config.name, "Loaded scheduler config from {:?}", path);
        Ok(config)
    }

    /// Load configuration from a file layered with environment overrides
    ///
    /// Variables take the form `<PREFIX>_<FIELD>`, e.g. `SAGA_MAX_LIVE_TASKS=64`.
    /// A missing file is tolerated; the environment and defaults still apply.
    pub fn load(base_path: Option<&Path>, env_prefix: Option<&str>) -> Result<Self> {
        let base = base_path.unwrap_or(Path::new(defaults::CONFIG_PATH));
        let prefix = env_prefix.unwrap_or(defaults::ENV_PREFIX);

        if base.exists() {
            info!("Loading scheduler config: {:?}", base);
        } else {
            debug!("Scheduler config file not found: {:?}", base);
        }

        let builder = Config::builder()
            .add_source(File::from(base).required(false))
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Self = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("Scheduler name cannot be empty");
        }
        if self.max_steps_per_cycle == 0 {
            bail!("max_steps_per_cycle must be greater than zero");
        }
        if self.max_live_tasks == Some(0) {
            bail!("max_live_tasks must be greater than zero when set");
        }
        if self.call_timeout_ms == Some(0) {
            bail!("call_timeout_ms must be greater than zero when set");
        }
        Ok(())
    }
}

/// Convenience function to load configuration with defaults
pub fn load_config(path: Option<&Path>) -> Result<SchedulerConfig> {
    SchedulerConfig::load(path, None)
}
