//! Scheduler defaults
//!
//! Default values shared by every scheduler instance so that tests, the
//! in-memory store and user configuration files agree on the same limits.

/// Scheduler name used in log fields when none is configured
pub const SCHEDULER_NAME: &str = "saga";

/// Resumptions allowed within one quiescence cycle before the advancing
/// task is failed. Bounds sagas that Put an action they immediately Take again.
pub const MAX_STEPS_PER_CYCLE: usize = 100_000;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "SAGA";

/// Default configuration file location
pub const CONFIG_PATH: &str = "config/saga.toml";
