//! # Saga Runtime Configuration
//!
//! Centralized configuration and defaults for the saga effect interpreter.
//!
//! ## Features
//!
//! - **Defaults**: Step limits, task limits and call timeouts shared by every scheduler
//! - **Scheduler Configuration**: TOML loading with `SAGA_`-prefixed environment overrides
//!
//! ## Usage
//!
//! ```rust
//! use saga_config::{defaults, SchedulerConfig};
//!
//! let config = SchedulerConfig::default();
//! assert_eq!(config.max_steps_per_cycle, defaults::MAX_STEPS_PER_CYCLE);
//! ```

pub mod defaults;
pub mod scheduler_config;

pub use scheduler_config::{load_config, SchedulerConfig};
