//! TOML configuration.
//!
//! Durations are plain millisecond integers in the file (`*_ms`) and become
//! `std::time::Duration` in the option structs the runtime consumes.
//!
//! ```toml
//! [store]
//! name = "bobbin"
//! stalled_max_age_ms = 25000
//! max_num_resets = 3
//! unreported_max_age_ms = 30000
//!
//! [resetter]
//! interval_ms = 60000
//!
//! [worker]
//! num_handlers = 4
//! heartbeat_interval_ms = 5000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::app::worker_loop::default_worker_name;
use crate::app::{ResetterOptions, WorkerOptions};
use crate::error::ConfigError;
use crate::ports::StoreOptions;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BobbinConfig {
    pub store: StoreConfig,
    pub resetter: ResetterConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub name: String,
    pub stalled_max_age_ms: u64,
    pub max_num_resets: u32,
    pub unreported_max_age_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "bobbin".to_string(),
            stalled_max_age_ms: 25_000,
            max_num_resets: 3,
            unreported_max_age_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResetterConfig {
    pub name: String,
    pub interval_ms: u64,
}

impl Default for ResetterConfig {
    fn default() -> Self {
        Self {
            name: "bobbin_resetter".to_string(),
            interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Lease identity. A random one is generated when unset.
    pub name: Option<String>,
    pub num_handlers: usize,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub maximum_runtime_per_job_ms: Option<u64>,
    pub num_total_jobs: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            num_handlers: 1,
            poll_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            maximum_runtime_per_job_ms: None,
            num_total_jobs: None,
        }
    }
}

impl BobbinConfig {
    /// Read and validate `path`, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.max_num_resets == 0 {
            return Err(ConfigError::Invalid(
                "store.max_num_resets must be at least 1".to_string(),
            ));
        }
        if self.worker.num_handlers == 0 {
            return Err(ConfigError::Invalid(
                "worker.num_handlers must be at least 1".to_string(),
            ));
        }

        let durations = [
            ("store.stalled_max_age_ms", self.store.stalled_max_age_ms),
            ("store.unreported_max_age_ms", self.store.unreported_max_age_ms),
            ("resetter.interval_ms", self.resetter.interval_ms),
            ("worker.poll_interval_ms", self.worker.poll_interval_ms),
            ("worker.heartbeat_interval_ms", self.worker.heartbeat_interval_ms),
        ];
        if let Some((key, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{key} must be greater than 0")));
        }

        // A worker that heartbeats slower than the grace period loses records
        // it is still running.
        if self.worker.heartbeat_interval_ms >= self.store.unreported_max_age_ms {
            return Err(ConfigError::Invalid(format!(
                "worker.heartbeat_interval_ms ({}) must be less than store.unreported_max_age_ms ({})",
                self.worker.heartbeat_interval_ms, self.store.unreported_max_age_ms
            )));
        }
        if self.worker.heartbeat_interval_ms >= self.store.stalled_max_age_ms {
            return Err(ConfigError::Invalid(format!(
                "worker.heartbeat_interval_ms ({}) must be less than store.stalled_max_age_ms ({})",
                self.worker.heartbeat_interval_ms, self.store.stalled_max_age_ms
            )));
        }

        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            name: self.store.name.clone(),
            stalled_max_age: Duration::from_millis(self.store.stalled_max_age_ms),
            max_num_resets: self.store.max_num_resets,
            unreported_max_age: Duration::from_millis(self.store.unreported_max_age_ms),
        }
    }

    pub fn resetter_options(&self) -> ResetterOptions {
        ResetterOptions {
            name: self.resetter.name.clone(),
            interval: Duration::from_millis(self.resetter.interval_ms),
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            name: self.worker.name.clone().unwrap_or_else(default_worker_name),
            num_handlers: self.worker.num_handlers,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            heartbeat_interval: Duration::from_millis(self.worker.heartbeat_interval_ms),
            maximum_runtime_per_job: self
                .worker
                .maximum_runtime_per_job_ms
                .map(Duration::from_millis),
            num_total_jobs: self.worker.num_total_jobs,
        }
    }
}
