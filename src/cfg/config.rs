// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;
use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration (§6.2), grouped into `manager`, `worker`, and
/// `logging` sections by logical domain.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    pub manager: ManagerConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggerConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ManagerConfig {
    /// Overlay address + port to bind and accept connections on.
    pub listen_endpoint: String,
    /// I/O worker thread count for the manager's runtime.
    #[serde(default = "defaults::io_threads_manager")]
    pub io_threads: usize,
    /// Per-session in-flight window (§4.5).
    #[serde(default = "defaults::max_in_flight")]
    pub max_in_flight: u32,
    pub pool: PoolConfig,
    #[serde(default = "defaults::max_frame_size")]
    pub max_frame_size: u32,
    #[serde(default = "defaults::response_timeout", with = "serde_secs")]
    pub response_timeout: Duration,
    #[serde(default = "defaults::drain_timeout", with = "serde_secs")]
    pub drain_timeout: Duration,
    #[serde(default = "defaults::shutdown_timeout", with = "serde_secs")]
    pub shutdown_timeout: Duration,
    #[serde(default = "defaults::generator_timeout_ms")]
    pub generator_timeout_ms: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PoolConfig {
    #[serde(default = "defaults::pool_hard_capacity")]
    pub hard_capacity: usize,
    #[serde(default = "defaults::pool_low_watermark")]
    pub low_watermark: usize,
    #[serde(default = "defaults::pool_refill_batch")]
    pub refill_batch: usize,
    /// §7 / §11.4: unbounded release-retry by default.
    #[serde(default)]
    pub max_release_retries: Option<u32>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WorkerConfig {
    /// Overlay address + port the worker dials.
    pub connect_endpoint: String,
    #[serde(default = "defaults::io_threads_worker")]
    pub io_threads: usize,
    #[serde(default)]
    pub worker_mode: WorkerMode,
    #[serde(default = "defaults::max_frame_size")]
    pub max_frame_size: u32,
    #[serde(default = "defaults::backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "defaults::backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "defaults::stop_timeout", with = "serde_secs")]
    pub stop_timeout: Duration,
    /// Local capacity this worker is willing to run; echoed (or reduced)
    /// during hello negotiation per §11.5.
    #[serde(default = "defaults::max_in_flight")]
    pub max_in_flight: u32,
}

/// `async` stays cooperative; `blocking` hands each task to a dedicated OS
/// thread (§4.7).
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerMode {
    #[default]
    #[serde(rename = "async", alias = "Async", alias = "ASYNC")]
    Async,
    #[serde(rename = "blocking", alias = "Blocking", alias = "BLOCKING")]
    Blocking,
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerMode::Async => "async",
            WorkerMode::Blocking => "blocking",
        })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    File,
}

impl Default for LogOutput {
    fn default() -> Self {
        LogOutput::Stdout
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogFileConfig {
    pub path: String,
    #[serde(default)]
    pub rotation_frequency: Option<RotationFreq>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationFreq {
    Minutely,
    Hourly,
    Daily,
    Never,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggerConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
    #[serde(default)]
    pub output: LogOutput,
    #[serde(default)]
    pub is_show_line: bool,
    #[serde(default)]
    pub is_show_module_path: bool,
    #[serde(default)]
    pub is_show_target: bool,
    #[serde(default)]
    pub file: Option<LogFileConfig>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: defaults::log_level(),
            output: LogOutput::default(),
            is_show_line: false,
            is_show_module_path: false,
            is_show_target: false,
            file: None,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let s = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        let mut cfg: Config = serde_yaml::from_str(&s).map_err(|source| ConfigError::Parse {
            path: path_ref.display().to_string(),
            source,
        })?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants called out across §4.4/§4.5/§6.2.
    pub fn validate_and_normalize(&mut self) -> Result<(), ConfigError> {
        invalid_if(
            self.manager.listen_endpoint.is_empty(),
            "manager.listen_endpoint must not be empty",
        )?;
        invalid_if(
            self.worker.connect_endpoint.is_empty(),
            "worker.connect_endpoint must not be empty",
        )?;
        invalid_if(self.manager.max_in_flight == 0, "manager.max_in_flight must be >= 1")?;
        invalid_if(
            self.manager.pool.hard_capacity == 0,
            "manager.pool.hard_capacity must be >= 1",
        )?;
        invalid_if(
            self.manager.pool.low_watermark > self.manager.pool.hard_capacity,
            "manager.pool.low_watermark must be <= manager.pool.hard_capacity",
        )?;
        invalid_if(
            self.manager.pool.refill_batch == 0,
            "manager.pool.refill_batch must be >= 1",
        )?;
        invalid_if(self.manager.max_frame_size == 0, "manager.max_frame_size must be >= 1")?;
        invalid_if(self.worker.max_frame_size == 0, "worker.max_frame_size must be >= 1")?;
        invalid_if(self.worker.max_in_flight == 0, "worker.max_in_flight must be >= 1")?;
        invalid_if(
            self.worker.backoff_cap_ms < self.worker.backoff_base_ms,
            "worker.backoff_cap_ms must be >= worker.backoff_base_ms",
        )?;
        Ok(())
    }
}

fn invalid_if(cond: bool, msg: &str) -> Result<(), ConfigError> {
    if cond {
        Err(ConfigError::Invalid(msg.to_string()))
    } else {
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod defaults {
    use std::time::Duration;

    pub fn io_threads_manager() -> usize {
        1
    }

    pub fn io_threads_worker() -> usize {
        1
    }

    pub fn max_in_flight() -> u32 {
        8
    }

    pub fn pool_hard_capacity() -> usize {
        1024
    }

    pub fn pool_low_watermark() -> usize {
        128
    }

    pub fn pool_refill_batch() -> usize {
        256
    }

    pub fn max_frame_size() -> u32 {
        16 * 1024 * 1024
    }

    pub fn response_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn drain_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn generator_timeout_ms() -> u64 {
        100
    }

    pub fn backoff_base_ms() -> u64 {
        100
    }

    pub fn backoff_cap_ms() -> u64 {
        10_000
    }

    pub fn stop_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn log_level() -> String {
        "info".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
manager:
  listen_endpoint: "127.0.0.1:9000"
  pool:
    hard_capacity: 8
    low_watermark: 4
    refill_batch: 8
worker:
  connect_endpoint: "127.0.0.1:9000"
"#
    }

    #[test]
    fn defaults_fill_in_missing_keys() {
        let mut cfg: Config = serde_yaml::from_str(minimal_yaml()).expect("parses");
        cfg.validate_and_normalize().expect("valid");
        assert_eq!(cfg.manager.max_in_flight, 8);
        assert_eq!(cfg.manager.io_threads, 1);
        assert_eq!(cfg.worker.worker_mode, WorkerMode::Async);
        assert_eq!(cfg.manager.max_frame_size, 16 * 1024 * 1024);
    }

    #[test]
    fn rejects_watermark_above_capacity() {
        let mut cfg: Config = serde_yaml::from_str(minimal_yaml()).expect("parses");
        cfg.manager.pool.low_watermark = cfg.manager.pool.hard_capacity + 1;
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn rejects_empty_endpoint() {
        let mut cfg: Config = serde_yaml::from_str(minimal_yaml()).expect("parses");
        cfg.manager.listen_endpoint.clear();
        assert!(cfg.validate_and_normalize().is_err());
    }
}
