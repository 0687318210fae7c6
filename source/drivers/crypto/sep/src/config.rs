// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SeP driver configuration (TOML)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 5 unit tests
//!
//! Every key is optional; missing keys take the defaults below.
//!
//! ```toml
//! num_queues = 2
//! ring_size_log2 = 5
//! backlog_capacity = 64
//! promote_batch = 4
//! idle_sleep_ms = 500
//! sleep_timeout_ms = 1000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::MAX_QUEUES;

const MAX_RING_SIZE_LOG2: u32 = 10;
const MAX_BACKLOG_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SepConfig {
    pub num_queues: usize,
    /// Ring entries = `1 << ring_size_log2`.
    pub ring_size_log2: u32,
    /// Software backlog entries per queue; 0 disables backlogging.
    pub backlog_capacity: usize,
    /// Backlog entries moved into the ring per drain; unset moves as many as fit.
    pub promote_batch: Option<usize>,
    /// Idle time before the power manager asks the SeP to sleep.
    pub idle_sleep_ms: u64,
    /// How long to wait for a sleep request to complete.
    pub sleep_timeout_ms: u64,
}

impl Default for SepConfig {
    fn default() -> Self {
        Self {
            num_queues: MAX_QUEUES,
            ring_size_log2: 5,
            backlog_capacity: 64,
            promote_batch: None,
            idle_sleep_ms: 500,
            sleep_timeout_ms: 1000,
        }
    }
}

impl SepConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_queues == 0 || self.num_queues > MAX_QUEUES {
            return Err(invalid("num_queues", format!("{} not in 1..={MAX_QUEUES}", self.num_queues)));
        }
        if self.ring_size_log2 == 0 || self.ring_size_log2 > MAX_RING_SIZE_LOG2 {
            return Err(invalid(
                "ring_size_log2",
                format!("{} not in 1..={MAX_RING_SIZE_LOG2}", self.ring_size_log2),
            ));
        }
        if self.backlog_capacity > MAX_BACKLOG_CAPACITY {
            return Err(invalid(
                "backlog_capacity",
                format!("{} exceeds {MAX_BACKLOG_CAPACITY}", self.backlog_capacity),
            ));
        }
        if self.promote_batch == Some(0) {
            return Err(invalid("promote_batch", "must be positive".into()));
        }
        if self.sleep_timeout_ms == 0 {
            return Err(invalid("sleep_timeout_ms", "must be positive".into()));
        }
        Ok(())
    }

    pub fn ring_entries(&self) -> u32 {
        1 << self.ring_size_log2
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn sleep_timeout(&self) -> Duration {
        Duration::from_millis(self.sleep_timeout_ms)
    }
}

fn invalid(key: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { key, reason }
}
