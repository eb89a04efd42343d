use std::time::Duration;

use relive_types::layout::REPLACE_WINDOW;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine settings. Every field has a default, so a partial JSON document
/// is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bytes rewritten at an old function's entry.
    pub replace_window: u64,
    /// Enforce LIFO disable / FIFO enable ordering of patches.
    pub stack_discipline: bool,
    pub quiesce_timeout_ms: u64,
    /// Sleep between transition passes in `wait_transition`.
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replace_window: REPLACE_WINDOW,
            stack_discipline: true,
            quiesce_timeout_ms: 1000,
            poll_interval_ms: 10,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate().map_err(serde::de::Error::custom)?;
        Ok(config)
    }

    /// Rejects settings no registry can run with.
    pub fn validate(&self) -> Result<()> {
        if self.replace_window == 0 {
            return Err(Error::InvalidValue("replace_window must not be 0".into()));
        }
        Ok(())
    }

    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
