use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which TCP flags end a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinPolicy {
    /// Any FIN or RST terminates the flow.
    #[default]
    FinOrRst,
    /// RST terminates; FIN only once an ACK accompanies it or follows it.
    FinAckOrRst,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds a flow may stay open regardless of activity.
    pub active_timeout: u64,
    /// Seconds without a packet before a flow is closed.
    pub idle_timeout: u64,
    /// Maximum number of concurrently tracked flows.
    pub capacity: usize,
    /// How far, in microseconds, a packet may lag the clock and still be accepted.
    pub ooo_tolerance_us: u64,
    /// Suppress TCP flows with fewer than four packets from the output.
    pub filter_small_flows: bool,
    /// Drop TCP packets carrying anomalous flag combinations before flow assignment.
    pub filter_tcp_flags: bool,
    pub fin_policy: FinPolicy,
    /// Hand the first payload of each flow to banner extraction.
    pub extract_banners: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            active_timeout: 1800,
            idle_timeout: 300,
            capacity: 1_000_000,
            ooo_tolerance_us: 5,
            filter_small_flows: false,
            filter_tcp_flags: false,
            fin_policy: FinPolicy::FinOrRst,
            extract_banners: true,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read(path)?;
        let config: Config = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config("capacity must be at least 1".into()));
        }
        if self.active_timeout == 0 {
            return Err(Error::Config("active_timeout must be at least 1s".into()));
        }
        if self.idle_timeout == 0 {
            return Err(Error::Config("idle_timeout must be at least 1s".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn active_timeout(&self) -> Duration {
        Duration::from_secs(self.active_timeout)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    #[inline]
    pub fn ooo_tolerance(&self) -> Duration {
        Duration::from_micros(self.ooo_tolerance_us)
    }
}
