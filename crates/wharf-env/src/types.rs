use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Stable server identifier (a UUID in practice), used as the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ServerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitState {
    pub exit_code: u32,
    pub oom_killed: bool,
}

/// One resource sample. Replaced wholesale on every poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    /// CPU usage in percent of a single core (200.0 = two cores busy).
    pub cpu_absolute: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Resource limits applied to an instance. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub memory_mb: u64,
    /// 100 = one full core.
    pub cpu_percent: u64,
}

impl Limits {
    pub fn memory_bytes(&self) -> Option<i64> {
        (self.memory_mb > 0).then(|| (self.memory_mb * 1024 * 1024) as i64)
    }

    /// CFS quota for a 100ms period.
    pub fn cpu_quota(&self) -> Option<i64> {
        (self.cpu_percent > 0).then(|| (self.cpu_percent * 1000) as i64)
    }
}

pub const CPU_PERIOD_MICROS: i64 = 100_000;

/// How a graceful stop is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StopConfig {
    /// Signal name, e.g. `SIGTERM`.
    Signal(String),
    /// Line written to the console, e.g. `stop`.
    Command(String),
}

impl Default for StopConfig {
    fn default() -> Self {
        Self::Signal("SIGTERM".into())
    }
}

/// Resolve a stop signal name such as `SIGINT`.
pub fn stop_signal(name: &str) -> Result<Signal> {
    name.parse()
        .map_err(|_| Error::InvalidDefinition(format!("unknown stop signal: {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_convert_to_engine_units() {
        let limits = Limits {
            memory_mb: 512,
            cpu_percent: 150,
        };
        assert_eq!(limits.memory_bytes(), Some(512 * 1024 * 1024));
        assert_eq!(limits.cpu_quota(), Some(150_000));
    }

    #[test]
    fn zero_limits_mean_unlimited() {
        let limits = Limits::default();
        assert_eq!(limits.memory_bytes(), None);
        assert_eq!(limits.cpu_quota(), None);
    }

    #[test]
    fn stop_config_parses_tagged_form() {
        let cfg: StopConfig =
            serde_json::from_str(r#"{"type":"command","value":"stop"}"#).unwrap();
        assert_eq!(cfg, StopConfig::Command("stop".into()));
    }

    #[test]
    fn stop_signal_names_resolve() {
        assert_eq!(stop_signal("SIGINT").unwrap(), Signal::SIGINT);
        assert!(matches!(stop_signal("SIGTREM"), Err(Error::InvalidDefinition(_))));
    }

    #[test]
    fn default_resource_usage_is_zeroed() {
        let usage = ResourceUsage::default();
        assert_eq!(usage.memory_bytes, 0);
        assert_eq!(usage.cpu_absolute, 0.0);
        assert!(usage.sampled_at.is_none());
    }
}
