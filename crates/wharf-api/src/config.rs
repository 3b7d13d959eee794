use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    /// Global bearer token; authorizes every scope.
    pub token: String,
    pub servers_file: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token = var("WHARF_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::Missing("WHARF_TOKEN"))?;

        Ok(Self {
            listen_addr: parse(&var, "WHARF_LISTEN_ADDR", "0.0.0.0:8080")?,
            token,
            servers_file: var("WHARF_SERVERS_FILE")
                .unwrap_or_else(|| "servers.json".into())
                .into(),
            data_dir: var("WHARF_DATA_DIR")
                .unwrap_or_else(|| "/var/lib/wharf/volumes".into())
                .into(),
            log_dir: var("WHARF_LOG_DIR")
                .unwrap_or_else(|| "/var/log/wharf".into())
                .into(),
            poll_interval: seconds(&var, "WHARF_POLL_INTERVAL_SECS", 5)?,
            shutdown_grace: Duration::from_secs(parse(&var, "WHARF_SHUTDOWN_GRACE_SECS", "10")?),
        })
    }
}

fn parse<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: &str,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var(name).unwrap_or_else(|| default.to_string());
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

/// A period that must be at least one second; `tokio::time::interval` panics on zero.
fn seconds(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs: u64 = parse(var, name, &default.to_string())?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be at least 1".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}
