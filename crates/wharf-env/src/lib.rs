pub mod definition;
pub mod docker;
pub mod events;
pub mod logs;
pub mod process;
pub mod server;
mod task;
pub mod types;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use nix::sys::signal::Signal;
pub use server::{Server, ServerCollection};
pub use types::{ExitState, ResourceUsage, ServerId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("docker engine error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("environment has not been created")]
    NotCreated,

    #[error("environment already exists")]
    AlreadyExists,

    #[error("no console is attached")]
    NotAttached,

    #[error("no completed run to report")]
    NoExitState,

    #[error("server did not stop within {0:?}")]
    WaitTimeout(Duration),

    #[error("pre-start check failed: {0}")]
    PreStart(String),

    #[error("duplicate server: {0}")]
    DuplicateServer(ServerId),

    #[error("invalid server definition: {0}")]
    InvalidDefinition(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Known execution backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    Docker,
    Process,
}

impl EnvironmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Process => "process",
        }
    }
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-agnostic lifecycle contract for one managed server.
///
/// Every backend (container engine, bare host process) implements the whole
/// trait so that callers never branch on the concrete type. State is always
/// read from the backend; implementations must not answer from a cached flag
/// when the backend cannot be reached.
#[async_trait]
pub trait Environment: Send + Sync + 'static {
    /// Backend identifier.
    fn name(&self) -> EnvironmentKind;

    /// Whether the server process is alive right now.
    async fn is_running(&self) -> Result<bool>;

    /// Apply resource limits to a running instance without restarting it.
    /// Backends that cannot do this return `Ok(())`.
    async fn in_situ_update(&self) -> Result<()>;

    /// Pre-flight hook. `start` does not proceed if this fails.
    async fn on_before_start(&self) -> Result<()>;

    /// Start a created, stopped instance. Errors if already running.
    async fn start(&self) -> Result<()>;

    /// Ask the instance to shut down gracefully. Stopping a stopped instance
    /// is not an error.
    async fn stop(&self) -> Result<()>;

    /// Wait until the instance is no longer running.
    ///
    /// When `timeout` elapses first, the instance is killed and this returns
    /// once it is confirmed stopped if `terminate` is set; otherwise
    /// [`Error::WaitTimeout`] is returned and the instance keeps running.
    async fn wait_for_stop(&self, timeout: Duration, terminate: bool) -> Result<()>;

    /// Whether the backend resource exists and is bootable.
    async fn exists(&self) -> Result<bool>;

    /// Deliver `signal` immediately. Not an error if already stopped.
    async fn terminate(&self, signal: Signal) -> Result<()>;

    /// Remove every backend resource created for this instance. Idempotent.
    async fn destroy(&self) -> Result<()>;

    /// Outcome of the most recent completed run.
    async fn exit_state(&self) -> Result<ExitState>;

    /// Provision the backend resource `start` needs. Errors if it exists.
    async fn create(&self) -> Result<()>;

    /// Open the duplex console channel. Output is captured for the console
    /// stream; input is kept for [`Environment::send_command`].
    async fn attach(&self) -> Result<()>;

    /// Start forwarding console output to the emitter in the background
    /// until the instance stops. Returns without waiting for output.
    async fn follow_console_output(&self) -> Result<()>;

    /// Write one line to the console.
    async fn send_command(&self, line: &str) -> Result<()>;

    /// Most recent log lines, reading at most `max_bytes` from the tail.
    async fn readlog(&self, max_bytes: u64) -> Result<Vec<String>>;

    /// Start periodic resource sampling while the instance runs.
    async fn enable_resource_polling(&self) -> Result<()>;

    /// Stop sampling and reset the published usage to zero.
    async fn disable_resource_polling(&self) -> Result<()>;

    /// Latest published resource sample.
    fn resources(&self) -> ResourceUsage;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_kind_display_matches_serde() {
        for kind in [EnvironmentKind::Docker, EnvironmentKind::Process] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn environment_kind_serializes_lowercase() {
        let json = serde_json::to_string(&EnvironmentKind::Process).unwrap();
        assert_eq!(json, "\"process\"");
    }
}
