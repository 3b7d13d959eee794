use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinSet;
use wharf_env::{Server, Signal};

/// Power actions a client may request. `restart` is accepted but inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Kill => "kill",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidAction(pub String);

impl FromStr for PowerAction {
    type Err = InvalidAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "kill" => Ok(Self::Kill),
            other => Err(InvalidAction(other.to_string())),
        }
    }
}

/// Runs power actions as detached tasks that outlive the request.
///
/// Tasks are tracked in a `JoinSet` so shutdown can wait for them and abort
/// whatever is left. There is no per-server ordering between actions.
#[derive(Clone, Default)]
pub struct PowerDispatcher {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl PowerDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `action` against `server` and return immediately.
    pub fn dispatch(&self, server: Arc<Server>, action: PowerAction) {
        let mut tasks = self.lock();
        // Reap finished tasks so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(run(server, action));
    }

    /// Wait up to `grace` for in-flight actions, then abort the rest.
    pub async fn shutdown(&self, grace: Duration) {
        let mut tasks = std::mem::take(&mut *self.lock());
        if tasks.is_empty() {
            return;
        }

        tracing::info!(in_flight = tasks.len(), "waiting for power actions to finish");
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(remaining = tasks.len(), "aborting unfinished power actions");
            tasks.shutdown().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        match self.tasks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run(server: Arc<Server>, action: PowerAction) {
    let env = server.environment();
    let result = match action {
        PowerAction::Start => env.start().await,
        PowerAction::Stop => env.stop().await,
        PowerAction::Kill => env.terminate(Signal::SIGKILL).await,
        PowerAction::Restart => {
            tracing::debug!(server = %server.id(), "restart requested, nothing to do");
            Ok(())
        }
    };

    match result {
        Ok(()) => tracing::debug!(server = %server.id(), action = %action, "power action finished"),
        Err(e) => tracing::error!(
            server = %server.id(),
            action = %action,
            error = %e,
            "power action failed"
        ),
    }
}
