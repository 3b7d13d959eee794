use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};

use crate::types::ServerId;
use crate::{Environment, Error, Result};

/// One managed server: a stable identifier and the environment that runs it.
///
/// Lifecycle state is never stored here; ask the environment.
pub struct Server {
    id: ServerId,
    environment: Box<dyn Environment>,
}

impl Server {
    pub fn new(id: ServerId, environment: Box<dyn Environment>) -> Self {
        Self { id, environment }
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    pub fn environment(&self) -> &dyn Environment {
        self.environment.as_ref()
    }

    /// Bring the environment in line with the backend after a daemon boot:
    /// create what is missing, re-attach to what is already running.
    pub async fn reconcile(&self) -> Result<()> {
        let env = self.environment();

        if !env.exists().await? {
            info!(server = %self.id, environment = %env.name(), "creating missing environment");
            env.create().await?;
        }

        if env.is_running().await? {
            info!(server = %self.id, "server already running, re-attaching");
            if let Err(e) = env.attach().await {
                warn!(server = %self.id, error = %e, "could not re-attach console");
            } else {
                env.follow_console_output().await?;
            }
            env.enable_resource_polling().await?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Inner {
    order: Vec<Arc<Server>>,
    index: HashMap<ServerId, Arc<Server>>,
}

/// Registry of every server known to the daemon, unique by identifier.
///
/// Lookups take a shared lock and hand out `Arc`s, so callers never hold the
/// lock while driving an environment.
#[derive(Clone, Default)]
pub struct ServerCollection {
    inner: Arc<RwLock<Inner>>,
}

impl ServerCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Server>> {
        self.read().index.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().index.contains_key(id)
    }

    /// All servers in registration order.
    pub fn all(&self) -> Vec<Arc<Server>> {
        self.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().order.is_empty()
    }

    pub fn add(&self, server: Server) -> Result<Arc<Server>> {
        let mut inner = self.write();
        if inner.index.contains_key(server.id()) {
            return Err(Error::DuplicateServer(server.id().clone()));
        }
        let server = Arc::new(server);
        inner.index.insert(server.id().clone(), server.clone());
        inner.order.push(server.clone());
        Ok(server)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Server>> {
        let mut inner = self.write();
        let server = inner.index.remove(id)?;
        inner.order.retain(|s| s.id().as_str() != id);
        Some(server)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
