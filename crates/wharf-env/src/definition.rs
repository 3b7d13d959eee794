//! Server definitions read at boot, and construction of the registry from them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bollard::Docker;
use serde::Deserialize;

use crate::docker::{DockerConfig, DockerEnvironment};
use crate::events::EventBus;
use crate::process::{ProcessConfig, ProcessEnvironment};
use crate::types::{Limits, ServerId, StopConfig, stop_signal};
use crate::{Environment, EnvironmentKind, Error, Result, Server, ServerCollection};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerDefinition {
    pub uuid: ServerId,
    pub environment: EnvironmentDefinition,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EnvironmentDefinition {
    Docker {
        image: String,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        stop: StopConfig,
        #[serde(default)]
        limits: Limits,
    },
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        stop: StopConfig,
    },
}

impl EnvironmentDefinition {
    pub fn kind(&self) -> EnvironmentKind {
        match self {
            Self::Docker { .. } => EnvironmentKind::Docker,
            Self::Process { .. } => EnvironmentKind::Process,
        }
    }
}

/// Host-wide settings shared by every server built from definitions.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub poll_interval: Duration,
    pub events: EventBus,
}

/// Read a JSON array of server definitions.
pub async fn load_definitions(path: &Path) -> Result<Vec<ServerDefinition>> {
    let raw = tokio::fs::read(path).await?;
    let defs: Vec<ServerDefinition> = serde_json::from_slice(&raw)
        .map_err(|e| Error::InvalidDefinition(format!("{}: {e}", path.display())))?;

    for def in &defs {
        validate(def)?;
    }
    Ok(defs)
}

fn validate(def: &ServerDefinition) -> Result<()> {
    if def.uuid.as_str().trim().is_empty() {
        return Err(Error::InvalidDefinition("server uuid is empty".into()));
    }
    if def.uuid.as_str().contains(['/', '\\']) || def.uuid.as_str().starts_with('.') {
        return Err(Error::InvalidDefinition(format!(
            "server uuid {} is not usable as a path component",
            def.uuid
        )));
    }
    let stop = match &def.environment {
        EnvironmentDefinition::Docker { image, .. } if image.trim().is_empty() => {
            return Err(Error::InvalidDefinition(format!(
                "server {} has no image",
                def.uuid
            )));
        }
        EnvironmentDefinition::Process { command, .. } if command.trim().is_empty() => {
            return Err(Error::InvalidDefinition(format!(
                "server {} has no command",
                def.uuid
            )));
        }
        EnvironmentDefinition::Docker { stop, .. }
        | EnvironmentDefinition::Process { stop, .. } => stop,
    };

    if let StopConfig::Signal(name) = stop {
        if stop_signal(name).is_err() {
            return Err(Error::InvalidDefinition(format!(
                "server {} has unknown stop signal {name}",
                def.uuid
            )));
        }
    }
    Ok(())
}

/// Construct every server with its environment and register it.
///
/// The Docker connection is only opened when at least one definition needs it.
pub fn build_collection(defs: Vec<ServerDefinition>, ctx: &BuildContext) -> Result<ServerCollection> {
    let servers = ServerCollection::new();
    let mut docker: Option<Docker> = None;

    for def in defs {
        let id = def.uuid;
        let kind = def.environment.kind();
        let data_dir = ctx.data_dir.join(id.as_str());
        let emitter = ctx.events.emitter(id.clone());

        let environment: Box<dyn Environment> = match def.environment {
            EnvironmentDefinition::Docker {
                image,
                env,
                stop,
                limits,
            } => {
                let handle = match &docker {
                    Some(d) => d.clone(),
                    None => {
                        let d = Docker::connect_with_local_defaults()?;
                        docker = Some(d.clone());
                        d
                    }
                };
                let config = DockerConfig {
                    image,
                    env,
                    stop,
                    limits,
                    data_dir,
                };
                Box::new(DockerEnvironment::new(id.clone(), config, handle, emitter))
            }
            EnvironmentDefinition::Process {
                command,
                args,
                env,
                stop,
            } => {
                let config = ProcessConfig {
                    command,
                    args,
                    env,
                    stop,
                    data_dir,
                    log_path: ctx.log_dir.join(format!("{id}.log")),
                    poll_interval: ctx.poll_interval,
                };
                Box::new(ProcessEnvironment::new(id.clone(), config, emitter))
            }
        };

        servers.add(Server::new(id.clone(), environment))?;
        tracing::debug!(server = %id, environment = %kind, "registered server");
    }

    Ok(servers)
}
