use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, ContainerStatsResponse, ContainerUpdateBody,
    HostConfig,
};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptionsBuilder, RemoveContainerOptions, StartContainerOptions,
    StatsOptionsBuilder,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::events::{Emitter, EventKind, forward_console};
use crate::task::TaskSlot;
use crate::types::{
    CPU_PERIOD_MICROS, ExitState, Limits, ResourceUsage, ServerId, StopConfig, stop_signal,
};
use crate::{Environment, EnvironmentKind, Error, Result, Signal, logs};

const CONTAINER_HOME: &str = "/home/container";
const OUTPUT_CAPACITY: usize = 256;
const STATE_POLL: Duration = Duration::from_millis(250);
/// Docker reports this `FinishedAt` for containers that never ran.
const NEVER_FINISHED: &str = "0001-01-01T00:00:00Z";
const FAILED_EXIT_CODE: u32 = 1;

type ConsoleInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Settings for a server run inside a Docker container.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub image: String,
    pub env: HashMap<String, String>,
    pub stop: StopConfig,
    pub limits: Limits,
    pub data_dir: PathBuf,
}

/// Docker engine backend. The container is named after the server id.
pub struct DockerEnvironment {
    id: ServerId,
    config: DockerConfig,
    docker: Docker,
    emitter: Emitter,
    stdin: Arc<Mutex<Option<ConsoleInput>>>,
    output: broadcast::Sender<String>,
    attached: Arc<watch::Sender<bool>>,
    resources: Arc<watch::Sender<ResourceUsage>>,
    attacher: TaskSlot,
    follower: TaskSlot,
    poller: TaskSlot,
    start_lock: Mutex<()>,
}

impl DockerEnvironment {
    pub fn new(id: ServerId, config: DockerConfig, docker: Docker, emitter: Emitter) -> Self {
        let (output, _) = broadcast::channel(OUTPUT_CAPACITY);
        let (attached, _) = watch::channel(false);
        let (resources, _) = watch::channel(ResourceUsage::default());

        Self {
            id,
            config,
            docker,
            emitter,
            stdin: Arc::new(Mutex::new(None)),
            output,
            attached: Arc::new(attached),
            resources: Arc::new(resources),
            attacher: TaskSlot::default(),
            follower: TaskSlot::default(),
            poller: TaskSlot::default(),
            start_lock: Mutex::new(()),
        }
    }

    fn container(&self) -> &str {
        self.id.as_str()
    }

    /// `None` when the container does not exist.
    async fn inspect(&self) -> Result<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(self.container(), None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(Some(response)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn kill(&self, signal: Signal) -> Result<()> {
        let options = KillContainerOptionsBuilder::default()
            .signal(signal.as_str())
            .build();
        match self.docker.kill_container(self.container(), Some(options)).await {
            Ok(()) => Ok(()),
            // 404: gone, 409: not running.
            Err(BollardError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn host_config(&self) -> HostConfig {
        HostConfig {
            binds: Some(vec![format!(
                "{}:{CONTAINER_HOME}",
                self.config.data_dir.display()
            )]),
            memory: self.config.limits.memory_bytes(),
            cpu_quota: self.config.limits.cpu_quota(),
            cpu_period: self.config.limits.cpu_quota().map(|_| CPU_PERIOD_MICROS),
            ..Default::default()
        }
    }

    async fn wait_not_running(&self) -> Result<()> {
        while self.is_running().await? {
            tokio::time::sleep(STATE_POLL).await;
        }
        Ok(())
    }
}

fn container_running(inspect: &ContainerInspectResponse) -> bool {
    inspect
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false)
}

fn exit_state_from(inspect: &ContainerInspectResponse) -> Option<ExitState> {
    let state = inspect.state.as_ref()?;
    if state.running.unwrap_or(false) {
        return None;
    }
    let finished = state.finished_at.as_deref().unwrap_or(NEVER_FINISHED);
    if finished == NEVER_FINISHED {
        return None;
    }
    Some(ExitState {
        // The engine reports -1 when the process could not be run at all;
        // surface that as a plain failure.
        exit_code: u32::try_from(state.exit_code.unwrap_or(0)).unwrap_or(FAILED_EXIT_CODE),
        oom_killed: state.oom_killed.unwrap_or(false),
    })
}

fn usage_from_stats(stats: &ContainerStatsResponse) -> ResourceUsage {
    let memory = stats.memory_stats.as_ref();

    let cpu_absolute = match (stats.cpu_stats.as_ref(), stats.precpu_stats.as_ref()) {
        (Some(cpu), Some(pre)) => {
            let total = cpu.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0);
            let pre_total = pre.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0);
            let system = cpu.system_cpu_usage.unwrap_or(0);
            let pre_system = pre.system_cpu_usage.unwrap_or(0);
            let cpu_delta = total.saturating_sub(pre_total) as f64;
            let system_delta = system.saturating_sub(pre_system) as f64;
            let cpus = cpu.online_cpus.unwrap_or(1) as f64;
            if system_delta > 0.0 {
                (cpu_delta / system_delta) * cpus * 100.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    };

    let (rx, tx) = stats
        .networks
        .as_ref()
        .map(|nets| {
            nets.values().fold((0, 0), |(rx, tx), n| {
                (rx + n.rx_bytes.unwrap_or(0), tx + n.tx_bytes.unwrap_or(0))
            })
        })
        .unwrap_or((0, 0));

    ResourceUsage {
        memory_bytes: memory.and_then(|m| m.usage).unwrap_or(0),
        memory_limit_bytes: memory.and_then(|m| m.limit).unwrap_or(0),
        cpu_absolute,
        network_rx_bytes: rx,
        network_tx_bytes: tx,
        sampled_at: Some(chrono::Utc::now()),
    }
}

/// Reassembles lines from raw console frames, which may split anywhere.
#[derive(Default)]
struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        (!self.partial.is_empty()).then(|| std::mem::take(&mut self.partial))
    }
}

#[derive(Deserialize)]
struct JsonLogRecord {
    log: String,
}

/// Unwrap a json-file log driver record; other lines pass through.
fn unwrap_log_line(line: String) -> String {
    match serde_json::from_str::<JsonLogRecord>(&line) {
        Ok(record) => record.log.trim_end_matches(['\n', '\r']).to_string(),
        Err(_) => line,
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn name(&self) -> EnvironmentKind {
        EnvironmentKind::Docker
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.inspect().await?.as_ref().is_some_and(container_running))
    }

    async fn in_situ_update(&self) -> Result<()> {
        if self.inspect().await?.is_none() {
            return Ok(());
        }

        let limits = &self.config.limits;
        let update = ContainerUpdateBody {
            memory: limits.memory_bytes(),
            cpu_quota: limits.cpu_quota(),
            cpu_period: limits.cpu_quota().map(|_| CPU_PERIOD_MICROS),
            ..Default::default()
        };
        self.docker.update_container(self.container(), update).await?;
        debug!(server = %self.id, "docker: applied resource limits");
        Ok(())
    }

    async fn on_before_start(&self) -> Result<()> {
        if self.inspect().await?.is_none() {
            return Err(Error::NotCreated);
        }
        tokio::fs::create_dir_all(&self.config.data_dir).await?;
        self.in_situ_update().await
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;

        match self.inspect().await? {
            None => return Err(Error::NotCreated),
            Some(inspect) if container_running(&inspect) => return Err(Error::AlreadyRunning),
            Some(_) => {}
        }
        self.on_before_start().await?;

        // Attach first so no early output is missed.
        self.attach().await?;
        self.follow_console_output().await?;

        self.docker
            .start_container(self.container(), None::<StartContainerOptions>)
            .await?;
        info!(server = %self.id, "docker: container started");

        self.enable_resource_polling().await
    }

    async fn stop(&self) -> Result<()> {
        if !self.is_running().await? {
            return Ok(());
        }

        match &self.config.stop {
            StopConfig::Command(line) => self.send_command(line).await,
            StopConfig::Signal(name) => {
                let signal = stop_signal(name)?;
                self.kill(signal).await
            }
        }
    }

    async fn wait_for_stop(&self, timeout: Duration, terminate: bool) -> Result<()> {
        match tokio::time::timeout(timeout, self.wait_not_running()).await {
            Ok(result) => return result,
            Err(_) if !terminate => return Err(Error::WaitTimeout(timeout)),
            Err(_) => {}
        }

        warn!(server = %self.id, "docker: container did not stop in time, killing");
        self.kill(Signal::SIGKILL).await?;
        self.wait_not_running().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.inspect().await?.is_some())
    }

    async fn terminate(&self, signal: Signal) -> Result<()> {
        if !self.is_running().await? {
            return Ok(());
        }
        self.kill(signal).await
    }

    async fn destroy(&self) -> Result<()> {
        self.disable_resource_polling().await?;
        self.attacher.cancel();
        self.follower.cancel();
        self.stdin.lock().await.take();

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(self.container(), Some(options))
            .await
        {
            Ok(()) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }
        info!(server = %self.id, "docker: container removed");
        Ok(())
    }

    async fn exit_state(&self) -> Result<ExitState> {
        let inspect = self.inspect().await?.ok_or(Error::NoExitState)?;
        exit_state_from(&inspect).ok_or(Error::NoExitState)
    }

    async fn create(&self) -> Result<()> {
        if self.inspect().await?.is_some() {
            return Err(Error::AlreadyExists);
        }
        tokio::fs::create_dir_all(&self.config.data_dir).await?;

        let env: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let body = ContainerCreateBody {
            image: Some(self.config.image.clone()),
            hostname: Some(self.id.to_string()),
            working_dir: Some(CONTAINER_HOME.to_string()),
            env: Some(env),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(self.host_config()),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: Some(self.id.to_string()),
            ..Default::default()
        };

        self.docker.create_container(Some(options), body).await?;
        info!(server = %self.id, image = %self.config.image, "docker: container created");
        Ok(())
    }

    async fn attach(&self) -> Result<()> {
        if self.attacher.is_active() {
            return Ok(());
        }

        let options = AttachContainerOptionsBuilder::default()
            .stream(true)
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .build();
        let results = self
            .docker
            .attach_container(self.container(), Some(options))
            .await?;

        *self.stdin.lock().await = Some(results.input);
        self.attached.send_replace(true);
        self.emitter.publish(EventKind::ConsoleAttached);

        let mut stream = results.output;
        let output = self.output.clone();
        let stdin = self.stdin.clone();
        let attached = self.attached.clone();
        let id = self.id.clone();

        self.attacher.replace(tokio::spawn(async move {
            let mut buffer = LineBuffer::default();
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(frame) => {
                        for line in buffer.push(&frame.into_bytes()) {
                            let _ = output.send(line);
                        }
                    }
                    Err(e) => {
                        warn!(server = %id, error = %e, "docker: console stream failed");
                        break;
                    }
                }
            }
            if let Some(rest) = buffer.flush() {
                let _ = output.send(rest);
            }
            stdin.lock().await.take();
            attached.send_replace(false);
            debug!(server = %id, "docker: console detached");
        }));
        Ok(())
    }

    async fn follow_console_output(&self) -> Result<()> {
        let mut attached = self.attached.subscribe();
        let done = async move {
            let _ = attached.wait_for(|a| !*a).await.map(|_| ());
        };
        self.follower
            .replace(forward_console(self.output.subscribe(), done, self.emitter.clone()));
        Ok(())
    }

    async fn send_command(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let input = stdin.as_mut().ok_or(Error::NotAttached)?;
        input.write_all(format!("{line}\n").as_bytes()).await?;
        input.flush().await?;
        Ok(())
    }

    async fn readlog(&self, max_bytes: u64) -> Result<Vec<String>> {
        let Some(log_path) = self.inspect().await?.and_then(|i| i.log_path) else {
            return Ok(Vec::new());
        };
        if log_path.is_empty() {
            return Ok(Vec::new());
        }

        let lines = logs::read_tail(Path::new(&log_path), max_bytes).await?;
        Ok(lines.into_iter().map(unwrap_log_line).collect())
    }

    async fn enable_resource_polling(&self) -> Result<()> {
        if self.poller.is_active() {
            return Ok(());
        }

        let docker = self.docker.clone();
        let resources = self.resources.clone();
        let name = self.id.to_string();
        let id = self.id.clone();

        self.poller.replace(tokio::spawn(async move {
            let options = StatsOptionsBuilder::default().stream(true).build();
            let mut stats = Box::pin(docker.stats(&name, Some(options)));
            while let Some(sample) = stats.next().await {
                match sample {
                    Ok(sample) => {
                        resources.send_replace(usage_from_stats(&sample));
                    }
                    Err(e) => {
                        debug!(server = %id, error = %e, "docker: stats stream ended");
                        break;
                    }
                }
            }
            resources.send_replace(ResourceUsage::default());
        }));
        Ok(())
    }

    async fn disable_resource_polling(&self) -> Result<()> {
        self.poller.cancel();
        self.resources.send_replace(ResourceUsage::default());
        Ok(())
    }

    fn resources(&self) -> ResourceUsage {
        self.resources.borrow().clone()
    }
}
