use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::events::{Emitter, EventKind, forward_console};
use crate::task::TaskSlot;
use crate::types::{ExitState, ResourceUsage, ServerId, StopConfig, stop_signal};
use crate::{Environment, EnvironmentKind, Error, Result, logs};

/// Linux USER_HZ; `/proc/<pid>/stat` times are in these ticks.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;
const OUTPUT_CAPACITY: usize = 256;

/// Settings for a server run as a plain host process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub stop: StopConfig,
    pub data_dir: PathBuf,
    pub log_path: PathBuf,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running { pid: u32 },
    Exited(ExitState),
}

impl RunState {
    fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

#[derive(Default)]
struct Console {
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

/// Host-process backend.
///
/// The child runs in its own process group so signals reach the whole tree.
/// A waiter task owns the child handle and publishes its exit through a
/// watch channel, which is the only source for `is_running`.
pub struct ProcessEnvironment {
    id: ServerId,
    config: ProcessConfig,
    emitter: Emitter,
    state: Arc<watch::Sender<RunState>>,
    console: Mutex<Console>,
    output: broadcast::Sender<String>,
    resources: Arc<watch::Sender<ResourceUsage>>,
    poller: TaskSlot,
    follower: TaskSlot,
    spawn_lock: Mutex<()>,
}

impl ProcessEnvironment {
    pub fn new(id: ServerId, config: ProcessConfig, emitter: Emitter) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        let (resources, _) = watch::channel(ResourceUsage::default());
        let (output, _) = broadcast::channel(OUTPUT_CAPACITY);

        Self {
            id,
            config,
            emitter,
            state: Arc::new(state),
            console: Mutex::new(Console::default()),
            output,
            resources: Arc::new(resources),
            poller: TaskSlot::default(),
            follower: TaskSlot::default(),
            spawn_lock: Mutex::new(()),
        }
    }

    fn current(&self) -> RunState {
        *self.state.borrow()
    }

    fn spawn_waiter(&self, mut child: tokio::process::Child) {
        let state = self.state.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => exit_state_from(status),
                Err(e) => {
                    warn!(server = %id, error = %e, "failed to wait on server process");
                    ExitState {
                        exit_code: 1,
                        oom_killed: false,
                    }
                }
            };
            info!(server = %id, exit_code = exit.exit_code, "server process exited");
            state.send_replace(RunState::Exited(exit));
        });
    }

    fn spawn_pump<R>(&self, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let output = self.output.clone();
        let log_path = self.config.log_path.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let mut log = match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
            {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(server = %id, path = %log_path.display(), error = %e, "console log unavailable");
                    None
                }
            };

            // Raw lines: output is not guaranteed to be UTF-8, and the pipe
            // must keep draining or the child dies of SIGPIPE.
            let mut reader = BufReader::new(stream);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(server = %id, error = %e, "failed to read console output");
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if let Some(f) = log.as_mut() {
                    let entry = format!("{line}\n");
                    if let Err(e) = f.write_all(entry.as_bytes()).await {
                        warn!(server = %id, error = %e, "failed to write console log");
                        log = None;
                    }
                }
                let _ = output.send(line);
            }
        });
    }

    /// Hand the captured stdout/stderr to line pumps. No-op once taken.
    async fn pump_console(&self) -> Result<()> {
        let (stdout, stderr) = {
            let mut console = self.console.lock().await;
            if console.stdin.is_none() {
                return Err(Error::NotAttached);
            }
            (console.stdout.take(), console.stderr.take())
        };

        if stdout.is_none() && stderr.is_none() {
            return Ok(());
        }
        if let Some(out) = stdout {
            self.spawn_pump(out);
        }
        if let Some(err) = stderr {
            self.spawn_pump(err);
        }
        self.emitter.publish(EventKind::ConsoleAttached);
        Ok(())
    }

}

async fn wait_stopped(rx: &mut watch::Receiver<RunState>) {
    // A dropped sender means the environment is gone; nothing is running.
    let _ = rx.wait_for(|s| !s.is_running()).await.map(|_| ());
}

fn exit_state_from(status: ExitStatus) -> ExitState {
    #[cfg(unix)]
    let code = {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(1)
    };
    #[cfg(not(unix))]
    let code = status.code().unwrap_or(1);

    ExitState {
        exit_code: code as u32,
        oom_killed: false,
    }
}

fn deliver(pid: u32, signal: Signal) -> Result<()> {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Environment for ProcessEnvironment {
    fn name(&self) -> EnvironmentKind {
        EnvironmentKind::Process
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.current().is_running())
    }

    async fn in_situ_update(&self) -> Result<()> {
        Ok(())
    }

    async fn on_before_start(&self) -> Result<()> {
        if !fs::try_exists(&self.config.data_dir).await? {
            return Err(Error::NotCreated);
        }
        if let Some(parent) = self.config.log_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.spawn_lock.lock().await;

        if self.current().is_running() {
            return Err(Error::AlreadyRunning);
        }
        self.on_before_start().await?;

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .current_dir(&self.config.data_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()?;

        let pid = child.id().ok_or_else(|| {
            Error::PreStart("process exited before a pid was assigned".into())
        })?;

        {
            let mut console = self.console.lock().await;
            console.stdin = child.stdin.take();
            console.stdout = child.stdout.take();
            console.stderr = child.stderr.take();
        }

        self.state.send_replace(RunState::Running { pid });
        self.follow_console_output().await?;
        self.pump_console().await?;
        self.spawn_waiter(child);
        info!(server = %self.id, pid, "server process started");

        self.enable_resource_polling().await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.current().is_running() {
            return Ok(());
        }

        match &self.config.stop {
            StopConfig::Command(line) => self.send_command(line).await,
            StopConfig::Signal(name) => {
                let signal = stop_signal(name)?;
                self.terminate(signal).await
            }
        }
    }

    async fn wait_for_stop(&self, timeout: Duration, terminate: bool) -> Result<()> {
        let mut rx = self.state.subscribe();
        if tokio::time::timeout(timeout, wait_stopped(&mut rx)).await.is_ok() {
            return Ok(());
        }

        if !terminate {
            return Err(Error::WaitTimeout(timeout));
        }

        warn!(server = %self.id, "server did not stop in time, killing");
        self.terminate(Signal::SIGKILL).await?;
        wait_stopped(&mut rx).await;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(true)
    }

    async fn terminate(&self, signal: Signal) -> Result<()> {
        match self.current() {
            RunState::Running { pid } => {
                debug!(server = %self.id, pid, signal = signal.as_str(), "signalling server process");
                deliver(pid, signal)
            }
            _ => Ok(()),
        }
    }

    async fn destroy(&self) -> Result<()> {
        if self.current().is_running() {
            self.terminate(Signal::SIGKILL).await?;
            wait_stopped(&mut self.state.subscribe()).await;
        }
        self.disable_resource_polling().await?;

        for result in [
            fs::remove_dir_all(&self.config.data_dir).await,
            fs::remove_file(&self.config.log_path).await,
        ] {
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn exit_state(&self) -> Result<ExitState> {
        match self.current() {
            RunState::Exited(exit) => Ok(exit),
            _ => Err(Error::NoExitState),
        }
    }

    async fn create(&self) -> Result<()> {
        if fs::try_exists(&self.config.data_dir).await? {
            return Err(Error::AlreadyExists);
        }
        fs::create_dir_all(&self.config.data_dir).await?;
        Ok(())
    }

    async fn attach(&self) -> Result<()> {
        if !self.current().is_running() {
            return Err(Error::NotAttached);
        }
        self.pump_console().await
    }

    async fn follow_console_output(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        let done = async move { wait_stopped(&mut state).await };
        self.follower
            .replace(forward_console(self.output.subscribe(), done, self.emitter.clone()));
        Ok(())
    }

    async fn send_command(&self, line: &str) -> Result<()> {
        if !self.current().is_running() {
            return Err(Error::NotAttached);
        }

        let mut console = self.console.lock().await;
        let stdin = console.stdin.as_mut().ok_or(Error::NotAttached)?;
        stdin.write_all(format!("{line}\n").as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn readlog(&self, max_bytes: u64) -> Result<Vec<String>> {
        logs::read_tail(&self.config.log_path, max_bytes).await
    }

    async fn enable_resource_polling(&self) -> Result<()> {
        if self.poller.is_active() {
            return Ok(());
        }

        let state = self.state.clone();
        let resources = self.resources.clone();
        let interval = self.config.poll_interval;
        let id = self.id.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last: Option<(u64, Instant)> = None;
            loop {
                ticker.tick().await;
                let RunState::Running { pid } = *state.borrow() else {
                    break;
                };
                match sample(pid, &mut last).await {
                    Ok(usage) => {
                        resources.send_replace(usage);
                    }
                    Err(e) => debug!(server = %id, error = %e, "resource sample failed"),
                }
            }
            resources.send_replace(ResourceUsage::default());
        });

        self.poller.replace(task);
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

// ── /proc sampling ──────────────────────────────────────────────────

async fn sample(pid: u32, last: &mut Option<(u64, Instant)>) -> std::io::Result<ResourceUsage> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).await?;
    let status = fs::read_to_string(format!("/proc/{pid}/status")).await?;

    let ticks = parse_cpu_ticks(&stat)
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidData, "malformed stat"))?;
    let rss_bytes = parse_rss_bytes(&status).unwrap_or(0);

    let now = Instant::now();
    let cpu_absolute = match last.replace((ticks, now)) {
        Some((prev_ticks, prev_at)) => {
            let elapsed = now.duration_since(prev_at).as_secs_f64();
            if elapsed > 0.0 {
                let used = ticks.saturating_sub(prev_ticks) as f64 / CLOCK_TICKS_PER_SEC;
                (used / elapsed) * 100.0
            } else {
                0.0
            }
        }
        None => 0.0,
    };

    Ok(ResourceUsage {
        memory_bytes: rss_bytes,
        cpu_absolute,
        sampled_at: Some(chrono::Utc::now()),
        ..ResourceUsage::default()
    })
}

/// utime + stime from `/proc/<pid>/stat`.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// `VmRSS` from `/proc/<pid>/status`, in bytes.
fn parse_rss_bytes(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}
