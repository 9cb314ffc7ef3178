//! Controller Supervisor
//!
//! Keeps the headless controller process alive and reachable.
//!
//! # States
//!
//! ```text
//! NotStarted --ensure--> Starting --probe ok--> Ready
//!                            |                   |  ^
//!                       timeout            N failed probes / probe ok
//!                            v                   v  |
//!                        Unreachable <-----------+--+
//! any --shutdown--> Stopping --exit or kill--> Stopped
//! ```
//!
//! Readiness is published through [`ControllerStatus`], a cloneable handle
//! the periodic loops check before every request.

use crate::channel::CommandChannel;
use crate::error::DriverError;
use crate::process::{self, Termination};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Serial-port hint file read by the controller at startup.
pub const COM_PORT_HINT_FILE: &str = "com_port.txt";

/// Controller Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SupervisorState {
    #[default]
    NotStarted = 0,
    Starting = 1,
    Ready = 2,
    Unreachable = 3,
    Stopping = 4,
    Stopped = 5,
}

impl SupervisorState {
    /// Invalid values map to `NotStarted`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Ready,
            3 => Self::Unreachable,
            4 => Self::Stopping,
            5 => Self::Stopped,
            _ => Self::NotStarted,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Unreachable => "unreachable",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
struct StatusShared {
    state: AtomicU8,
    ever_ready: AtomicBool,
    probe_failures: AtomicU32,
    failure_threshold: u32,
}

/// Readiness handle shared with the periodic loops.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    shared: Arc<StatusShared>,
}

impl ControllerStatus {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            shared: Arc::new(StatusShared {
                state: AtomicU8::new(SupervisorState::NotStarted.as_u8()),
                ever_ready: AtomicBool::new(false),
                probe_failures: AtomicU32::new(0),
                failure_threshold: failure_threshold.max(1),
            }),
        }
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SupervisorState::Ready
    }

    /// Whether the controller has been Ready at least once.
    pub fn ever_ready(&self) -> bool {
        self.shared.ever_ready.load(Ordering::Acquire)
    }

    /// Whether periodic status traffic may flow.
    ///
    /// True when Ready, or Unreachable after having been Ready (so the
    /// poller can observe recovery).
    pub fn admits_traffic(&self) -> bool {
        match self.state() {
            SupervisorState::Ready => true,
            SupervisorState::Unreachable => self.ever_ready(),
            _ => false,
        }
    }

    pub fn consecutive_probe_failures(&self) -> u32 {
        self.shared.probe_failures.load(Ordering::Relaxed)
    }

    /// Feed one health probe outcome.
    pub fn record_probe(&self, ok: bool) -> SupervisorState {
        if ok {
            self.shared.probe_failures.store(0, Ordering::Relaxed);
            if self.ever_ready()
                && self.transition(SupervisorState::Unreachable, SupervisorState::Ready)
            {
                info!("controller reachable again");
            }
        } else {
            let failures = self.shared.probe_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= self.shared.failure_threshold
                && self.transition(SupervisorState::Ready, SupervisorState::Unreachable)
            {
                warn!(failures, "controller stopped answering health probes");
            }
        }
        self.state()
    }

    fn transition(&self, from: SupervisorState, to: SupervisorState) -> bool {
        let ok = self
            .shared
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            debug!(from = from.name(), to = to.name(), "supervisor transition");
        }
        ok
    }

    /// Move to `to` unless shutdown already began.
    fn advance(&self, to: SupervisorState) -> bool {
        let mut current = self.state();
        loop {
            if current.is_shutting_down() && !to.is_shutting_down() {
                return false;
            }
            if current == to {
                return true;
            }
            if self.transition(current, to) {
                return true;
            }
            current = self.state();
        }
    }

    fn mark_ready(&self) {
        self.shared.probe_failures.store(0, Ordering::Relaxed);
        if self.advance(SupervisorState::Ready) {
            self.shared.ever_ready.store(true, Ordering::Release);
        }
    }
}

/// How to launch a locally managed controller.
#[derive(Debug, Clone)]
pub struct ControllerLaunch {
    pub program: String,
    pub args: Vec<String>,
    /// Also where the serial-port hint file is written.
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ControllerLaunch {
    /// `<interpreter> -u <script>` run from the script's directory.
    pub fn python_script(interpreter: impl Into<String>, script: impl AsRef<Path>) -> Self {
        let script = script.as_ref();
        Self {
            program: interpreter.into(),
            args: vec!["-u".to_string(), script.display().to_string()],
            working_dir: script.parent().map(Path::to_path_buf),
            env: Vec::new(),
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    /// Spawn the controller when the endpoint does not answer.
    pub auto_start: bool,
    pub launch: Option<ControllerLaunch>,
    pub com_port: Option<String>,
    /// Run the controller against a fake serial port when no port is set.
    pub simulator_fallback: bool,
    pub startup_timeout: Duration,
    pub probe_interval: Duration,
    pub shutdown_grace: Duration,
    /// Consecutive failed probes before Ready becomes Unreachable.
    pub failure_threshold: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            auto_start: false,
            launch: None,
            com_port: None,
            simulator_fallback: true,
            startup_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Controller endpoint and, when locally managed, its process id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerEndpoint {
    pub host: String,
    pub port: u16,
    pub pid: Option<u32>,
}

struct OwnedProcess {
    child: Child,
    started_at: Instant,
}

/// Controller Supervisor
pub struct ControllerSupervisor {
    config: SupervisorConfig,
    channel: CommandChannel,
    status: ControllerStatus,
    process: Mutex<Option<OwnedProcess>>,
    ensure_lock: Mutex<()>,
    spawn_count: AtomicU32,
}

impl ControllerSupervisor {
    pub fn new(config: SupervisorConfig, channel: CommandChannel) -> Self {
        let status = ControllerStatus::new(config.failure_threshold);
        Self {
            config,
            channel,
            status,
            process: Mutex::new(None),
            ensure_lock: Mutex::new(()),
            spawn_count: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn status(&self) -> ControllerStatus {
        self.status.clone()
    }

    pub fn state(&self) -> SupervisorState {
        self.status.state()
    }

    /// Number of controller processes spawned so far.
    pub fn spawn_count(&self) -> u32 {
        self.spawn_count.load(Ordering::Relaxed)
    }

    pub fn endpoint(&self) -> ControllerEndpoint {
        let pid = self.process.lock().as_ref().map(|p| p.child.id());
        ControllerEndpoint {
            host: self.config.host.clone(),
            port: self.config.port,
            pid,
        }
    }

    /// Bring the controller to Ready if possible.
    ///
    /// Idempotent: an endpoint that already answers is attached without
    /// spawning, and a live owned process is never spawned twice.
    pub fn ensure(&self) -> Result<SupervisorState, DriverError> {
        let _guard = self.ensure_lock.lock();
        if self.state().is_shutting_down() {
            return Err(DriverError::ShuttingDown);
        }

        if self.channel.probe().is_ok() {
            if self.state() != SupervisorState::Ready {
                info!(host = %self.config.host, port = self.config.port, "controller reachable");
            }
            self.status.mark_ready();
            return Ok(self.state());
        }

        // A Ready controller only degrades through the failure threshold.
        if self.state() == SupervisorState::Ready {
            return Ok(self.status.record_probe(false));
        }

        if !self.status.advance(SupervisorState::Starting) {
            return Err(DriverError::ShuttingDown);
        }

        if !self.owned_process_alive() {
            if self.config.auto_start {
                match &self.config.launch {
                    Some(launch) => {
                        if let Err(e) = self.spawn(launch) {
                            error!(error = %e, "failed to start controller");
                            self.status
                                .transition(SupervisorState::Starting, SupervisorState::Unreachable);
                            return Err(e);
                        }
                    },
                    None => warn!("auto-start enabled but no controller launch configured"),
                }
            } else {
                debug!("auto-start disabled, waiting for an external controller");
            }
        }

        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.config.probe_interval.min(deadline - now));
            if self.state().is_shutting_down() {
                return Err(DriverError::ShuttingDown);
            }
            if self.channel.probe().is_ok() {
                info!("controller ready");
                self.status.mark_ready();
                return Ok(self.state());
            }
            if self.config.auto_start
                && self.config.launch.is_some()
                && !self.owned_process_alive()
            {
                warn!("controller process exited during startup");
                break;
            }
        }

        if self
            .status
            .transition(SupervisorState::Starting, SupervisorState::Unreachable)
        {
            warn!(
                timeout_ms = self.config.startup_timeout.as_millis() as u64,
                "controller did not become ready"
            );
        }
        Ok(self.state())
    }

    /// Stop the owned controller process: SIGTERM, grace period, kill.
    pub fn shutdown(&self) -> Result<(), DriverError> {
        if self.state() == SupervisorState::Stopped {
            return Ok(());
        }
        self.status.advance(SupervisorState::Stopping);
        let owned = self.process.lock().take();
        let result = match owned {
            Some(mut owned) => {
                let pid = owned.child.id();
                info!(pid, "stopping controller");
                match process::terminate(&mut owned.child, self.config.shutdown_grace) {
                    Ok(termination) => {
                        log_termination(pid, owned.started_at, &termination);
                        Ok(())
                    },
                    Err(e) => Err(DriverError::Io(e)),
                }
            },
            None => Ok(()),
        };
        self.status.advance(SupervisorState::Stopped);
        result
    }

    /// Reaps an exited owned process. Returns whether one is still alive.
    fn owned_process_alive(&self) -> bool {
        let mut guard = self.process.lock();
        let Some(owned) = guard.as_mut() else {
            return false;
        };
        match owned.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(pid = owned.child.id(), ?status, "controller process exited");
                *guard = None;
                false
            },
            Err(e) => {
                warn!(error = %e, "cannot query controller process");
                true
            },
        }
    }

    fn spawn(&self, launch: &ControllerLaunch) -> Result<(), DriverError> {
        let mut guard = self.process.lock();
        if guard.is_some() || self.state().is_shutting_down() {
            return Ok(());
        }

        let mut command = Command::new(&launch.program);
        command.args(&launch.args);
        if let Some(dir) = &launch.working_dir {
            command.current_dir(dir);
            if let Some(port) = &self.config.com_port {
                write_port_hint(dir, port);
            }
        }
        command.env("PAROL6_NOAUTOHOME", "1");
        command.env("PYTHONUNBUFFERED", "1");
        if self.config.com_port.is_none() && self.config.simulator_fallback {
            info!("no serial port configured, controller starts in simulator mode");
            command.env("PAROL6_FAKE_SERIAL", "1");
        }
        command.envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        process::isolate_process_group(&mut command);

        let child = command
            .spawn()
            .map_err(|e| DriverError::Spawn(format!("{}: {e}", launch.program)))?;
        info!(pid = child.id(), program = %launch.program, "controller spawned");
        self.spawn_count.fetch_add(1, Ordering::Relaxed);
        *guard = Some(OwnedProcess {
            child,
            started_at: Instant::now(),
        });
        Ok(())
    }
}

impl Drop for ControllerSupervisor {
    fn drop(&mut self) {
        let owns_process = self.process.lock().is_some();
        if owns_process && let Err(e) = self.shutdown() {
            warn!(error = %e, "controller shutdown on drop failed");
        }
    }
}

fn write_port_hint(dir: &Path, port: &str) {
    let hint = dir.join(COM_PORT_HINT_FILE);
    if let Err(e) = std::fs::write(&hint, format!("{}\n", port.trim())) {
        warn!(path = %hint.display(), error = %e, "failed to write serial port hint");
    }
}

fn log_termination(pid: u32, started_at: Instant, termination: &Termination) {
    let uptime_s = started_at.elapsed().as_secs();
    match termination {
        Termination::Forced(status) => {
            warn!(pid, uptime_s, ?status, "controller killed after grace period")
        },
        other => info!(pid, uptime_s, status = ?other.status(), "controller stopped"),
    }
}
