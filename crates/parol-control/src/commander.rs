//! Commander - assembles the control stack
//!
//! One Command Channel shared by the supervisor, the cadence driver, the
//! status poller and the program runner.
//!
//! # Startup
//!
//! The controller is ensured first. With `require_ready` an unreachable
//! controller aborts startup with [`ControlError::NotReady`]; otherwise the
//! loops start anyway and a reconnect thread keeps calling `ensure()`.
//!
//! # Shutdown
//!
//! Reconnect thread, cadence driver (final STOP if jogging), status poller,
//! running program, controller process. In that order.

use crate::cadence::{CadenceDriver, CadenceStats};
use crate::config::CommanderConfig;
use crate::error::ControlError;
use crate::intent::{IntentSlot, JogIntent};
use crate::library::ProgramLibrary;
use crate::poller::{StatusPoller, TelemetryObserver};
use crate::runner::{ProgramRunSnapshot, ProgramRunner};
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use parol_driver::{
    CommandChannel, ControllerEndpoint, ControllerSupervisor, DriverError, Holder, Owner,
    StreamState, SupervisorState, Transport,
};
use parol_protocol::{Command, LoopStats, Query, Response, Telemetry};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// One-shot robot action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RobotAction {
    Stop,
    Enable,
    Disable,
    Home,
    ClearError,
}

impl RobotAction {
    pub fn command(self) -> Command {
        match self {
            Self::Stop => Command::Stop,
            Self::Enable => Command::Enable,
            Self::Disable => Command::Disable,
            Self::Home => Command::Home,
            Self::ClearError => Command::ClearError,
        }
    }
}

impl FromStr for RobotAction {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(Self::Stop),
            "enable" => Ok(Self::Enable),
            "disable" => Ok(Self::Disable),
            "home" => Ok(Self::Home),
            "clear-error" | "clear_error" => Ok(Self::ClearError),
            other => Err(ControlError::InvalidConfig(format!(
                "unknown robot action {other:?}"
            ))),
        }
    }
}

/// Controller section of [`CommanderStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct ControllerView {
    pub state: &'static str,
    pub host: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub spawn_count: u32,
}

/// Link section of [`CommanderStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct LinkView {
    pub reachable: bool,
    pub consecutive_failures: u32,
    pub last_success_age_ms: Option<u64>,
    /// `active`, or `paused` while a program holds the link.
    pub stream: &'static str,
    pub queries: u64,
    pub timeouts: u64,
    pub malformed_responses: u64,
}

/// Aggregated status for observers.
#[derive(Debug, Clone, Serialize)]
pub struct CommanderStatus {
    pub controller: ControllerView,
    pub link: LinkView,
    pub telemetry: Option<Telemetry>,
    pub cadence: CadenceStats,
    pub program: Option<ProgramRunSnapshot>,
}

struct Reconnector {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// The running control stack.
pub struct Commander {
    config: CommanderConfig,
    channel: CommandChannel,
    supervisor: Arc<ControllerSupervisor>,
    intents: Arc<IntentSlot>,
    cadence: Mutex<Option<CadenceDriver>>,
    poller: Mutex<Option<StatusPoller>>,
    telemetry: TelemetryObserver,
    runner: ProgramRunner,
    library: ProgramLibrary,
    reconnect: Mutex<Option<Reconnector>>,
    shut_down: AtomicBool,
}

impl Commander {
    /// Validate `config`, open the channel over `transport` and start everything.
    pub fn start(
        config: CommanderConfig,
        transport: impl Transport + 'static,
    ) -> Result<Self, ControlError> {
        config.validate()?;
        let channel = CommandChannel::new(transport, config.channel_config());
        Self::with_channel(config, channel)
    }

    /// Start over an existing Command Channel.
    pub fn with_channel(
        config: CommanderConfig,
        channel: CommandChannel,
    ) -> Result<Self, ControlError> {
        config.validate()?;
        let supervisor = Arc::new(ControllerSupervisor::new(
            config.supervisor_config(),
            channel.clone(),
        ));

        let state = supervisor.ensure()?;
        if state != SupervisorState::Ready && config.require_ready {
            if let Err(e) = supervisor.shutdown() {
                warn!(error = %e, "controller shutdown after failed startup");
            }
            return Err(ControlError::NotReady(format!(
                "controller at {}:{} is {}",
                config.controller.host,
                config.controller.port,
                state.name()
            )));
        }
        if state != SupervisorState::Ready {
            warn!(state = state.name(), "starting without a ready controller");
        }

        let runner = ProgramRunner::new(config.runner_config(), channel.clone())?;
        let library = ProgramLibrary::new(config.programs.dir.clone());
        let intents = Arc::new(IntentSlot::new());
        let cadence = CadenceDriver::start(
            config.cadence_config(),
            intents.clone(),
            channel.clone(),
            supervisor.status(),
        )?;
        let poller = StatusPoller::start(
            config.poller_config(),
            channel.clone(),
            supervisor.status(),
        )?;
        let telemetry = poller.observer();
        let reconnect = spawn_reconnector(&config, &supervisor, &channel)?;

        info!(
            controller = %format!("{}:{}", config.controller.host, config.controller.port),
            state = state.name(),
            "commander started"
        );
        Ok(Self {
            config,
            channel,
            supervisor,
            intents,
            cadence: Mutex::new(Some(cadence)),
            poller: Mutex::new(Some(poller)),
            telemetry,
            runner,
            library,
            reconnect: Mutex::new(Some(reconnect)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CommanderConfig {
        &self.config
    }

    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    pub fn supervisor(&self) -> &ControllerSupervisor {
        &self.supervisor
    }

    pub fn runner(&self) -> &ProgramRunner {
        &self.runner
    }

    pub fn library(&self) -> &ProgramLibrary {
        &self.library
    }

    pub fn telemetry(&self) -> &TelemetryObserver {
        &self.telemetry
    }

    pub fn controller_state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    pub fn endpoint(&self) -> ControllerEndpoint {
        self.supervisor.endpoint()
    }

    /// Re-run the supervisor's ensure (idempotent).
    pub fn ensure_controller(&self) -> Result<SupervisorState, ControlError> {
        Ok(self.supervisor.ensure()?)
    }

    /// Replace the latest jog intent.
    pub fn submit_jog(&self, intent: JogIntent) -> Result<u64, ControlError> {
        self.require_stream()?;
        Ok(self.intents.submit(intent))
    }

    /// Submit "no intent"; the cadence driver sends one STOP if jogging.
    pub fn release_jog(&self) -> u64 {
        self.intents.release()
    }

    /// Forward a one-shot action under the stream role.
    pub fn robot_action(&self, action: RobotAction) -> Result<(), ControlError> {
        if action == RobotAction::Stop {
            self.intents.release();
        }
        self.send_now(&action.command())
    }

    /// Send `SET_PORT` for the controller's serial device.
    pub fn set_com_port(&self, port: &str) -> Result<(), ControlError> {
        let port = port.trim();
        if port.is_empty() {
            return Err(ControlError::InvalidConfig(
                "serial port must not be empty".to_string(),
            ));
        }
        self.send_now(&Command::SetPort(port.to_string()))
    }

    /// Query the controller's loop statistics.
    pub fn loop_stats(&self) -> Result<LoopStats, ControlError> {
        self.require_ready()?;
        match self.channel.query(Owner::Stream, Query::LoopStats)? {
            Response::LoopStats(stats) => Ok(stats),
            other => Err(ControlError::Driver(DriverError::Malformed(
                parol_protocol::ProtocolError::UnexpectedResponse {
                    expected: "LOOP_STATS",
                    actual: other.tag().to_string(),
                },
            ))),
        }
    }

    pub fn cadence_stats(&self) -> CadenceStats {
        self.cadence
            .lock()
            .as_ref()
            .map(CadenceDriver::stats)
            .unwrap_or_default()
    }

    pub fn status(&self) -> CommanderStatus {
        let endpoint = self.supervisor.endpoint();
        let health = self.telemetry.health();
        let link = self.channel.health().snapshot();
        CommanderStatus {
            controller: ControllerView {
                state: self.supervisor.state().name(),
                host: endpoint.host,
                port: endpoint.port,
                pid: endpoint.pid,
                spawn_count: self.supervisor.spawn_count(),
            },
            link: LinkView {
                reachable: health.reachable,
                consecutive_failures: health.consecutive_failures,
                last_success_age_ms: health
                    .last_success_at
                    .map(|at| Instant::now().duration_since(at).as_millis() as u64),
                stream: match self.channel.stream_state() {
                    StreamState::Active => "active",
                    StreamState::Paused => "paused",
                },
                queries: link.queries,
                timeouts: link.timeouts,
                malformed_responses: link.malformed_responses,
            },
            telemetry: self.telemetry.telemetry().map(|t| (*t).clone()),
            cadence: self.cadence_stats(),
            program: self.runner.current(),
        }
    }

    /// Stop everything. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("commander shutting down");

        if let Some(reconnect) = self.reconnect.lock().take() {
            drop(reconnect.stop);
            if reconnect.handle.join().is_err() {
                warn!("reconnect thread panicked");
            }
        }
        if let Some(mut cadence) = self.cadence.lock().take() {
            cadence.stop();
        }
        if let Some(mut poller) = self.poller.lock().take() {
            poller.stop();
        }
        self.runner.shutdown();
        if let Err(e) = self.supervisor.shutdown() {
            warn!(error = %e, "controller shutdown failed");
        }
        info!("commander stopped");
    }

    fn require_ready(&self) -> Result<(), ControlError> {
        let state = self.supervisor.state();
        if state != SupervisorState::Ready {
            return Err(ControlError::NotReady(state.name().to_string()));
        }
        Ok(())
    }

    fn require_stream(&self) -> Result<(), ControlError> {
        if self.channel.stream_state() == StreamState::Paused {
            return Err(DriverError::NotOwner {
                holder: Holder::Program,
            }
            .into());
        }
        Ok(())
    }

    fn send_now(&self, command: &Command) -> Result<(), ControlError> {
        self.require_ready()?;
        self.require_stream()?;
        self.channel.send(Owner::Stream, command)?;
        debug!(tag = command.tag(), "one-shot command sent");
        Ok(())
    }
}

impl Drop for Commander {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_reconnector(
    config: &CommanderConfig,
    supervisor: &Arc<ControllerSupervisor>,
    channel: &CommandChannel,
) -> Result<Reconnector, ControlError> {
    let (stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
    let interval = config.reconnect_interval();
    let supervisor = supervisor.clone();
    let channel = channel.clone();
    let handle = thread::Builder::new()
        .name("parol-reconnect".into())
        .spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {},
                    _ => break,
                }
                // ensure() probes the link; never while a program owns it.
                if supervisor.state() == SupervisorState::Ready
                    || channel.stream_state() == StreamState::Paused
                {
                    continue;
                }
                match supervisor.ensure() {
                    Ok(SupervisorState::Ready) => info!("controller reconnected"),
                    Ok(state) => debug!(state = state.name(), "controller still not ready"),
                    Err(DriverError::ShuttingDown) => break,
                    Err(e) => warn!(error = %e, "controller ensure failed"),
                }
            }
        })?;
    Ok(Reconnector { stop, handle })
}
