//! Program Runner - one user script at a time
//!
//! A run owns the Command Channel from spawn to exit: the status poller and
//! the cadence driver are paused for its whole lifetime.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Starting -> Running -> Stopped
//!                        |          ^
//!                        +-> Stopping (SIGTERM, grace, SIGKILL)
//! Starting -> Failed   (spawn error)
//! ```
//!
//! Each run gets a monitor thread that owns the child and the program lease,
//! plus one reader thread per output stream. Once the script exits, whatever
//! is left of its process group is killed before the lease is released.

use crate::error::ControlError;
use crate::output::{OUTPUT_CAPACITY, OutputHub, OutputLine, OutputSource, OutputStream};
use parking_lot::{Condvar, Mutex};
use parol_driver::process::{self, EXIT_POLL_INTERVAL, Termination};
use parol_driver::{CommandChannel, ProgramLease};
use parol_protocol::Command;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long output readers may lag behind the program's exit.
const READER_DRAIN: Duration = Duration::from_secs(1);
const READER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Program run identifier, unique per runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Program run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ProgramState {
    #[default]
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Failed = 5,
}

impl ProgramState {
    /// Invalid values map to `Idle`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            5 => Self::Failed,
            _ => Self::Idle,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Holds (or is about to hold) the Command Channel.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Program Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Working directory of runs; relative script paths resolve here.
    pub programs_dir: PathBuf,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    /// Extra environment for the interpreter.
    pub env: Vec<(String, String)>,
    /// Wait between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
    /// Queue depth per output subscriber.
    pub output_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            programs_dir: PathBuf::from("./programs"),
            interpreter: "python3".to_string(),
            interpreter_args: vec!["-u".to_string()],
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
            stop_grace: Duration::from_secs(2),
            output_capacity: OUTPUT_CAPACITY,
        }
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramRunSnapshot {
    pub id: RunId,
    pub script: PathBuf,
    pub state: ProgramState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Killed after ignoring SIGTERM.
    pub forced: bool,
    pub stop_requested: bool,
    pub elapsed_ms: u64,
    pub output_lines: usize,
}

#[derive(Debug, Default)]
struct RunControl {
    stop_requested: bool,
    exit: Option<RunExit>,
}

#[derive(Debug, Clone, Copy)]
struct RunExit {
    code: Option<i32>,
    forced: bool,
    at: Instant,
}

struct Run {
    id: RunId,
    script: PathBuf,
    started_at: Instant,
    state: AtomicU8,
    pid: AtomicU32,
    output: OutputHub,
    control: Mutex<RunControl>,
    changed: Condvar,
}

impl Run {
    fn state(&self) -> ProgramState {
        ProgramState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ProgramState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn snapshot(&self) -> ProgramRunSnapshot {
        let control = self.control.lock();
        let pid = match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        };
        let end = control.exit.map_or_else(Instant::now, |exit| exit.at);
        ProgramRunSnapshot {
            id: self.id,
            script: self.script.clone(),
            state: self.state(),
            pid,
            exit_code: control.exit.and_then(|exit| exit.code),
            forced: control.exit.is_some_and(|exit| exit.forced),
            stop_requested: control.stop_requested,
            elapsed_ms: end.duration_since(self.started_at).as_millis() as u64,
            output_lines: self.output.lines().len(),
        }
    }

    /// Block until the run finished or `timeout` elapsed.
    fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut control = self.control.lock();
        while control.exit.is_none() && !self.state().is_finished() {
            if self.changed.wait_until(&mut control, deadline).timed_out() {
                break;
            }
        }
        control.exit.is_some() || self.state().is_finished()
    }
}

/// Program Runner
pub struct ProgramRunner {
    config: RunnerConfig,
    channel: CommandChannel,
    current: Mutex<Option<Arc<Run>>>,
    next_id: AtomicU64,
}

impl ProgramRunner {
    /// Create the runner, creating the programs directory if absent.
    pub fn new(config: RunnerConfig, channel: CommandChannel) -> Result<Self, ControlError> {
        fs::create_dir_all(&config.programs_dir)?;
        Ok(Self {
            config,
            channel,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Start `script` (relative paths resolve against the programs directory).
    ///
    /// Rejected without side effects when a run is active or the script is
    /// missing. On success the stream loops are paused until the run ends.
    pub fn start(&self, script: impl AsRef<Path>) -> Result<RunId, ControlError> {
        let mut current = self.current.lock();
        if let Some(run) = current.as_ref().filter(|run| run.state().is_active()) {
            return Err(ControlError::AlreadyRunning(run.id));
        }

        let path = self.resolve(script.as_ref());
        let readable = fs::metadata(&path).is_ok_and(|m| m.is_file())
            && fs::File::open(&path).is_ok();
        if !readable {
            return Err(ControlError::NotFound(path));
        }
        // The child runs inside the programs directory.
        let path = fs::canonicalize(&path).map_err(|_| ControlError::NotFound(path))?;

        let lease = self.channel.claim_program()?;
        let id = RunId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let run = Arc::new(Run {
            id,
            script: path.clone(),
            started_at: Instant::now(),
            state: AtomicU8::new(ProgramState::Starting.as_u8()),
            pid: AtomicU32::new(0),
            output: OutputHub::new(self.config.output_capacity),
            control: Mutex::new(RunControl::default()),
            changed: Condvar::new(),
        });
        *current = Some(run.clone());

        let mut command = std::process::Command::new(&self.config.interpreter);
        command
            .args(&self.config.interpreter_args)
            .arg(&path)
            .current_dir(&self.config.programs_dir)
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        process::isolate_process_group(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("{}: {e}", self.config.interpreter);
                error!(run = %id, script = %path.display(), error = %reason, "failed to start program");
                fail_run(&run, &reason);
                drop(lease);
                return Err(ControlError::SpawnFailed(reason));
            },
        };

        let pid = child.id();
        run.pid.store(pid, Ordering::Release);
        let readers = spawn_readers(&mut child, &run);
        run.set_state(ProgramState::Running);
        info!(run = %id, pid, script = %path.display(), "program started");

        let monitor_run = run.clone();
        let grace = self.config.stop_grace;
        let spawned = thread::Builder::new()
            .name(format!("parol-program-{id}"))
            .spawn(move || monitor(monitor_run, child, lease, readers, grace));
        if let Err(e) = spawned {
            // The closure (child and lease) was dropped with the error.
            let reason = format!("monitor thread: {e}");
            fail_run(&run, &reason);
            return Err(ControlError::SpawnFailed(reason));
        }
        Ok(id)
    }

    /// Stop the run: SIGTERM to its group, grace period, then SIGKILL.
    ///
    /// Blocks until the run has ended. Stopping a finished run is a no-op.
    pub fn stop(&self, id: RunId) -> Result<ProgramRunSnapshot, ControlError> {
        let run = self.find(id)?;
        {
            let mut control = run.control.lock();
            if !run.state().is_finished() && !control.stop_requested {
                control.stop_requested = true;
                if run.state() == ProgramState::Running {
                    run.set_state(ProgramState::Stopping);
                }
                info!(run = %id, "stopping program");
                run.changed.notify_all();
            }
        }
        let limit = self.config.stop_grace + Duration::from_secs(2);
        if !run.wait_finished(limit) {
            warn!(run = %id, "program did not finish after stop");
        }
        Ok(run.snapshot())
    }

    /// Output of run `id`: backlog replay, then live lines until the run ends.
    pub fn subscribe(&self, id: RunId) -> Result<OutputStream, ControlError> {
        Ok(self.find(id)?.output.subscribe())
    }

    /// Full captured output of run `id`.
    pub fn output(&self, id: RunId) -> Result<Vec<OutputLine>, ControlError> {
        Ok(self.find(id)?.output.lines())
    }

    /// Latest run, active or finished.
    pub fn current(&self) -> Option<ProgramRunSnapshot> {
        self.current.lock().as_ref().map(|run| run.snapshot())
    }

    pub fn is_active(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|run| run.state().is_active())
    }

    /// Wait up to `timeout` for run `id` to finish.
    pub fn wait(&self, id: RunId, timeout: Duration) -> Result<ProgramRunSnapshot, ControlError> {
        let run = self.find(id)?;
        run.wait_finished(timeout);
        Ok(run.snapshot())
    }

    /// Stop the active run, if any.
    pub fn shutdown(&self) {
        let active = self
            .current
            .lock()
            .as_ref()
            .filter(|run| run.state().is_active())
            .map(|run| run.id);
        if let Some(id) = active
            && let Err(e) = self.stop(id)
        {
            warn!(run = %id, error = %e, "failed to stop program on shutdown");
        }
    }

    fn find(&self, id: RunId) -> Result<Arc<Run>, ControlError> {
        self.current
            .lock()
            .as_ref()
            .filter(|run| run.id == id)
            .cloned()
            .ok_or(ControlError::UnknownRun(id))
    }

    fn resolve(&self, script: &Path) -> PathBuf {
        if script.is_absolute() {
            script.to_path_buf()
        } else {
            self.config.programs_dir.join(script)
        }
    }
}

impl Drop for ProgramRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fail_run(run: &Run, reason: &str) {
    run.output.push(OutputLine::stderr(format!("failed to start: {reason}")));
    finish(run, ProgramState::Failed, None, false);
}

fn finish(run: &Run, state: ProgramState, code: Option<i32>, forced: bool) {
    let mut control = run.control.lock();
    control.exit = Some(RunExit {
        code,
        forced,
        at: Instant::now(),
    });
    run.set_state(state);
    run.output.close();
    run.changed.notify_all();
}

fn spawn_readers(child: &mut Child, run: &Arc<Run>) -> Vec<JoinHandle<()>> {
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.extend(spawn_reader(stdout, run.clone(), OutputSource::Stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.extend(spawn_reader(stderr, run.clone(), OutputSource::Stderr));
    }
    readers
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    run: Arc<Run>,
    source: OutputSource,
) -> Option<JoinHandle<()>> {
    let suffix = match source {
        OutputSource::Stdout => "out",
        OutputSource::Stderr => "err",
    };
    let run_id = run.id;
    let spawned = thread::Builder::new()
        .name(format!("parol-program-{run_id}-{suffix}"))
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf);
                        let text = text.trim_end();
                        if !text.is_empty() {
                            run.output.push(OutputLine {
                                source,
                                text: text.to_string(),
                            });
                        }
                    },
                    Err(e) => {
                        debug!(run = %run.id, error = %e, "output reader stopped");
                        break;
                    },
                }
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(run = %run_id, error = %e, "failed to spawn output reader");
            None
        },
    }
}

/// Wait for the reader threads until `timeout`; stragglers are left detached.
fn join_readers(run: &Run, readers: Vec<JoinHandle<()>>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let mut pending = readers;
    while !pending.is_empty() && Instant::now() < deadline {
        let (done, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|r| r.is_finished());
        for reader in done {
            if reader.join().is_err() {
                warn!(run = %run.id, "output reader panicked");
            }
        }
        pending = rest;
        if !pending.is_empty() {
            thread::sleep(READER_POLL_INTERVAL);
        }
    }
    if !pending.is_empty() {
        warn!(
            run = %run.id,
            readers = pending.len(),
            "output still open after program exit, detaching readers"
        );
    }
}

fn monitor(
    run: Arc<Run>,
    mut child: Child,
    lease: ProgramLease,
    readers: Vec<JoinHandle<()>>,
    grace: Duration,
) {
    let pid = child.id();
    let outcome = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(Termination::AlreadyExited(status)),
            Ok(None) => {},
            Err(e) => break Err(e),
        }
        let mut control = run.control.lock();
        if control.stop_requested {
            drop(control);
            break process::terminate(&mut child, grace);
        }
        run.changed.wait_for(&mut control, EXIT_POLL_INTERVAL);
    };

    // Background children may still hold the output pipes.
    if process::kill_group(pid) {
        debug!(run = %run.id, pid, "killed leftover processes in program group");
    }
    join_readers(&run, readers, READER_DRAIN);

    let stop_requested = run.control.lock().stop_requested;
    if stop_requested && let Err(e) = lease.send(&Command::Stop) {
        warn!(run = %run.id, error = %e, "failed to send STOP after program stop");
    }
    drop(lease);

    match outcome {
        Ok(termination) => {
            let status = termination.status();
            let forced = termination.was_forced();
            if forced {
                warn!(run = %run.id, pid, "program killed after ignoring SIGTERM");
            }
            info!(run = %run.id, pid, ?status, "program finished");
            finish(&run, ProgramState::Stopped, status.code(), forced);
        },
        Err(e) => {
            error!(run = %run.id, pid, error = %e, "lost track of program process");
            run.output.push(OutputLine::stderr(format!("wait failed: {e}")));
            finish(&run, ProgramState::Failed, None, false);
        },
    }
}
