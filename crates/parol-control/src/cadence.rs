//! Cadence Driver - fixed-rate jog command stream
//!
//! Converts the latest operator intent into at most one command per tick.
//!
//! # Timing
//!
//! - Ticks are anchored at `start + n * period` and slept to with
//!   `spin_sleep`, so lateness never accumulates.
//! - A tick later than `drift_tolerance * period` logs a drift warning.
//! - Ticks missed during a stall are skipped; the loop resumes at the next
//!   future anchor and never sends a catch-up burst.
//! - Every `cadence_window` ticks the mean tick interval is checked against
//!   the period.
//!
//! # Intent handling
//!
//! An intent is fresh at a tick when it was submitted after the previous
//! tick and is at most one period (plus the drift tolerance) old. Fresh,
//! non-idle intent produces one jog command. When intent goes stale or idle
//! while jogging, exactly one `STOP` is sent and the driver idles until a
//! newer intent arrives.
//!
//! Nothing is sent unless the controller is Ready and the stream holds the
//! Command Channel.

use crate::error::ControlError;
use crate::intent::{IntentSlot, JogIntent};
use arc_swap::ArcSwapOption;
use parol_driver::{CommandChannel, ControllerStatus, DriverError, Owner, StreamState};
use parol_protocol::Command;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Cadence Driver configuration.
#[derive(Debug, Clone)]
pub struct CadenceConfig {
    /// Command rate (Hz).
    pub control_rate_hz: f64,
    /// Allowed lateness as a fraction of the period.
    pub drift_tolerance: f64,
    /// Duration carried by each jog command (controller watchdog).
    pub jog_duration: Duration,
    /// Ticks per mean-interval check.
    pub cadence_window: u32,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            control_rate_hz: 50.0,
            drift_tolerance: 0.2,
            jog_duration: Duration::from_millis(100),
            cadence_window: 100,
        }
    }
}

impl CadenceConfig {
    pub fn validate(&self) -> Result<(), ControlError> {
        if !(self.control_rate_hz.is_finite() && self.control_rate_hz > 0.0) {
            return Err(ControlError::InvalidConfig(format!(
                "control_rate_hz must be > 0, got {}",
                self.control_rate_hz
            )));
        }
        if self.control_rate_hz > 1000.0 {
            warn!(
                "Very high cadence: {} Hz. The controller may drop commands.",
                self.control_rate_hz
            );
        }
        if !(self.drift_tolerance.is_finite() && self.drift_tolerance > 0.0) {
            return Err(ControlError::InvalidConfig(format!(
                "drift_tolerance must be > 0, got {}",
                self.drift_tolerance
            )));
        }
        if self.jog_duration.is_zero() {
            return Err(ControlError::InvalidConfig(
                "jog_duration must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.control_rate_hz)
    }
}

/// One loop iteration.
#[derive(Debug, Clone, Copy)]
pub struct CadenceTick {
    pub sequence: u64,
    pub scheduled_at: Instant,
    pub actual_at: Instant,
}

impl CadenceTick {
    pub fn drift(&self) -> Duration {
        self.actual_at.saturating_duration_since(self.scheduled_at)
    }
}

#[derive(Debug, Default)]
struct CadenceCounters {
    ticks: AtomicU64,
    late_ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    jog_commands: AtomicU64,
    stop_commands: AtomicU64,
    send_errors: AtomicU64,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CadenceStats {
    pub ticks: u64,
    pub late_ticks: u64,
    pub skipped_ticks: u64,
    pub jog_commands: u64,
    pub stop_commands: u64,
    pub send_errors: u64,
}

struct Shared {
    config: CadenceConfig,
    intents: Arc<IntentSlot>,
    channel: CommandChannel,
    status: ControllerStatus,
    counters: CadenceCounters,
    last_tick: ArcSwapOption<CadenceTick>,
    is_running: AtomicBool,
}

/// Per-loop mutable state.
struct LoopState {
    jogging: bool,
    /// Intent sequence observed at the previous tick.
    seen_sequence: u64,
    window_start: Instant,
    window_ticks: u32,
}

/// Cadence Driver handle. Stops and joins its thread on drop.
pub struct CadenceDriver {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl CadenceDriver {
    /// Start the loop thread.
    pub fn start(
        config: CadenceConfig,
        intents: Arc<IntentSlot>,
        channel: CommandChannel,
        status: ControllerStatus,
    ) -> Result<Self, ControlError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            config,
            intents,
            channel,
            status,
            counters: CadenceCounters::default(),
            last_tick: ArcSwapOption::empty(),
            is_running: AtomicBool::new(true),
        });
        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("parol-cadence".into())
            .spawn(move || cadence_loop(&loop_shared))?;
        info!(
            rate_hz = shared.config.control_rate_hz,
            "cadence driver started"
        );
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn intents(&self) -> &Arc<IntentSlot> {
        &self.shared.intents
    }

    /// Replace the latest intent.
    pub fn submit(&self, intent: JogIntent) -> u64 {
        self.shared.intents.submit(intent)
    }

    pub fn stats(&self) -> CadenceStats {
        let c = &self.shared.counters;
        CadenceStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            late_ticks: c.late_ticks.load(Ordering::Relaxed),
            skipped_ticks: c.skipped_ticks.load(Ordering::Relaxed),
            jog_commands: c.jog_commands.load(Ordering::Relaxed),
            stop_commands: c.stop_commands.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
        }
    }

    pub fn last_tick(&self) -> Option<CadenceTick> {
        self.shared.last_tick.load().as_deref().copied()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running.load(Ordering::Acquire)
    }

    /// Stop the loop, sending a final STOP if it was jogging.
    pub fn stop(&mut self) {
        self.shared.is_running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("cadence thread panicked");
            }
            info!("cadence driver stopped");
        }
    }
}

impl Drop for CadenceDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn cadence_loop(shared: &Shared) {
    #[cfg(feature = "realtime")]
    {
        use thread_priority::*;

        match set_current_thread_priority(ThreadPriority::Max) {
            Ok(_) => info!("cadence thread priority set to MAX (realtime)"),
            Err(e) => warn!(
                "Failed to set cadence thread priority: {:?}. \
                On Linux, you may need CAP_SYS_NICE or rtkit.",
                e
            ),
        }
    }

    let period = shared.config.period();
    let tolerance = period.mul_f64(shared.config.drift_tolerance);
    let start = Instant::now();
    let mut next_tick = start + period;
    let mut sequence = 0u64;
    let mut state = LoopState {
        jogging: false,
        seen_sequence: 0,
        window_start: start,
        window_ticks: 0,
    };

    while shared.is_running.load(Ordering::Acquire) {
        let now = Instant::now();
        if next_tick > now {
            spin_sleep::sleep(next_tick - now);
        }
        if !shared.is_running.load(Ordering::Acquire) {
            break;
        }

        let tick = CadenceTick {
            sequence,
            scheduled_at: next_tick,
            actual_at: Instant::now(),
        };
        let drift = tick.drift();
        if drift > tolerance {
            shared.counters.late_ticks.fetch_add(1, Ordering::Relaxed);
            warn!(
                seq = tick.sequence,
                drift_ms = drift.as_secs_f64() * 1e3,
                period_ms = period.as_secs_f64() * 1e3,
                "cadence drift"
            );
        }

        run_tick(shared, &tick, period, &mut state);
        shared.counters.ticks.fetch_add(1, Ordering::Relaxed);
        shared.last_tick.store(Some(Arc::new(tick)));
        check_window(shared, &mut state, period, tick.actual_at);

        sequence += 1;
        next_tick += period;
        let after = Instant::now();
        if next_tick <= after {
            // Resume at the next future anchor; no catch-up burst.
            let behind = after.duration_since(next_tick);
            let missed = (behind.as_nanos() / period.as_nanos().max(1)) as u32 + 1;
            next_tick += period * missed;
            shared
                .counters
                .skipped_ticks
                .fetch_add(missed as u64, Ordering::Relaxed);
            debug!(missed, "skipping missed cadence ticks");
        }
    }

    // Final stop for an operator still holding a jog.
    if state.jogging && gate_open(shared) {
        send(shared, &Command::Stop, &mut state);
    }
}

fn gate_open(shared: &Shared) -> bool {
    shared.status.is_ready() && shared.channel.stream_state() == StreamState::Active
}

fn freshness_window(period: Duration, drift_tolerance: f64) -> Duration {
    period + period.mul_f64(drift_tolerance)
}

fn is_fresh(intent: &JogIntent, previous_seen: u64, now: Instant, max_age: Duration) -> bool {
    intent.sequence > previous_seen
        && now.saturating_duration_since(intent.timestamp) <= max_age
        && !intent.is_idle()
}

fn run_tick(shared: &Shared, tick: &CadenceTick, period: Duration, state: &mut LoopState) {
    let intent = shared.intents.latest();
    let previous_seen = state.seen_sequence;
    if let Some(intent) = &intent {
        state.seen_sequence = intent.sequence;
    }

    if !gate_open(shared) {
        if state.jogging {
            debug!("cadence gate closed while jogging, going idle");
            state.jogging = false;
        }
        return;
    }

    let max_age = freshness_window(period, shared.config.drift_tolerance);
    let fresh = intent.filter(|i| is_fresh(i, previous_seen, tick.actual_at, max_age));

    match fresh.and_then(|i| i.to_command(shared.config.jog_duration)) {
        Some(command) => {
            trace!(seq = tick.sequence, tag = command.tag(), "jog");
            if send(shared, &command, state) {
                shared.counters.jog_commands.fetch_add(1, Ordering::Relaxed);
                state.jogging = true;
            }
        },
        None if state.jogging => {
            debug!(seq = tick.sequence, "jog intent stale or released, stopping");
            if send(shared, &Command::Stop, state) {
                shared.counters.stop_commands.fetch_add(1, Ordering::Relaxed);
            }
            state.jogging = false;
        },
        None => {},
    }
}

/// Returns whether the command reached the transport.
fn send(shared: &Shared, command: &Command, state: &mut LoopState) -> bool {
    match shared.channel.send(Owner::Stream, command) {
        Ok(()) => true,
        Err(DriverError::NotOwner { holder }) => {
            debug!(?holder, "link taken by program, cadence idles");
            state.jogging = false;
            false
        },
        Err(e) => {
            shared.counters.send_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, tag = command.tag(), "cadence send failed");
            false
        },
    }
}

fn check_window(shared: &Shared, state: &mut LoopState, period: Duration, now: Instant) {
    state.window_ticks += 1;
    let window = shared.config.cadence_window.max(1);
    if state.window_ticks < window {
        return;
    }
    let mean = now.duration_since(state.window_start) / state.window_ticks;
    let deviation = (mean.as_secs_f64() - period.as_secs_f64()).abs() / period.as_secs_f64();
    if deviation > shared.config.drift_tolerance {
        warn!(
            mean_ms = mean.as_secs_f64() * 1e3,
            target_ms = period.as_secs_f64() * 1e3,
            window,
            "cadence off target"
        );
    }
    state.window_start = now;
    state.window_ticks = 0;
}
