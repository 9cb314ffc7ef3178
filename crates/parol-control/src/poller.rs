//! Status Poller - periodic telemetry queries
//!
//! Issues `GET_STATUS` on a dedicated thread and republishes the result.
//!
//! # Behaviour
//!
//! - Period `period` while reachable, `offline_period` after a failure.
//! - Each outcome updates [`HealthStatus`] and feeds the supervisor's
//!   probe counter; failures never escape the loop.
//! - While a program holds the Command Channel the loop blocks on the
//!   ownership token and issues no query at all. On hand-back it polls
//!   immediately.
//! - No query is sent before the controller has been Ready.
//!
//! Observers read the latest event wait-free or subscribe to a bounded
//! channel; a full subscriber misses events instead of stalling the loop.

use crate::error::ControlError;
use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use parol_driver::{CommandChannel, ControllerStatus, DriverError, Owner, StreamState};
use parol_protocol::{Query, Response, Telemetry};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on any single wait, so shutdown is observed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Status Poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub period: Duration,
    /// Period while the controller is not answering.
    pub offline_period: Duration,
    /// Queue depth per subscriber.
    pub subscriber_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(200),
            offline_period: Duration::from_secs(1),
            subscriber_capacity: 64,
        }
    }
}

impl PollerConfig {
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.period.is_zero() || self.offline_period.is_zero() {
            return Err(ControlError::InvalidConfig(
                "status poll periods must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Link health as seen by the poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthStatus {
    pub reachable: bool,
    pub last_success_at: Option<Instant>,
    pub consecutive_failures: u32,
}

/// Published poll outcome.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    Snapshot {
        telemetry: Arc<Telemetry>,
        received_at: Instant,
    },
    /// Placeholder published when a poll fails.
    Unreachable {
        consecutive_failures: u32,
        error: String,
    },
}

struct Shared {
    config: PollerConfig,
    channel: CommandChannel,
    status: ControllerStatus,
    latest: ArcSwapOption<TelemetryEvent>,
    health: ArcSwap<HealthStatus>,
    subscribers: Mutex<Vec<Sender<TelemetryEvent>>>,
    queries: AtomicU64,
    is_running: AtomicBool,
}

/// Read side of the poller (cheap to clone).
#[derive(Clone)]
pub struct TelemetryObserver {
    shared: Arc<Shared>,
}

impl TelemetryObserver {
    pub fn latest(&self) -> Option<Arc<TelemetryEvent>> {
        self.shared.latest.load_full()
    }

    /// Latest successful telemetry, if the last poll succeeded.
    pub fn telemetry(&self) -> Option<Arc<Telemetry>> {
        match self.latest().as_deref() {
            Some(TelemetryEvent::Snapshot { telemetry, .. }) => Some(telemetry.clone()),
            _ => None,
        }
    }

    pub fn health(&self) -> HealthStatus {
        **self.shared.health.load()
    }

    /// Status queries that reached the transport.
    pub fn queries_issued(&self) -> u64 {
        self.shared.queries.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> Receiver<TelemetryEvent> {
        let (tx, rx) = crossbeam_channel::bounded(self.shared.config.subscriber_capacity.max(1));
        self.shared.subscribers.lock().push(tx);
        rx
    }
}

/// Status Poller handle. Stops and joins its thread on drop.
pub struct StatusPoller {
    observer: TelemetryObserver,
    handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    pub fn start(
        config: PollerConfig,
        channel: CommandChannel,
        status: ControllerStatus,
    ) -> Result<Self, ControlError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            config,
            channel,
            status,
            latest: ArcSwapOption::empty(),
            health: ArcSwap::from_pointee(HealthStatus::default()),
            subscribers: Mutex::new(Vec::new()),
            queries: AtomicU64::new(0),
            is_running: AtomicBool::new(true),
        });
        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("parol-status".into())
            .spawn(move || poll_loop(&loop_shared))?;
        info!("status poller started");
        Ok(Self {
            observer: TelemetryObserver { shared },
            handle: Some(handle),
        })
    }

    pub fn observer(&self) -> TelemetryObserver {
        self.observer.clone()
    }

    pub fn subscribe(&self) -> Receiver<TelemetryEvent> {
        self.observer.subscribe()
    }

    pub fn health(&self) -> HealthStatus {
        self.observer.health()
    }

    pub fn stop(&mut self) {
        self.observer
            .shared
            .is_running
            .store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("status poller thread panicked");
            }
            info!("status poller stopped");
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(shared: &Shared) {
    let ownership = shared.channel.ownership();
    let running = || shared.is_running.load(Ordering::Acquire);
    let mut seen_generation = ownership.generation();
    let mut next_poll = Instant::now();

    while running() {
        // A hand-over since the last pass (possibly a whole short run) means
        // the stream was resumed: poll right away.
        let generation = ownership.generation();
        if generation != seen_generation {
            seen_generation = generation;
            next_poll = Instant::now();
        }

        if shared.channel.stream_state() == StreamState::Paused {
            debug!("status polling paused");
            while running() && ownership.wait_while_paused(WAIT_SLICE) == StreamState::Paused {}
            debug!("status polling resumed");
            continue;
        }

        if !shared.status.admits_traffic() {
            thread::sleep(WAIT_SLICE);
            continue;
        }

        let now = Instant::now();
        if now < next_poll {
            ownership.wait_for_change(seen_generation, (next_poll - now).min(WAIT_SLICE));
            continue;
        }

        let reachable = poll_once(shared);
        let period = if reachable {
            shared.config.period
        } else {
            shared.config.offline_period
        };
        next_poll = Instant::now() + period;
    }
}

/// One query. Returns whether the controller answered.
fn poll_once(shared: &Shared) -> bool {
    let result = shared.channel.query(Owner::Stream, Query::Status);
    if matches!(result, Err(DriverError::NotOwner { .. })) {
        // Program claimed the link between the pause check and the query.
        return shared.health.load().reachable;
    }
    shared.queries.fetch_add(1, Ordering::Relaxed);

    let previous = **shared.health.load();
    match result {
        Ok(Response::Status(telemetry)) => {
            let now = Instant::now();
            if !previous.reachable && previous.consecutive_failures > 0 {
                info!(
                    after_failures = previous.consecutive_failures,
                    "status polling recovered"
                );
            }
            shared.health.store(Arc::new(HealthStatus {
                reachable: true,
                last_success_at: Some(now),
                consecutive_failures: 0,
            }));
            shared.status.record_probe(true);
            publish(
                shared,
                TelemetryEvent::Snapshot {
                    telemetry: Arc::new(telemetry),
                    received_at: now,
                },
            );
            true
        },
        other => {
            let error = match other {
                Err(e) => e.to_string(),
                Ok(response) => format!("unexpected {} reply", response.tag()),
            };
            let failures = previous.consecutive_failures + 1;
            if failures == 1 {
                warn!(%error, "status poll failed");
            } else {
                debug!(%error, failures, "status poll failed");
            }
            shared.health.store(Arc::new(HealthStatus {
                reachable: false,
                last_success_at: previous.last_success_at,
                consecutive_failures: failures,
            }));
            shared.status.record_probe(false);
            publish(
                shared,
                TelemetryEvent::Unreachable {
                    consecutive_failures: failures,
                    error,
                },
            );
            false
        },
    }
}

fn publish(shared: &Shared, event: TelemetryEvent) {
    shared.subscribers.lock().retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) | Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Disconnected(_)) => false,
    });
    shared.latest.store(Some(Arc::new(event)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use parol_driver::mock::{MockController, mock_channel};
    use parol_driver::{ChannelConfig, ControllerSupervisor, SupervisorConfig, SupervisorState};

    fn fast_channel() -> (CommandChannel, MockController) {
        mock_channel(ChannelConfig {
            query_timeout: Duration::from_millis(20),
            retries: 0,
        })
    }

    fn ready(channel: &CommandChannel) -> ControllerSupervisor {
        let supervisor = ControllerSupervisor::new(SupervisorConfig::default(), channel.clone());
        assert_eq!(supervisor.ensure().unwrap(), SupervisorState::Ready);
        supervisor
    }

    fn fast_config() -> PollerConfig {
        PollerConfig {
            period: Duration::from_millis(40),
            offline_period: Duration::from_millis(80),
            subscriber_capacity: 16,
        }
    }

    fn status_queries(controller: &MockController) -> Vec<parol_driver::mock::SentRecord> {
        controller.sent_with_tag("GET_STATUS")
    }

    #[test]
    fn test_publishes_telemetry() {
        let (channel, controller) = fast_channel();
        controller.set_telemetry(Telemetry {
            joint_angles: Some([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            ..Telemetry::default()
        });
        let supervisor = ready(&channel);
        let mut poller = StatusPoller::start(fast_config(), channel, supervisor.status()).unwrap();
        let rx = poller.subscribe();

        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        match event {
            TelemetryEvent::Snapshot { telemetry, .. } => {
                assert_eq!(telemetry.joint_angles.unwrap()[5], 6.0)
            },
            other => panic!("unexpected {other:?}"),
        }
        let health = poller.health();
        assert!(health.reachable && health.last_success_at.is_some());
        assert!(poller.observer().telemetry().is_some());
        poller.stop();
    }

    #[test]
    fn test_failures_degrade_health_and_supervisor() {
        let (channel, controller) = fast_channel();
        let supervisor = ready(&channel);
        let mut poller =
            StatusPoller::start(fast_config(), channel, supervisor.status()).unwrap();
        thread::sleep(Duration::from_millis(100));
        controller.set_online(false);
        thread::sleep(Duration::from_millis(500));

        let health = poller.health();
        assert!(!health.reachable);
        assert!(health.consecutive_failures >= 3, "{health:?}");
        assert_eq!(supervisor.state(), SupervisorState::Unreachable);
        assert!(matches!(
            poller.observer().latest().as_deref(),
            Some(TelemetryEvent::Unreachable { .. })
        ));

        controller.set_online(true);
        thread::sleep(Duration::from_millis(300));
        assert!(poller.health().reachable);
        assert_eq!(supervisor.state(), SupervisorState::Ready);
        poller.stop();
    }

    #[test]
    fn test_offline_period_backs_off() {
        let (channel, controller) = fast_channel();
        let supervisor = ready(&channel);
        controller.set_online(false);
        supervisor.status().record_probe(false);
        let mut poller = StatusPoller::start(fast_config(), channel, supervisor.status()).unwrap();
        thread::sleep(Duration::from_millis(450));
        poller.stop();
        // 20ms timeout + 80ms backoff per cycle: at most ~5 queries
        let n = status_queries(&controller).len();
        assert!((3..=6).contains(&n), "queries: {n}");
    }

    #[test]
    fn test_no_queries_before_ready() {
        let (channel, controller) = fast_channel();
        let status = ControllerStatus::new(3);
        let mut poller = StatusPoller::start(fast_config(), channel, status).unwrap();
        thread::sleep(Duration::from_millis(200));
        poller.stop();
        assert!(controller.sent().is_empty());
        assert_eq!(poller.observer().queries_issued(), 0);
    }

    #[test]
    fn test_pause_blocks_queries_and_resume_is_immediate() {
        let (channel, controller) = fast_channel();
        let supervisor = ready(&channel);
        let config = PollerConfig {
            period: Duration::from_millis(500),
            ..fast_config()
        };
        let mut poller = StatusPoller::start(config, channel.clone(), supervisor.status()).unwrap();
        thread::sleep(Duration::from_millis(50));

        let lease = channel.claim_program().unwrap();
        let paused_at = Instant::now();
        thread::sleep(Duration::from_millis(300));
        let released_at = Instant::now();
        drop(lease);
        thread::sleep(Duration::from_millis(100));
        poller.stop();

        let queries = status_queries(&controller);
        assert!(
            queries
                .iter()
                .all(|r| r.at < paused_at || r.at >= released_at),
            "status query issued while paused"
        );
        assert!(queries.iter().all(|r| r.holder == Some(parol_driver::Holder::Stream)));
        let resumed = queries.iter().find(|r| r.at >= released_at).map(|r| r.at);
        let resumed = resumed.expect("no poll after resume");
        // period is 500ms: only an immediate resume poll lands this early
        assert!(resumed.duration_since(released_at) < Duration::from_millis(80));
    }

    #[test]
    fn test_full_subscriber_does_not_block() {
        let (channel, _controller) = fast_channel();
        let supervisor = ready(&channel);
        let config = PollerConfig {
            period: Duration::from_millis(10),
            subscriber_capacity: 1,
            ..fast_config()
        };
        let mut poller = StatusPoller::start(config, channel, supervisor.status()).unwrap();
        let _slow = poller.subscribe();
        thread::sleep(Duration::from_millis(150));
        assert!(poller.observer().queries_issued() >= 5);
        poller.stop();
    }
}
