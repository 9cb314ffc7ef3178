//! Command Channel
//!
//! Single logical connection to the controller endpoint.
//!
//! # Guarantees
//!
//! - Every socket operation happens under one link mutex.
//! - The ownership holder is checked under that mutex; a non-holder gets
//!   [`DriverError::NotOwner`] and nothing reaches the transport.
//! - Requests (queries, probes) and program claims are serialized by a
//!   separate exchange lock. The link mutex is only held in short receive
//!   slices while a reply is awaited, so `send` never waits for a reply.
//! - `query` blocks for at most `query_timeout * (retries + 1)`.
//! - Malformed replies are counted, logged and skipped; they never end a
//!   query early.

use crate::error::DriverError;
use crate::health::LinkHealth;
use crate::ownership::{Holder, LinkOwnership, StreamState};
use crate::transport::Transport;
use parking_lot::{Mutex, MutexGuard};
use parol_protocol::{Command, MAX_DATAGRAM, ProtocolError, Query, Response};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Longest the link mutex is held while waiting for a reply.
const RECV_SLICE: Duration = Duration::from_millis(10);

/// Command Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Per-attempt reply window.
    pub query_timeout: Duration,
    /// Extra attempts after a timeout.
    pub retries: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_millis(300),
            retries: 1,
        }
    }
}

/// Observer of outgoing traffic.
///
/// Called with the link mutex held: implementations must not block.
pub trait ChannelHook: Send + Sync {
    /// A datagram was written. `holder` is `None` for control-plane probes.
    fn on_sent(&self, holder: Option<Holder>, payload: &str);
}

/// Identity of the requester.
#[derive(Clone, Copy)]
pub enum Owner<'a> {
    /// Cadence Driver or Status Poller.
    Stream,
    /// A running program, proven by its lease.
    Program(&'a ProgramLease),
}

impl Owner<'_> {
    fn holder(&self) -> Holder {
        match self {
            Owner::Stream => Holder::Stream,
            Owner::Program(_) => Holder::Program,
        }
    }
}

struct Link {
    transport: Box<dyn Transport>,
    hooks: Vec<Arc<dyn ChannelHook>>,
    buf: Vec<u8>,
}

impl Link {
    fn write(&mut self, holder: Option<Holder>, payload: &str) -> Result<(), DriverError> {
        self.transport
            .send(payload.as_bytes())
            .map_err(map_transport_error)?;
        for hook in &self.hooks {
            hook.on_sent(holder, payload);
        }
        Ok(())
    }
}

struct Shared {
    /// One request or claim at a time. Taken before `link`.
    exchange: Mutex<()>,
    link: Mutex<Link>,
    ownership: LinkOwnership,
    health: LinkHealth,
    config: ChannelConfig,
}

/// Command Channel handle (cheap to clone).
#[derive(Clone)]
pub struct CommandChannel {
    shared: Arc<Shared>,
}

impl CommandChannel {
    pub fn new(transport: impl Transport + 'static, config: ChannelConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                exchange: Mutex::new(()),
                link: Mutex::new(Link {
                    transport: Box::new(transport),
                    hooks: Vec::new(),
                    buf: vec![0u8; MAX_DATAGRAM],
                }),
                ownership: LinkOwnership::new(),
                health: LinkHealth::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn add_hook(&self, hook: Arc<dyn ChannelHook>) {
        self.shared.link.lock().hooks.push(hook);
    }

    pub fn ownership(&self) -> &LinkOwnership {
        &self.shared.ownership
    }

    pub fn stream_state(&self) -> StreamState {
        self.shared.ownership.stream_state()
    }

    pub fn health(&self) -> &LinkHealth {
        &self.shared.health
    }

    /// Send a command without waiting for acknowledgment.
    pub fn send(&self, owner: Owner<'_>, command: &Command) -> Result<(), DriverError> {
        let payload = command.encode()?;
        let mut link = self.shared.link.lock();
        let holder = self.check_owner(owner)?;
        link.write(Some(holder), &payload)?;
        trace!(?holder, %payload, "command sent");
        Ok(())
    }

    /// Issue a query and wait for the reply answering it.
    pub fn query(&self, owner: Owner<'_>, query: Query) -> Result<Response, DriverError> {
        let _exchange = self.shared.exchange.lock();
        self.transact(Some(owner), query)
    }

    /// Health probe (`PING`). Bypasses the holder check.
    ///
    /// Returns the round-trip time.
    pub fn probe(&self) -> Result<Duration, DriverError> {
        let start = Instant::now();
        let _exchange = self.shared.exchange.lock();
        self.transact(None, Query::Ping)?;
        Ok(start.elapsed())
    }

    /// Take the link for a program. Waits for an in-flight request to finish.
    pub fn claim_program(&self) -> Result<ProgramLease, DriverError> {
        let _exchange = self.shared.exchange.lock();
        let _link = self.shared.link.lock();
        if !self.shared.ownership.set(Holder::Program) {
            return Err(DriverError::AlreadyClaimed);
        }
        info!("command channel claimed by program, stream paused");
        Ok(ProgramLease {
            channel: self.clone(),
        })
    }

    fn release_program(&self) {
        let _link = self.shared.link.lock();
        if self.shared.ownership.set(Holder::Stream) {
            info!("command channel released, stream resumed");
        }
    }

    fn check_owner(&self, owner: Owner<'_>) -> Result<Holder, DriverError> {
        let holder = self.shared.ownership.holder();
        let requested = owner.holder();
        if let Owner::Program(lease) = owner
            && !Arc::ptr_eq(&lease.channel.shared, &self.shared)
        {
            return Err(DriverError::NotOwner { holder });
        }
        if holder != requested {
            debug!(?holder, ?requested, "request rejected, link owned elsewhere");
            return Err(DriverError::NotOwner { holder });
        }
        Ok(holder)
    }

    /// Run one request. Caller holds the exchange lock; `owner` is `None`
    /// for control-plane probes.
    fn transact(&self, owner: Option<Owner<'_>>, query: Query) -> Result<Response, DriverError> {
        let health = &self.shared.health;
        let config = &self.shared.config;

        let mut last_malformed: Option<ProtocolError> = None;
        for attempt in 0..=config.retries {
            {
                let mut link = self.shared.link.lock();
                let holder = owner.map(|o| self.check_owner(o)).transpose()?;
                if attempt == 0 {
                    health.record_query();
                }
                link.transport.drain();
                if let Err(e) = link.write(holder, query.encode()) {
                    health.record_failure();
                    return Err(e);
                }
            }

            let deadline = Instant::now() + config.query_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let mut guard = self.shared.link.lock();
                let received = {
                    let link = &mut *guard;
                    link.transport
                        .recv(&mut link.buf, remaining.min(RECV_SLICE))
                        .map(|n| n.map(|n| link.buf[..n].to_vec()))
                };
                // Hand the link to a waiting sender before the next slice.
                MutexGuard::unlock_fair(guard);
                let datagram = match received {
                    Ok(Some(datagram)) => datagram,
                    Ok(None) => continue,
                    Err(e) => {
                        health.record_failure();
                        return Err(map_transport_error(e));
                    },
                };
                match Response::decode(&datagram) {
                    Ok(response) if response.answers(query) => {
                        health.record_success();
                        return Ok(response);
                    },
                    Ok(other) => {
                        debug!(tag = other.tag(), ?query, "discarding unrelated reply");
                    },
                    Err(e) => {
                        health.record_malformed();
                        warn!(?query, error = %e, "discarding malformed reply");
                        last_malformed = Some(e);
                    },
                }
            }
            trace!(?query, attempt, "query attempt timed out");
        }

        health.record_timeout();
        match last_malformed {
            Some(e) => Err(DriverError::Malformed(e)),
            None => Err(DriverError::Timeout),
        }
    }
}

fn map_transport_error(e: io::Error) -> DriverError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::NotConnected
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable => DriverError::Unreachable(e.to_string()),
        _ => DriverError::Io(e),
    }
}

/// Exclusive program ownership of the link.
///
/// Dropping the lease hands the link back to the stream loops.
pub struct ProgramLease {
    channel: CommandChannel,
}

impl ProgramLease {
    pub fn send(&self, command: &Command) -> Result<(), DriverError> {
        self.channel.send(Owner::Program(self), command)
    }

    pub fn query(&self, query: Query) -> Result<Response, DriverError> {
        self.channel.query(Owner::Program(self), query)
    }

    /// Release explicitly (same as dropping).
    pub fn release(self) {}
}

impl Drop for ProgramLease {
    fn drop(&mut self) {
        self.channel.release_program();
    }
}

impl std::fmt::Debug for ProgramLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramLease").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockController, mock_channel};
    use std::thread;

    fn channel() -> (CommandChannel, MockController) {
        mock_channel(ChannelConfig {
            query_timeout: Duration::from_millis(30),
            retries: 1,
        })
    }

    #[test]
    fn test_send_records_datagram() {
        let (channel, controller) = channel();
        channel.send(Owner::Stream, &Command::Stop).unwrap();
        assert_eq!(controller.sent_payloads(), vec!["STOP".to_string()]);
        assert_eq!(controller.sent()[0].holder, Some(Holder::Stream));
    }

    #[test]
    fn test_query_returns_matching_reply() {
        let (channel, _controller) = channel();
        let reply = channel.query(Owner::Stream, Query::Status).unwrap();
        assert!(matches!(reply, Response::Status(_)));
        let snap = channel.health().snapshot();
        assert_eq!((snap.queries, snap.successes), (1, 1));
    }

    #[test]
    fn test_query_timeout_retries_then_fails() {
        let (channel, controller) = channel();
        controller.set_online(false);
        let start = Instant::now();
        let err = channel.query(Owner::Stream, Query::Status).unwrap_err();
        assert!(matches!(err, DriverError::Timeout));
        // one attempt plus one retry
        assert_eq!(controller.sent_payloads().len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(55));
        assert_eq!(channel.health().consecutive_failures(), 1);
    }

    #[test]
    fn test_send_not_delayed_by_pending_query() {
        let (channel, controller) = mock_channel(ChannelConfig {
            query_timeout: Duration::from_millis(300),
            retries: 1,
        });
        controller.set_online(false);
        let querier = {
            let channel = channel.clone();
            thread::spawn(move || channel.query(Owner::Stream, Query::Status))
        };
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        channel.send(Owner::Stream, &Command::Stop).unwrap();
        assert!(start.elapsed() < Duration::from_millis(100), "{:?}", start.elapsed());

        assert!(matches!(querier.join().unwrap(), Err(DriverError::Timeout)));
        assert!(controller.sent_payloads().contains(&"STOP".to_string()));
    }

    #[test]
    fn test_claim_waits_for_pending_query() {
        let (channel, controller) = mock_channel(ChannelConfig {
            query_timeout: Duration::from_millis(150),
            retries: 0,
        });
        controller.set_online(false);
        let querier = {
            let channel = channel.clone();
            thread::spawn(move || channel.query(Owner::Stream, Query::Status))
        };
        thread::sleep(Duration::from_millis(30));

        let start = Instant::now();
        let lease = channel.claim_program().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert!(querier.join().unwrap().is_err());
        assert_eq!(controller.sent_payloads(), vec!["GET_STATUS".to_string()]);
        drop(lease);
    }

    #[test]
    fn test_malformed_reply_is_skipped() {
        let (channel, controller) = channel();
        controller.script_reply("STATUS|ANGLES=1,2");
        controller.script_reply("garbage");
        let reply = channel.query(Owner::Stream, Query::Status).unwrap();
        assert!(matches!(reply, Response::Status(_)));
        assert_eq!(channel.health().snapshot().malformed_responses, 2);
    }

    #[test]
    fn test_only_malformed_replies_report_malformed() {
        let (channel, controller) = channel();
        controller.set_online(false);
        controller.script_reply("STATUS|POSE=1");
        let err = channel.query(Owner::Stream, Query::Status).unwrap_err();
        assert!(matches!(err, DriverError::Malformed(_)));
    }

    #[test]
    fn test_unrelated_reply_is_ignored() {
        let (channel, controller) = channel();
        controller.script_reply("ACK|1|OK|");
        let reply = channel.query(Owner::Stream, Query::Ping).unwrap();
        assert_eq!(reply, Response::Pong);
        assert_eq!(channel.health().snapshot().malformed_responses, 0);
    }

    #[test]
    fn test_program_claim_blocks_stream() {
        let (channel, controller) = channel();
        let lease = channel.claim_program().unwrap();
        assert_eq!(channel.stream_state(), StreamState::Paused);

        let err = channel.send(Owner::Stream, &Command::Stop).unwrap_err();
        assert!(matches!(
            err,
            DriverError::NotOwner {
                holder: Holder::Program
            }
        ));
        assert!(channel.query(Owner::Stream, Query::Status).is_err());
        assert!(controller.sent().is_empty());

        lease.send(&Command::Stop).unwrap();
        assert_eq!(controller.sent()[0].holder, Some(Holder::Program));

        assert!(matches!(
            channel.claim_program(),
            Err(DriverError::AlreadyClaimed)
        ));

        drop(lease);
        assert_eq!(channel.stream_state(), StreamState::Active);
        channel.send(Owner::Stream, &Command::Stop).unwrap();
    }

    #[test]
    fn test_foreign_lease_rejected() {
        let (a, _) = channel();
        let (b, controller_b) = channel();
        let lease_a = a.claim_program().unwrap();
        let err = b.send(Owner::Program(&lease_a), &Command::Stop).unwrap_err();
        assert!(matches!(err, DriverError::NotOwner { .. }));
        assert!(controller_b.sent().is_empty());
    }

    #[test]
    fn test_probe_ignores_holder() {
        let (channel, controller) = channel();
        let _lease = channel.claim_program().unwrap();
        channel.probe().unwrap();
        let sent = controller.sent();
        assert_eq!(sent[0].payload, "PING");
        assert_eq!(sent[0].holder, None);
    }

    #[test]
    fn test_invalid_command_not_sent() {
        let (channel, controller) = channel();
        let err = channel
            .send(Owner::Stream, &Command::SetPort(String::new()))
            .unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
        assert!(controller.sent().is_empty());
    }
}
