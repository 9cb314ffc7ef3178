//! In-memory controller for tests
//!
//! [`MockTransport`] answers queries the way the headless controller does;
//! [`MockController`] is the test-side handle that scripts replies, toggles
//! reachability and records every datagram with the holder that sent it.

use crate::channel::{ChannelConfig, ChannelHook, CommandChannel};
use crate::ownership::Holder;
use crate::transport::Transport;
use parking_lot::{Condvar, Mutex};
use parol_protocol::{Query, Telemetry};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One datagram seen on the wire.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub payload: String,
    /// `None` for control-plane probes.
    pub holder: Option<Holder>,
    pub at: Instant,
}

#[derive(Default)]
struct Inner {
    /// Reachable from this instant on; `None` = unreachable.
    online_from: Option<Instant>,
    inbox: VecDeque<Vec<u8>>,
    scripted: VecDeque<String>,
    sent: Vec<SentRecord>,
    telemetry: Telemetry,
    loop_count: u64,
    send_error: Option<io::ErrorKind>,
}

#[derive(Default)]
struct MockState {
    inner: Mutex<Inner>,
    arrived: Condvar,
}

/// Transport side of the mock.
pub struct MockTransport {
    state: Arc<MockState>,
}

/// Test-side handle of the mock.
#[derive(Clone)]
pub struct MockController {
    state: Arc<MockState>,
}

impl MockTransport {
    /// Create a reachable mock controller.
    pub fn new() -> (Self, MockController) {
        let state = Arc::new(MockState::default());
        state.inner.lock().online_from = Some(Instant::now());
        (
            Self {
                state: state.clone(),
            },
            MockController { state },
        )
    }
}

/// Command Channel wired to a fresh mock controller that records traffic.
pub fn mock_channel(config: ChannelConfig) -> (CommandChannel, MockController) {
    let (transport, controller) = MockTransport::new();
    let channel = CommandChannel::new(transport, config);
    channel.add_hook(Arc::new(controller.clone()));
    (channel, controller)
}

impl Inner {
    fn online(&self) -> bool {
        self.online_from.is_some_and(|t| Instant::now() >= t)
    }

    fn auto_reply(&mut self, query: Query) -> String {
        match query {
            Query::Ping => "PONG".to_string(),
            Query::Status => self.telemetry.encode(),
            Query::LoopStats => {
                self.loop_count += 100;
                format!("LOOP_STATS|{{\"loop_count\": {}}}", self.loop_count)
            },
        }
    }
}

fn parse_query(payload: &str) -> Option<Query> {
    [Query::Ping, Query::Status, Query::LoopStats]
        .into_iter()
        .find(|q| q.encode() == payload.trim())
}

impl Transport for MockTransport {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut inner = self.state.inner.lock();
        if let Some(kind) = inner.send_error {
            return Err(io::Error::new(kind, "mock send error"));
        }
        let text = String::from_utf8_lossy(payload).into_owned();
        if let Some(query) = parse_query(&text) {
            while let Some(reply) = inner.scripted.pop_front() {
                inner.inbox.push_back(reply.into_bytes());
            }
            if inner.online() {
                let reply = inner.auto_reply(query);
                inner.inbox.push_back(reply.into_bytes());
            }
            drop(inner);
            self.state.arrived.notify_all();
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.state.inner.lock();
        loop {
            if let Some(datagram) = inner.inbox.pop_front() {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                return Ok(Some(n));
            }
            if self
                .state
                .arrived
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return Ok(None);
            }
        }
    }

    fn drain(&mut self) -> usize {
        let mut inner = self.state.inner.lock();
        let n = inner.inbox.len();
        inner.inbox.clear();
        n
    }
}

impl ChannelHook for MockController {
    fn on_sent(&self, holder: Option<Holder>, payload: &str) {
        self.state.inner.lock().sent.push(SentRecord {
            payload: payload.to_string(),
            holder,
            at: Instant::now(),
        });
    }
}

impl MockController {
    pub fn set_online(&self, online: bool) {
        self.state.inner.lock().online_from = online.then(Instant::now);
    }

    /// Become reachable after `delay`.
    pub fn set_online_after(&self, delay: Duration) {
        self.state.inner.lock().online_from = Some(Instant::now() + delay);
    }

    pub fn is_online(&self) -> bool {
        self.state.inner.lock().online()
    }

    /// Reply delivered ahead of the automatic one on the next query.
    pub fn script_reply(&self, reply: &str) {
        self.state.inner.lock().scripted.push_back(reply.to_string());
    }

    /// Datagram available immediately (drained as stale by the next query).
    pub fn inject(&self, reply: &str) {
        self.state
            .inner
            .lock()
            .inbox
            .push_back(reply.as_bytes().to_vec());
        self.state.arrived.notify_all();
    }

    pub fn set_telemetry(&self, telemetry: Telemetry) {
        self.state.inner.lock().telemetry = telemetry;
    }

    /// Make every transport write fail with `kind`.
    pub fn set_send_error(&self, kind: Option<io::ErrorKind>) {
        self.state.inner.lock().send_error = kind;
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.state.inner.lock().sent.clone()
    }

    pub fn sent_payloads(&self) -> Vec<String> {
        self.sent().into_iter().map(|r| r.payload).collect()
    }

    /// Records whose payload starts with `tag`.
    pub fn sent_with_tag(&self, tag: &str) -> Vec<SentRecord> {
        self.sent()
            .into_iter()
            .filter(|r| r.payload.split('|').next() == Some(tag))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.inner.lock().sent.clear();
    }
}
