//! Program output fan-out
//!
//! Every line captured from a run is kept in the run's backlog and pushed
//! to each subscriber's bounded queue. Slow subscribers lose their oldest
//! lines; the reader threads never block on them.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Default per-subscriber queue depth.
pub const OUTPUT_CAPACITY: usize = 1024;

/// Prefix marking a line that came from standard error.
pub const STDERR_PREFIX: &str = "[ERR] ";

/// Source stream of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// One captured line, trailing whitespace removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub source: OutputSource,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            source: OutputSource::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            source: OutputSource::Stderr,
            text: text.into(),
        }
    }
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            OutputSource::Stdout => f.write_str(&self.text),
            OutputSource::Stderr => write!(f, "{STDERR_PREFIX}{}", self.text),
        }
    }
}

struct Subscriber {
    tx: Sender<OutputLine>,
    /// Used to evict the oldest queued line when the queue is full.
    rx: Receiver<OutputLine>,
    /// Dead once the [`OutputStream`] is dropped.
    alive: Weak<()>,
}

struct HubState {
    backlog: Vec<OutputLine>,
    subscribers: Vec<Subscriber>,
    closed: bool,
    dropped: u64,
}

/// Output hub of one run.
#[derive(Clone)]
pub struct OutputHub {
    state: Arc<Mutex<HubState>>,
    capacity: usize,
}

impl OutputHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                backlog: Vec::new(),
                subscribers: Vec::new(),
                closed: false,
                dropped: 0,
            })),
            capacity: capacity.max(1),
        }
    }

    /// Record and broadcast a line. Ignored after [`close`](Self::close).
    pub fn push(&self, line: OutputLine) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.backlog.push(line.clone());

        let mut dropped = 0;
        state.subscribers.retain(|sub| {
            if sub.alive.strong_count() == 0 {
                return false;
            }
            let mut line = line.clone();
            loop {
                match sub.tx.try_send(line) {
                    Ok(()) => return true,
                    Err(TrySendError::Full(back)) => {
                        if sub.rx.try_recv().is_ok() {
                            dropped += 1;
                        }
                        line = back;
                    },
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            }
        });
        state.dropped += dropped;
    }

    /// End of output: subscribers see end-of-stream once drained.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Subscribe, replaying the newest backlog lines that fit the queue.
    pub fn subscribe(&self) -> OutputStream {
        let mut state = self.state.lock();
        let (tx, rx) = crossbeam_channel::bounded(self.capacity);
        let skip = state.backlog.len().saturating_sub(self.capacity);
        for line in &state.backlog[skip..] {
            let _ = tx.try_send(line.clone());
        }
        let alive = Arc::new(());
        if !state.closed {
            state.subscribers.push(Subscriber {
                tx,
                rx: rx.clone(),
                alive: Arc::downgrade(&alive),
            });
        }
        OutputStream { rx, _alive: alive }
    }

    /// Full output so far.
    pub fn lines(&self) -> Vec<OutputLine> {
        self.state.lock().backlog.iter().cloned().collect()
    }

    /// Lines evicted from slow subscribers.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

/// Subscriber side: an iterator that ends when the run's output closes.
pub struct OutputStream {
    rx: Receiver<OutputLine>,
    _alive: Arc<()>,
}

impl OutputStream {
    /// Next line; `Disconnected` marks the end of the stream.
    pub fn next_timeout(&self, timeout: Duration) -> Result<OutputLine, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_next(&self) -> Option<OutputLine> {
        self.rx.try_recv().ok()
    }
}

impl Iterator for OutputStream {
    type Item = OutputLine;

    fn next(&mut self) -> Option<OutputLine> {
        self.rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_prefix() {
        assert_eq!(OutputLine::stdout("hello").to_string(), "hello");
        assert_eq!(OutputLine::stderr("boom").to_string(), "[ERR] boom");
    }

    #[test]
    fn test_replay_then_live_then_end() {
        let hub = OutputHub::new(8);
        hub.push(OutputLine::stdout("a"));
        let stream = hub.subscribe();
        hub.push(OutputLine::stderr("b"));
        hub.close();
        hub.push(OutputLine::stdout("ignored"));

        let lines: Vec<String> = stream.map(|l| l.to_string()).collect();
        assert_eq!(lines, vec!["a", "[ERR] b"]);
    }

    #[test]
    fn test_subscribe_after_close_replays_backlog() {
        let hub = OutputHub::new(8);
        hub.push(OutputLine::stdout("x"));
        hub.close();
        assert!(hub.is_closed());
        let lines: Vec<OutputLine> = hub.subscribe().collect();
        assert_eq!(lines, vec![OutputLine::stdout("x")]);
    }

    #[test]
    fn test_replay_is_bounded_but_backlog_is_not() {
        let hub = OutputHub::new(3);
        for i in 0..5 {
            hub.push(OutputLine::stdout(i.to_string()));
        }
        hub.close();
        assert_eq!(hub.lines().len(), 5);
        let texts: Vec<String> = hub.subscribe().map(|l| l.text).collect();
        assert_eq!(texts, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_slow_subscriber_drops_oldest() {
        let hub = OutputHub::new(2);
        let stream = hub.subscribe();
        for i in 0..5 {
            hub.push(OutputLine::stdout(i.to_string()));
        }
        hub.close();
        let texts: Vec<String> = stream.map(|l| l.text).collect();
        assert_eq!(texts, vec!["3", "4"]);
        assert_eq!(hub.dropped(), 3);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let hub = OutputHub::new(4);
        drop(hub.subscribe());
        hub.push(OutputLine::stdout("a"));
        assert_eq!(hub.state.lock().subscribers.len(), 0);
    }

    #[test]
    fn test_next_timeout() {
        let hub = OutputHub::new(4);
        let stream = hub.subscribe();
        let wait = Duration::from_millis(10);
        assert_eq!(stream.next_timeout(wait), Err(RecvTimeoutError::Timeout));
        hub.push(OutputLine::stdout("a"));
        assert_eq!(stream.next_timeout(wait), Ok(OutputLine::stdout("a")));
        hub.close();
        assert_eq!(stream.next_timeout(wait), Err(RecvTimeoutError::Disconnected));
    }
}
