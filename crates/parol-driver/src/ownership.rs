//! Link ownership
//!
//! Exactly one party may issue requests over the Command Channel: the
//! stream loops (Cadence Driver and Status Poller together) or a running
//! program. The holder only changes while the channel's link mutex is held,
//! so a request checked under that mutex can never race a hand-over.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Current holder of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Holder {
    /// Cadence Driver and Status Poller (default).
    #[default]
    Stream = 0,
    /// Program Runner, while a program is active.
    Program = 1,
}

/// Stream view of the ownership token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Active,
    Paused,
}

impl From<Holder> for StreamState {
    fn from(holder: Holder) -> Self {
        match holder {
            Holder::Stream => StreamState::Active,
            Holder::Program => StreamState::Paused,
        }
    }
}

#[derive(Debug, Default)]
struct Token {
    holder: Holder,
    /// Bumped on every hand-over.
    generation: u64,
}

/// Ownership token with wake-ups for parties waiting on a hand-over.
#[derive(Debug, Default)]
pub struct LinkOwnership {
    token: Mutex<Token>,
    changed: Condvar,
}

impl LinkOwnership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Holder {
        self.token.lock().holder
    }

    pub fn stream_state(&self) -> StreamState {
        self.holder().into()
    }

    /// Hand-over counter.
    pub fn generation(&self) -> u64 {
        self.token.lock().generation
    }

    /// Change the holder. Returns false if it already was `holder`.
    ///
    /// Callers must hold the channel's link mutex.
    pub(crate) fn set(&self, holder: Holder) -> bool {
        let mut token = self.token.lock();
        if token.holder == holder {
            return false;
        }
        token.holder = holder;
        token.generation += 1;
        drop(token);
        self.changed.notify_all();
        true
    }

    /// Block while the stream is paused, for at most `timeout`.
    pub fn wait_while_paused(&self, timeout: Duration) -> StreamState {
        let deadline = Instant::now() + timeout;
        let mut token = self.token.lock();
        while token.holder == Holder::Program {
            if self.changed.wait_until(&mut token, deadline).timed_out() {
                break;
            }
        }
        token.holder.into()
    }

    /// Block until the generation moves past `seen`, for at most `timeout`.
    ///
    /// Returns the current generation.
    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut token = self.token.lock();
        while token.generation == seen {
            if self.changed.wait_until(&mut token, deadline).timed_out() {
                break;
            }
        }
        token.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_default_is_stream() {
        let ownership = LinkOwnership::new();
        assert_eq!(ownership.holder(), Holder::Stream);
        assert_eq!(ownership.stream_state(), StreamState::Active);
        assert_eq!(ownership.generation(), 0);
    }

    #[test]
    fn test_set_bumps_generation_once() {
        let ownership = LinkOwnership::new();
        assert!(ownership.set(Holder::Program));
        assert!(!ownership.set(Holder::Program));
        assert_eq!(ownership.generation(), 1);
        assert_eq!(ownership.stream_state(), StreamState::Paused);
    }

    #[test]
    fn test_wait_while_paused_times_out() {
        let ownership = LinkOwnership::new();
        ownership.set(Holder::Program);
        let start = Instant::now();
        let state = ownership.wait_while_paused(Duration::from_millis(30));
        assert_eq!(state, StreamState::Paused);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_wait_while_paused_wakes_on_release() {
        let ownership = Arc::new(LinkOwnership::new());
        ownership.set(Holder::Program);

        let releaser = {
            let ownership = ownership.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ownership.set(Holder::Stream);
            })
        };

        let start = Instant::now();
        let state = ownership.wait_while_paused(Duration::from_secs(5));
        assert_eq!(state, StreamState::Active);
        assert!(start.elapsed() < Duration::from_secs(1));
        releaser.join().unwrap();
    }

    #[test]
    fn test_wait_for_change() {
        let ownership = Arc::new(LinkOwnership::new());
        let seen = ownership.generation();
        let changer = {
            let ownership = ownership.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                ownership.set(Holder::Program);
            })
        };
        let generation = ownership.wait_for_change(seen, Duration::from_secs(5));
        assert_eq!(generation, seen + 1);
        changer.join().unwrap();

        // No change: returns after the timeout with the same generation.
        assert_eq!(
            ownership.wait_for_change(generation, Duration::from_millis(10)),
            generation
        );
    }
}
