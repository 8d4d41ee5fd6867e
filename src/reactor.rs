//! Readiness polling and timers.
//!
//! Thin wrapper around a `mio::Poll` that adds token allocation and a small
//! scanned timer list. Everything runs on one thread: completions are only
//! ever observed from the engine's `step`, never inline with the request
//! that started them. Cancelling a timer that already fired, was already
//! cancelled, or never existed is a no-op.

use std::io;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

/// Upper bound on a single poll wait so timer expiry stays responsive even
/// when the caller passes a long wait.
const MAX_POLL_WAIT: Duration = Duration::from_millis(100);

struct Timer {
    token: Token,
    deadline: Instant,
}

/// Single-threaded readiness reactor.
pub struct Reactor {
    poll: Poll,
    next_token: usize,
    timers: Vec<Timer>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            next_token: 0,
            timers: Vec::new(),
        })
    }

    /// Allocate a fresh token. Tokens are never reused.
    pub fn token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn register<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interests)
    }

    pub fn reregister<S: Source>(
        &mut self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interests)
    }

    /// Deregister a source, ignoring failures from sockets that already
    /// went away. Safe to call more than once.
    pub fn deregister<S: Source>(&mut self, source: &mut S) {
        let _ = self.poll.registry().deregister(source);
    }

    /// Arm a one-shot timer firing `after` from now.
    pub fn arm_timer(&mut self, after: Duration) -> Token {
        let token = self.token();
        self.timers.push(Timer {
            token,
            deadline: Instant::now() + after,
        });
        token
    }

    /// Cancel a timer. Unknown, fired, and already-cancelled tokens are
    /// all no-ops.
    pub fn cancel_timer(&mut self, token: Token) {
        self.timers.retain(|t| t.token != token);
    }

    /// Nearest timer deadline as a wait duration, if any timer is armed.
    fn nearest_deadline(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .iter()
            .map(|t| t.deadline.saturating_duration_since(now))
            .min()
    }

    /// Wait for readiness events, bounded by `max_wait` and the nearest
    /// timer deadline.
    pub fn poll(&mut self, events: &mut Events, max_wait: Duration) -> io::Result<()> {
        let mut wait = max_wait.min(MAX_POLL_WAIT);
        if let Some(nearest) = self.nearest_deadline() {
            wait = wait.min(nearest);
        }

        match self.poll.poll(events, Some(wait)) {
            Ok(()) => Ok(()),
            // Signal delivery interrupts the wait; the caller just polls
            // again on its next turn.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove and return the tokens of all timers whose deadline passed.
    pub fn expired_timers(&mut self) -> Vec<Token> {
        let now = Instant::now();
        let mut fired = Vec::new();
        self.timers.retain(|t| {
            if t.deadline <= now {
                fired.push(t.token);
                false
            } else {
                true
            }
        });
        fired
    }

    #[cfg(test)]
    fn armed_timers(&self) -> usize {
        self.timers.len()
    }
}
