//! Reconnect bookkeeping for terminal stream clients.
//!
//! Transport-agnostic: the caller owns the socket and the timer and feeds
//! events in; the machine says what to do next.

use std::time::Duration;

/// Delay before reconnect attempt `attempt` (1-based), or `None` to give up.
pub trait BackoffPolicy {
    fn delay(&self, attempt: u32) -> Option<Duration>;
}

/// `base * 2^(attempt-1)`, capped at `max_delay`, for at most `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max_delay))
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the caller should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Open the transport now.
    Connect,
    /// Wait this long, then call [`Reconnector::retry`].
    RetryAfter(Duration),
    /// Attempts exhausted; stay disconnected until [`Reconnector::reset`].
    GiveUp,
    Nothing,
}

/// `disconnected → connecting → connected` with a pluggable backoff policy.
#[derive(Debug, Clone)]
pub struct Reconnector<P> {
    policy: P,
    state: ConnectionState,
    attempt: u32,
    /// Cleared by an explicit close; no automatic reconnect afterwards.
    wanted: bool,
}

impl<P: BackoffPolicy> Reconnector<P> {
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
            wanted: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// User asked to connect.
    pub fn connect(&mut self) -> ReconnectAction {
        self.wanted = true;
        match self.state {
            ConnectionState::Disconnected => {
                self.state = ConnectionState::Connecting;
                ReconnectAction::Connect
            }
            _ => ReconnectAction::Nothing,
        }
    }

    /// Transport reported open.
    pub fn opened(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempt = 0;
    }

    /// Transport failed to open or dropped.
    pub fn closed(&mut self) -> ReconnectAction {
        self.state = ConnectionState::Disconnected;
        if !self.wanted {
            return ReconnectAction::Nothing;
        }
        self.attempt += 1;
        match self.policy.delay(self.attempt) {
            Some(d) => ReconnectAction::RetryAfter(d),
            None => ReconnectAction::GiveUp,
        }
    }

    /// Backoff timer fired.
    pub fn retry(&mut self) -> ReconnectAction {
        if !self.wanted || self.state != ConnectionState::Disconnected {
            return ReconnectAction::Nothing;
        }
        self.state = ConnectionState::Connecting;
        ReconnectAction::Connect
    }

    /// User closed the connection deliberately.
    pub fn disconnect(&mut self) {
        self.wanted = false;
        self.state = ConnectionState::Disconnected;
    }

    /// Forget previous failures, e.g. after the user presses "reconnect".
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delays_are_capped() {
        let p = ExponentialBackoff {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            max_attempts: 5,
        };
        assert_eq!(p.delay(1), Some(Duration::from_millis(500)));
        assert_eq!(p.delay(2), Some(Duration::from_secs(1)));
        assert_eq!(p.delay(3), Some(Duration::from_secs(2)));
        assert_eq!(p.delay(4), Some(Duration::from_secs(3)));
        assert_eq!(p.delay(5), Some(Duration::from_secs(3)));
        assert_eq!(p.delay(6), None);
        assert_eq!(p.delay(0), None);
    }

    #[test]
    fn reconnects_until_attempts_run_out() {
        let mut r = Reconnector::new(ExponentialBackoff {
            max_attempts: 2,
            ..Default::default()
        });
        assert_eq!(r.connect(), ReconnectAction::Connect);
        assert_eq!(r.state(), ConnectionState::Connecting);
        r.opened();
        assert_eq!(r.state(), ConnectionState::Connected);

        assert_eq!(r.closed(), ReconnectAction::RetryAfter(Duration::from_secs(1)));
        assert_eq!(r.retry(), ReconnectAction::Connect);
        assert_eq!(r.closed(), ReconnectAction::RetryAfter(Duration::from_secs(2)));
        assert_eq!(r.retry(), ReconnectAction::Connect);
        assert_eq!(r.closed(), ReconnectAction::GiveUp);
        assert_eq!(r.attempts(), 3);

        r.reset();
        assert_eq!(r.retry(), ReconnectAction::Connect);
        r.opened();
        assert_eq!(r.attempts(), 0);
    }

    #[test]
    fn deliberate_close_does_not_retry() {
        let mut r = Reconnector::new(ExponentialBackoff::default());
        r.connect();
        r.opened();
        r.disconnect();
        assert_eq!(r.closed(), ReconnectAction::Nothing);
        assert_eq!(r.retry(), ReconnectAction::Nothing);
    }
}
