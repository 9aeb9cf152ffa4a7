//! Keep alive bookkeeping for one session

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct WatchConfig {
    /// Time between two alive checks
    pub interval: Duration,
    /// Time the peer has to answer a check
    pub deadline: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            deadline: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    /// An alive check should be sent now
    SendCheck,
    /// The last check was not answered in time
    TimedOut,
    Wait,
}

/// Decides when to send alive checks and when a peer counts as gone
///
/// Holds no socket, the owner sends the checks and feeds answers back.
#[derive(Debug)]
pub struct ConnectionWatch {
    config: WatchConfig,
    next_check: Instant,
    pending_since: Option<Instant>,
    timed_out: bool,
}

impl ConnectionWatch {
    pub fn new(config: WatchConfig, now: Instant) -> Self {
        Self {
            config,
            next_check: now + config.interval,
            pending_since: None,
            timed_out: false,
        }
    }

    pub fn poll(&mut self, now: Instant) -> WatchAction {
        if self.timed_out {
            return WatchAction::TimedOut;
        }

        match self.pending_since {
            Some(sent) if now.saturating_duration_since(sent) >= self.config.deadline => {
                self.timed_out = true;
                WatchAction::TimedOut
            }
            Some(_) => WatchAction::Wait,
            None if now >= self.next_check => {
                self.pending_since = Some(now);
                self.next_check = now + self.config.interval;
                WatchAction::SendCheck
            }
            None => WatchAction::Wait,
        }
    }

    /// Records an answer, answers after a time out are ignored
    pub fn on_answer(&mut self, now: Instant) {
        if self.timed_out {
            return;
        }

        if let Some(sent) = self.pending_since.take() {
            let round_trip = now.saturating_duration_since(sent);
            tracing::trace!("Alive check answered after {round_trip:?}");
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }
}
