//! Cancellable one-shot timers for the upgrade session.
//!
//! One abstraction serves all three timeout domains (command-response,
//! offline-wait, reconnect). A timer is just an armed deadline: nothing is
//! spawned, so clearing it cannot leak a task, and re-arming replaces the
//! previous deadline.

use std::time::Duration;
use tokio::time::Instant;

/// A cancellable one-shot deadline.
#[derive(Debug, Default)]
pub struct OneShot {
    deadline: Option<Instant>,
}

impl OneShot {
    /// Create a disarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer `duration` from now, replacing any existing deadline.
    pub fn arm(&mut self, duration: Duration) {
        self.deadline = Some(Instant::now() + duration);
    }

    /// Disarm the timer.
    pub fn clear(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is armed.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve when the armed deadline passes; never resolves while
    /// disarmed. Intended for use inside `select!` arms.
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
