//! Timeout watchdog.

use std::{future::Future, time::Duration};

use tokio::time::{self, Instant};

/// Single-shot, re-armable deadline.
///
/// Arming replaces the previous deadline; there is never more than one.
#[derive(Debug, Clone)]
pub struct Watchdog {
    duration: Option<Duration>,
    deadline: Option<Instant>,
}

impl Watchdog {
    /// Create a watchdog. `None` disables it: arming is then a no-op.
    #[must_use]
    pub const fn new(duration: Option<Duration>) -> Self {
        Self {
            duration,
            deadline: None,
        }
    }

    #[must_use]
    pub const fn duration(&self) -> Option<Duration> {
        self.duration
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Start counting from now, replacing any pending deadline.
    ///
    /// A duration too large to represent as a deadline never expires.
    pub fn arm(&mut self) {
        if let Some(duration) = self.duration {
            self.deadline = Instant::now().checked_add(duration);
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Resolves when the current deadline passes; pending forever when unarmed.
    ///
    /// The future captures the deadline at call time, so it must be recreated
    /// after every `arm`/`disarm`.
    pub fn expired(&self) -> impl Future<Output = ()> + Send + use<> {
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(deadline) => time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        }
    }
}
