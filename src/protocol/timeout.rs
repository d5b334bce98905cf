//! Adaptive deadline for the root's wait loop.
//!
//! The timeout value is the only piece of run state shared across tasks: a
//! supervisor may change it while the dispatch loop is waiting. The loop never
//! holds the lock across an await; it reads the value once per wait cycle when
//! the `SilenceTimer` is (re)armed.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Mutex-guarded timeout shared between a protocol instance and its handles
#[derive(Clone, Debug)]
pub struct TimeoutController {
    timeout: Arc<Mutex<Duration>>,
}

impl TimeoutController {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: Arc::new(Mutex::new(timeout)),
        }
    }

    /// Set the new timeout
    pub fn set_timeout(&self, timeout: Duration) {
        let mut guard = self
            .timeout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = timeout;
    }

    /// Returns the current timeout
    pub fn timeout(&self) -> Duration {
        *self
            .timeout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Restartable silence window: every reset starts a fresh period from now
#[derive(Debug)]
pub struct SilenceTimer {
    controller: TimeoutController,
    deadline: Option<Instant>,
    last_activity: Option<Instant>,
    resets: u64,
}

impl SilenceTimer {
    pub fn new(controller: TimeoutController) -> Self {
        Self {
            controller,
            deadline: None,
            last_activity: None,
            resets: 0,
        }
    }

    /// Arm (or re-arm) the window at `now + timeout`
    pub fn reset(&mut self) -> Instant {
        let now = Instant::now();
        let deadline = now + self.controller.timeout();
        self.deadline = Some(deadline);
        self.last_activity = Some(now);
        self.resets += 1;
        deadline
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time since the window was last restarted
    pub fn silence(&self) -> Duration {
        self.last_activity
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }
}
