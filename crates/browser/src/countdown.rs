//! Conversion countdown
//!
//! A wall-clock budget shared by every step of one conversion. Pausing
//! suspends deadline enforcement (used while a step with its own bounded
//! timeout runs) but the clock keeps counting, so the budget is never extended.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CountdownTimer {
    budget: Duration,
    started: Option<Instant>,
    paused: bool,
}

impl CountdownTimer {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            started: None,
            paused: false,
        }
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.paused = false;
    }

    pub fn stop(&mut self) {
        self.started = None;
        self.paused = false;
    }

    pub fn pause(&mut self) {
        if self.started.is_some() {
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Started and not paused
    pub fn is_running(&self) -> bool {
        self.started.is_some() && !self.paused
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.started.is_some() && self.elapsed() >= self.budget
    }

    /// When enforcement would fire, if it is currently enforced.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.started, self.paused) {
            (Some(started), false) => started.checked_add(self.budget),
            _ => None,
        }
    }

    /// Resolves at the deadline; never resolves while stopped or paused.
    pub async fn expired(&self) {
        match self.deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// A child of `parent` that is also cancelled at the deadline.
    pub fn linked_token(&self, parent: &CancellationToken) -> DeadlineToken {
        let token = parent.child_token();
        let timer = self.deadline().map(|deadline| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => token.cancel(),
                    _ = token.cancelled() => {}
                }
            })
        });
        DeadlineToken { token, timer }
    }
}

/// Cancellation token bound to a countdown deadline. Dropping it stops the timer task.
pub struct DeadlineToken {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl DeadlineToken {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for DeadlineToken {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
