//! Reconnection policy for the push channel.
//!
//! Decides whether an unexpected close is retried and schedules exactly one
//! pending attempt at a time. The default is a fixed 5 second delay with no
//! attempt cap, retried for as long as a credential exists; an exponential
//! variant with a cap is available through configuration.
//!
//! Closes with the normal code (1000) or the application's unauthorized code
//! are never retried.

// Rust guideline compliant 2026-02

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::constants::{MAX_RECONNECT_DELAY, NORMAL_CLOSE_CODE, RECONNECT_DELAY};
use crate::error::ConnectionErrorKind;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every attempt, unlimited attempts.
    Fixed {
        /// Delay before each attempt.
        #[serde(with = "secs")]
        delay: Duration,
    },
    /// Doubling delay up to `max`, giving up after `max_attempts` if set.
    Exponential {
        /// Delay before the first attempt.
        #[serde(with = "secs")]
        initial: Duration,
        /// Upper bound for the delay.
        #[serde(with = "secs")]
        max: Duration,
        /// Attempts before giving up; `None` retries forever.
        #[serde(default)]
        max_attempts: Option<u32>,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed {
            delay: RECONNECT_DELAY,
        }
    }
}

impl Backoff {
    /// Capped exponential schedule starting at the default reconnect delay.
    pub fn capped_exponential(max_attempts: Option<u32>) -> Self {
        Self::Exponential {
            initial: RECONNECT_DELAY,
            max: MAX_RECONNECT_DELAY,
            max_attempts,
        }
    }

    /// Delay before attempt number `attempt` (1-based), or `None` to give up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            Self::Fixed { delay } => Some(delay),
            Self::Exponential {
                initial,
                max,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|cap| attempt > cap) {
                    return None;
                }
                let shift = attempt.saturating_sub(1).min(16);
                Some(initial.saturating_mul(1 << shift).min(max))
            }
        }
    }
}

/// Serialize durations as whole seconds in config files.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Bookkeeping for the current run of reconnect attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectAttempt {
    /// Attempts scheduled since the last successful open.
    pub attempt_count: u32,
    /// When the pending attempt fires, if one is pending.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Error that triggered the most recent scheduling.
    pub last_error: Option<ConnectionErrorKind>,
}

#[derive(Debug, Default)]
struct PolicyState {
    attempt: ReconnectAttempt,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every schedule/cancel so a fired timer can tell if it is current.
    timer_generation: u64,
}

/// Schedules reconnect attempts for one connection manager.
#[derive(Debug)]
pub struct ReconnectPolicy {
    backoff: Backoff,
    unauthorized_code: u16,
    state: std::sync::Arc<Mutex<PolicyState>>,
}

impl ReconnectPolicy {
    /// Create a policy with no pending attempt.
    pub fn new(backoff: Backoff, unauthorized_code: u16) -> Self {
        Self {
            backoff,
            unauthorized_code,
            state: std::sync::Arc::default(),
        }
    }

    /// Whether a close with `code` may be retried at all.
    pub fn should_reconnect(&self, code: u16) -> bool {
        code != NORMAL_CLOSE_CODE && code != self.unauthorized_code
    }

    /// Schedule one attempt, replacing any pending one.
    ///
    /// `reconnect` runs once after the backoff delay unless [`Self::cancel`]
    /// or another `schedule` happens first. Returns the delay, or `None` when
    /// the backoff gave up. Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, last_error: Option<ConnectionErrorKind>, reconnect: F) -> Option<Duration>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock().expect("ReconnectPolicy mutex poisoned");
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }
        state.timer_generation += 1;

        let attempt = state.attempt.attempt_count + 1;
        let Some(delay) = self.backoff.delay_for(attempt) else {
            log::warn!(
                "[Reconnect] Giving up after {} attempts",
                state.attempt.attempt_count
            );
            state.attempt.scheduled_at = None;
            state.attempt.last_error = last_error;
            return None;
        };

        state.attempt.attempt_count = attempt;
        state.attempt.scheduled_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
        state.attempt.last_error = last_error;

        let generation = state.timer_generation;
        let shared = std::sync::Arc::clone(&self.state);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = shared.lock().expect("ReconnectPolicy mutex poisoned");
                if state.timer_generation != generation {
                    return;
                }
                // Detach our own handle; the attempt is no longer pending.
                state.timer = None;
                state.attempt.scheduled_at = None;
            }
            log::info!("[Reconnect] Attempt {} firing", attempt);
            reconnect();
        }));

        log::info!(
            "[Reconnect] Attempt {} scheduled in {}s",
            attempt,
            delay.as_secs()
        );
        Some(delay)
    }

    /// Cancel the pending attempt. Returns `true` if one was pending.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock().expect("ReconnectPolicy mutex poisoned");
        state.timer_generation += 1;
        state.attempt.scheduled_at = None;
        match state.timer.take() {
            Some(timer) => {
                timer.abort();
                log::debug!("[Reconnect] Pending attempt cancelled");
                true
            }
            None => false,
        }
    }

    /// Forget previous attempts after a successful open.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("ReconnectPolicy mutex poisoned");
        state.attempt = ReconnectAttempt::default();
    }

    /// Whether an attempt is scheduled and has not fired yet.
    pub fn is_pending(&self) -> bool {
        self.state
            .lock()
            .expect("ReconnectPolicy mutex poisoned")
            .timer
            .is_some()
    }

    /// Snapshot of the attempt bookkeeping.
    pub fn attempt(&self) -> ReconnectAttempt {
        self.state
            .lock()
            .expect("ReconnectPolicy mutex poisoned")
            .attempt
            .clone()
    }
}

impl Drop for ReconnectPolicy {
    fn drop(&mut self) {
        self.cancel();
    }
}
