use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::state::{ConnectionState, ConnectionStateMachine};

/// Fixed retry delays in milliseconds, indexed by attempt
pub const DEFAULT_RECONNECT_SCHEDULE_MS: [u64; 5] = [500, 1000, 2000, 3000, 5000];

/// Attempts before the manager gives up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Fixed (non-exponential) retry schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    schedule_ms: Vec<u64>,
    max_attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy; an empty schedule falls back to the default one
    pub fn new(schedule_ms: Vec<u64>, max_attempts: u32) -> Self {
        let schedule_ms = if schedule_ms.is_empty() {
            DEFAULT_RECONNECT_SCHEDULE_MS.to_vec()
        } else {
            schedule_ms
        };
        Self {
            schedule_ms,
            max_attempts,
        }
    }

    /// Delay before 1-indexed attempt `attempt`, clamped to the last slot
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.schedule_ms.len() - 1);
        Duration::from_millis(self.schedule_ms[index])
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn schedule_ms(&self) -> &[u64] {
        &self.schedule_ms
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_SCHEDULE_MS.to_vec(), DEFAULT_MAX_ATTEMPTS)
    }
}

/// Errors that know whether another attempt is worthwhile
pub trait RetryableError: Display {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for String {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// How a reconnection run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// `connect_fn` succeeded on attempt `attempts`
    Connected { attempts: u32 },
    /// The attempt cap was reached; the machine is in `error`
    Exhausted { attempts: u32 },
    /// A non-retryable failure stopped the run; the machine is in `error`
    Aborted { attempts: u32, reason: String },
    /// `cancel()` or `reset()` interrupted the run
    Cancelled,
    /// Another run is already in progress for this manager
    AlreadyRunning,
}

impl ReconnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Runs the fixed reconnection schedule against a state machine
///
/// At most one run is active per manager, so `connect_fn` is never invoked
/// concurrently for the same client.
pub struct ReconnectionManager {
    policy: ReconnectPolicy,
    attempts: AtomicU32,
    generation: AtomicU64,
    running: AtomicBool,
    cancel_notify: Notify,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ReconnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            running: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Attempts made since the last success, cancel or reset
    pub fn attempt_count(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Retry `connect_fn` on the fixed schedule until it succeeds
    ///
    /// Each attempt waits for its schedule slot, increments the counter,
    /// moves `machine` to `connecting` and awaits `connect_fn(attempt)`.
    /// Success zeroes the counter. A failed attempt leaves the machine in
    /// `error` so the next attempt can re-enter `connecting`.
    pub async fn attempt_reconnection<F, Fut, E>(
        &self,
        machine: &ConnectionStateMachine,
        mut connect_fn: F,
    ) -> ReconnectOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: RetryableError,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Reconnection already in progress");
            return ReconnectOutcome::AlreadyRunning;
        }
        let _guard = RunningGuard(&self.running);
        let generation = self.generation.load(Ordering::SeqCst);
        let max_attempts = self.policy.max_attempts();

        loop {
            let next_attempt = self.attempt_count() + 1;
            if next_attempt > max_attempts {
                Self::enter_error(machine);
                return ReconnectOutcome::Exhausted {
                    attempts: self.attempt_count(),
                };
            }

            let delay = self.policy.delay_for_attempt(next_attempt);
            let cancelled = self.cancel_notify.notified();
            tokio::pin!(cancelled);
            cancelled.as_mut().enable();

            if self.generation.load(Ordering::SeqCst) != generation {
                return ReconnectOutcome::Cancelled;
            }

            tracing::info!(
                attempt = next_attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnection attempt"
            );

            tokio::select! {
                _ = &mut cancelled => {
                    tracing::info!("Reconnection cancelled while waiting");
                    return ReconnectOutcome::Cancelled;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if !machine.transition(ConnectionState::Connecting)
                && machine.state() != ConnectionState::Connecting
            {
                tracing::warn!(
                    attempt,
                    state = %machine.state(),
                    "Machine cannot enter connecting, stopping reconnection"
                );
                return ReconnectOutcome::Cancelled;
            }

            let result = tokio::select! {
                _ = &mut cancelled => {
                    tracing::info!(attempt, "Reconnection cancelled during attempt");
                    return ReconnectOutcome::Cancelled;
                }
                result = connect_fn(attempt) => result,
            };

            match result {
                Ok(()) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    tracing::info!(attempt, "Reconnected");
                    return ReconnectOutcome::Connected { attempts: attempt };
                }
                Err(e) if !e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "Reconnection aborted by non-retryable error");
                    Self::enter_error(machine);
                    return ReconnectOutcome::Aborted {
                        attempts: attempt,
                        reason: e.to_string(),
                    };
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts, error = %e, "Reconnection attempt failed");
                    Self::enter_error(machine);
                    if attempt >= max_attempts {
                        tracing::error!(attempts = attempt, "Reconnection attempts exhausted");
                        return ReconnectOutcome::Exhausted { attempts: attempt };
                    }
                }
            }
        }
    }

    /// Stop any pending attempt and zero the counter
    pub fn cancel(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    /// Same as [`cancel`](Self::cancel)
    pub fn reset(&self) {
        self.cancel();
    }

    fn enter_error(machine: &ConnectionStateMachine) {
        if machine.state() != ConnectionState::Error {
            machine.transition(ConnectionState::Error);
        }
    }
}

impl Default for ReconnectionManager {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}
