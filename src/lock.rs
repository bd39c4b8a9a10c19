//! Bounded lock acquisition for structural changes.
//!
//! Attach, detach, inherit and rename all need a strong lock on a table that
//! application traffic is using. Each attempt waits at most `lock_timeout` for
//! it; on `lock_not_available` the attempt is repeated after `backoff`, up to
//! `max_attempts` times. Worst-case stall per change is therefore bounded by
//! `max_attempts * (lock_timeout + backoff)`.

use crate::executor::ExecError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Retry budget for one structural change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetryPolicy {
    /// `SET LOCAL lock_timeout` for each attempt
    pub lock_timeout: Duration,
    pub max_attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(1),
            max_attempts: 5,
            backoff: Duration::from_secs(30),
        }
    }
}

/// Shared cancellation flag with an optional wall-clock deadline.
///
/// Clones observe the same flag, so a signal handler or supervisor can stop a
/// maintenance run between retries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that expires `budget` from now.
    pub fn with_deadline(budget: Duration) -> Self {
        Self {
            cancelled: Arc::default(),
            deadline: Instant::now().checked_add(budget),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Result of a lock-guarded change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Applied,
    /// Every attempt hit `lock_timeout`, or the caller cancelled between attempts.
    LockTimeoutExhausted { attempts: u32 },
}

impl AttachOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, AttachOutcome::Applied)
    }
}

/// Run `attempt` until it succeeds, fails with something other than a lock
/// timeout, or the retry budget is spent.
///
/// # Errors
///
/// Returns the first error that is not `ExecError::LockNotAvailable`.
pub fn with_lock_retry<F>(
    policy: &LockRetryPolicy,
    cancel: &CancelToken,
    operation: &'static str,
    mut attempt: F,
) -> Result<AttachOutcome, ExecError>
where
    F: FnMut() -> Result<(), ExecError>,
{
    let mut attempts = 0;
    while attempts < policy.max_attempts.max(1) {
        if cancel.is_cancelled() {
            log::warn!("{operation}: cancelled after {attempts} attempt(s)");
            break;
        }
        attempts += 1;
        match attempt() {
            Ok(()) => return Ok(AttachOutcome::Applied),
            Err(e) if e.is_lock_not_available() => {
                log::warn!(
                    "{operation}: lock not available (attempt {attempts}/{}): {e}",
                    policy.max_attempts
                );
                #[cfg(feature = "metrics")]
                METRICS.record_lock_retry(operation);
                if attempts < policy.max_attempts {
                    pause(policy.backoff, cancel);
                }
            }
            Err(e) => return Err(e),
        }
    }

    log::warn!("{operation}: giving up after {attempts} attempt(s)");
    #[cfg(feature = "metrics")]
    METRICS.record_lock_exhausted(operation);
    Ok(AttachOutcome::LockTimeoutExhausted { attempts })
}

fn pause(backoff: Duration, cancel: &CancelToken) {
    let wait = cancel.remaining().map_or(backoff, |left| left.min(backoff));
    if !wait.is_zero() {
        // yields the coroutine when called from one, blocks the thread otherwise
        may::coroutine::sleep(wait);
    }
}
