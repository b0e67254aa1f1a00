//! Reader-writer locks for the concurrent tree.
//!
//! Two locks live here. Both allow any number of readers OR a single writer, and
//! neither is fair: a steady stream of readers can hold a writer off indefinitely.
//! Callers that need fairness must queue in front of the lock themselves.
//!
//! * [BlockingRwLock] guards [ConcurrentRbTree](crate::tree::ConcurrentRbTree). Its
//!   plain entry points block the thread until access is granted, with no timeout.
//!   It also offers non-blocking, bounded and async entry. A thread may re-enter
//!   it for reading; write re-entry and read to write upgrades from the same
//!   thread panic rather than deadlock. Guards taken through the async entry
//!   points belong to no thread and are not checked.
//! * [AsyncRwLock] is a standalone lock assembled from two binary [Semaphore]s: a
//!   writer slot and a reader count slot. The first reader in takes the writer slot
//!   on behalf of all readers and the last reader out gives it back.
//!
//! All bounded waits take a [WaitOptions] describing how long a single attempt may
//! wait and how many attempts are made, and an optional [CancelToken]. Failure to
//! acquire is reported as `None`, never as a panic.
//!
//! Async waits park the task on a wait-list that is woken by the release of the lock,
//! so a waiting task does not occupy a worker thread and does not poll.

mod blocking;
mod cancel;
mod rwsem;
mod semaphore;

pub use self::blocking::{Access, BlockingRwLock, LockGuard};
pub use self::cancel::CancelToken;
pub use self::rwsem::{AsyncRwLock, RwSemReadGuard, RwSemWriteGuard};
pub use self::semaphore::Semaphore;

use crate::utils::deadline_after;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How long a single lock attempt waits before it is retried by default.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// How many attempts a bounded lock wait makes by default.
pub const DEFAULT_WAIT_RETRIES: usize = 5;

// A blocking wait that can be cancelled re-checks its token this often, as a
// token can not wake a parked thread.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(5);

/// Bounds on how long a lock wait may take.
///
/// Each attempt waits up to `timeout`, and up to `retries` attempts are made
/// before giving up, so the worst case wait is `timeout * retries`. At least
/// one attempt is always made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitOptions {
    timeout: Duration,
    retries: usize,
}

impl Default for WaitOptions {
    fn default() -> Self {
        WaitOptions {
            timeout: DEFAULT_WAIT_TIMEOUT,
            retries: DEFAULT_WAIT_RETRIES,
        }
    }
}

impl WaitOptions {
    /// Create options with a per attempt `timeout` and a number of attempts.
    pub fn new(timeout: Duration, retries: usize) -> Self {
        WaitOptions {
            timeout,
            retries: retries.max(1),
        }
    }

    /// Set how long a single attempt may wait.
    #[must_use]
    pub fn set_timeout(self, timeout: Duration) -> Self {
        WaitOptions { timeout, ..self }
    }

    /// Set how many attempts are made.
    #[must_use]
    pub fn set_retries(self, retries: usize) -> Self {
        WaitOptions {
            retries: retries.max(1),
            ..self
        }
    }

    /// How long a single attempt may wait.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// How many attempts are made.
    pub fn retries(&self) -> usize {
        self.retries
    }

    pub(crate) fn with_timeout(self, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => self.set_timeout(timeout),
            None => self,
        }
    }
}

fn is_cancelled(cancel: Option<&CancelToken>) -> bool {
    cancel.is_some_and(CancelToken::is_cancelled)
}

/// When a blocking waiter should next wake up to re-check its deadline and
/// cancellation. `None` means wait until notified.
fn next_wake(deadline: Option<Instant>, cancel: Option<&CancelToken>) -> Option<Instant> {
    match (deadline, cancel) {
        (None, None) => None,
        (Some(deadline), None) => Some(deadline),
        (deadline, Some(_)) => {
            let check = Instant::now() + CANCEL_CHECK_INTERVAL;
            Some(deadline.map_or(check, |d| d.min(check)))
        }
    }
}

/// Resolves once `cancel` fires, or never when there is no token.
async fn cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

/// Run `attempt` until it succeeds, the attempts run out, or `cancel` fires.
fn retry_blocking<F>(opts: WaitOptions, cancel: Option<&CancelToken>, mut attempt: F) -> bool
where
    F: FnMut(Instant) -> bool,
{
    for n in 0..opts.retries() {
        if is_cancelled(cancel) {
            debug!("lock wait cancelled");
            return false;
        }
        if attempt(deadline_after(opts.timeout())) {
            return true;
        }
        trace!(attempt = n + 1, of = opts.retries(), "lock wait timed out");
    }
    debug!(retries = opts.retries(), timeout = ?opts.timeout(), "lock wait gave up");
    false
}

async fn retry_async<F, Fut>(opts: WaitOptions, cancel: Option<&CancelToken>, mut attempt: F) -> bool
where
    F: FnMut(Instant) -> Fut,
    Fut: Future<Output = bool>,
{
    for n in 0..opts.retries() {
        if is_cancelled(cancel) {
            debug!("async lock wait cancelled");
            return false;
        }
        if attempt(deadline_after(opts.timeout())).await {
            return true;
        }
        trace!(attempt = n + 1, of = opts.retries(), "async lock wait timed out");
    }
    debug!(retries = opts.retries(), timeout = ?opts.timeout(), "async lock wait gave up");
    false
}

#[cfg(test)]
mod tests {
    use super::{next_wake, CancelToken, WaitOptions, CANCEL_CHECK_INTERVAL};
    use std::time::{Duration, Instant};

    #[test]
    fn test_wait_options_default() {
        let opts = WaitOptions::default();
        assert_eq!(opts.timeout(), Duration::from_secs(30));
        assert_eq!(opts.retries(), 5);
    }

    #[test]
    fn test_wait_options_clamp_retries() {
        let opts = WaitOptions::new(Duration::from_millis(1), 0);
        assert_eq!(opts.retries(), 1);
        let opts = opts.set_retries(0).set_timeout(Duration::from_millis(7));
        assert_eq!(opts.retries(), 1);
        assert_eq!(opts.timeout(), Duration::from_millis(7));
        assert_eq!(
            opts.with_timeout(None).timeout(),
            Duration::from_millis(7)
        );
        assert_eq!(
            opts.with_timeout(Some(Duration::from_secs(2))).timeout(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_next_wake() {
        assert_eq!(next_wake(None, None), None);

        let far = Instant::now() + Duration::from_secs(60);
        assert_eq!(next_wake(Some(far), None), Some(far));

        // A token shortens the sleep so the flag is noticed.
        let token = CancelToken::new();
        let before = Instant::now();
        let wake = next_wake(Some(far), Some(&token)).unwrap();
        assert!(wake < far);
        assert!(wake <= Instant::now() + CANCEL_CHECK_INTERVAL);
        assert!(wake >= before);

        let near = Instant::now();
        assert_eq!(next_wake(Some(near), Some(&token)), Some(near));
    }
}
