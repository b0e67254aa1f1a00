use super::{cancelled, is_cancelled, next_wake, CancelToken};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::mem;
use std::time::Instant;
use tokio::sync::Notify;

/// A counting semaphore that can be waited on from threads and from tasks.
///
/// Blocking waiters park on a condition variable and async waiters on a
/// wait-list. A release wakes both kinds.
pub struct Semaphore {
    permits: Mutex<usize>,
    max: usize,
    cond: Condvar,
    released: Notify,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available())
            .field("max", &self.max)
            .finish()
    }
}

impl Semaphore {
    /// Create a semaphore holding `permits` permits, which is also the most it
    /// can ever hold.
    pub fn new(permits: usize) -> Self {
        Semaphore {
            permits: Mutex::new(permits),
            max: permits,
            cond: Condvar::new(),
            released: Notify::new(),
        }
    }

    /// How many permits can be acquired right now.
    pub fn available(&self) -> usize {
        *self.permits.lock()
    }

    /// Take a permit if one is free. Never waits.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Take a permit, blocking the thread for as long as it takes.
    pub fn acquire(&self) {
        let acquired = self.wait_blocking(None, None);
        debug_assert!(acquired);
    }

    /// Take a permit, blocking the thread until `deadline` at most. Returns
    /// false if the deadline passed or `cancel` fired first.
    pub fn acquire_until(&self, deadline: Instant, cancel: Option<&CancelToken>) -> bool {
        self.wait_blocking(Some(deadline), cancel)
    }

    pub(crate) fn wait_blocking(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&CancelToken>,
    ) -> bool {
        let mut permits = self.permits.lock();
        loop {
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            if is_cancelled(cancel) {
                return false;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            match next_wake(deadline, cancel) {
                Some(at) => {
                    self.cond.wait_until(&mut permits, at);
                }
                None => self.cond.wait(&mut permits),
            }
        }
    }

    /// Take a permit, suspending the task until `deadline` at most. Returns
    /// false if the deadline passed or `cancel` fired first.
    pub async fn acquire_async(&self, deadline: Instant, cancel: Option<&CancelToken>) -> bool {
        loop {
            if is_cancelled(cancel) {
                return false;
            }
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register on the wait-list before the check so that a release
            // landing in between still wakes us.
            notified.as_mut().enable();
            if self.try_acquire() {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancelled(cancel) => return false,
                _ = tokio::time::sleep_until(deadline.into()) => return self.try_acquire(),
            }
        }
    }

    /// Like [Self::wait_blocking], with the permit returned on drop.
    pub(crate) fn permit_blocking(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&CancelToken>,
    ) -> Option<Permit<'_>> {
        self.wait_blocking(deadline, cancel)
            .then(|| Permit { sem: self })
    }

    /// Like [Self::acquire_async], with the permit returned on drop. A permit
    /// taken by a future that is later dropped is returned with it.
    pub(crate) async fn permit_async(
        &self,
        deadline: Instant,
        cancel: Option<&CancelToken>,
    ) -> Option<Permit<'_>> {
        self.acquire_async(deadline, cancel)
            .await
            .then(|| Permit { sem: self })
    }

    /// Return a permit.
    pub fn release(&self) {
        {
            let mut permits = self.permits.lock();
            debug_assert!(*permits < self.max, "semaphore released more than acquired");
            *permits += 1;
        }
        self.cond.notify_one();
        self.released.notify_waiters();
    }
}

/// A permit of a [Semaphore], returned when dropped.
#[must_use = "dropping the permit returns it immediately"]
pub(crate) struct Permit<'a> {
    sem: &'a Semaphore,
}

impl Permit<'_> {
    /// Keep the permit taken. Whoever owns it now must call
    /// [Semaphore::release].
    pub(crate) fn keep(self) {
        mem::forget(self);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

#[cfg(test)]
mod tests {
    use super::Semaphore;
    use crate::lock::CancelToken;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_semaphore_try_acquire() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        assert_eq!(sem.available(), 0);
        sem.release();
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire());
    }

    #[test]
    fn test_semaphore_deadline() {
        let sem = Semaphore::new(1);
        sem.acquire();
        let start = Instant::now();
        assert!(!sem.acquire_until(start + Duration::from_millis(20), None));
        assert!(start.elapsed() >= Duration::from_millis(20));
        sem.release();
        assert!(sem.acquire_until(Instant::now() + Duration::from_millis(20), None));
    }

    #[test]
    fn test_semaphore_cancel_blocking() {
        let sem = Semaphore::new(1);
        sem.acquire();
        let token = CancelToken::new();
        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                sem.acquire_until(Instant::now() + Duration::from_secs(30), Some(&token))
            });
            thread::sleep(Duration::from_millis(10));
            token.cancel();
            assert!(!waiter.join().unwrap());
        });
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_semaphore_mutual_exclusion() {
        let sem = Semaphore::new(1);
        let inside = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        sem.acquire();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        sem.release();
                    }
                });
            }
        });
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn test_semaphore_async_wakes_on_release() {
        let sem = Arc::new(Semaphore::new(1));
        assert!(sem.try_acquire());
        let waiter = {
            let sem = sem.clone();
            tokio::spawn(async move {
                sem.acquire_async(Instant::now() + Duration::from_secs(30), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        sem.release();
        assert!(waiter.await.unwrap());
        assert_eq!(sem.available(), 0);
    }

    #[tokio::test]
    async fn test_semaphore_async_timeout_and_cancel() {
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire());
        assert!(
            !sem.acquire_async(Instant::now() + Duration::from_millis(10), None)
                .await
        );

        let token = CancelToken::new();
        token.cancel();
        sem.release();
        // A cancelled wait never takes the permit, even when one is free.
        assert!(
            !sem.acquire_async(Instant::now() + Duration::from_secs(30), Some(&token))
                .await
        );
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn test_semaphore_permit_returned_on_drop() {
        let sem = Semaphore::new(1);
        let deadline = Instant::now() + Duration::from_millis(10);
        let permit = sem.permit_async(deadline, None).await.expect("permit is free");
        assert_eq!(sem.available(), 0);
        assert!(sem.permit_blocking(Some(deadline), None).is_none());
        drop(permit);
        assert_eq!(sem.available(), 1);

        sem.permit_blocking(None, None).expect("permit is free").keep();
        assert_eq!(sem.available(), 0);
        sem.release();
        assert_eq!(sem.available(), 1);
    }
}
