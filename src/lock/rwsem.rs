use super::{retry_async, retry_blocking, CancelToken, Semaphore, WaitOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// A reader-writer lock built from two binary semaphores.
///
/// The writer slot is held either by one writer or collectively by all current
/// readers. The counter slot serialises changes to the reader count, and the
/// first reader in waits for the writer slot while holding it. Readers that arrive
/// while a writer is active queue behind that first reader.
///
/// Bounded entry follows the lock's [WaitOptions] unless a call overrides the
/// per attempt timeout.
#[derive(Debug)]
pub struct AsyncRwLock {
    writer: Semaphore,
    counter: Semaphore,
    // Only mutated while the counter slot is held.
    readers: AtomicUsize,
    opts: WaitOptions,
}

impl Default for AsyncRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncRwLock {
    /// Create an unlocked lock with the default wait options.
    pub fn new() -> Self {
        Self::with_options(WaitOptions::default())
    }

    /// Create an unlocked lock that bounds its waits by `opts`.
    pub fn with_options(opts: WaitOptions) -> Self {
        AsyncRwLock {
            writer: Semaphore::new(1),
            counter: Semaphore::new(1),
            readers: AtomicUsize::new(0),
            opts,
        }
    }

    /// The wait options bounded entry uses.
    pub fn wait_options(&self) -> WaitOptions {
        self.opts
    }

    /// How many readers hold the lock.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Is the lock held by anyone.
    pub fn is_locked(&self) -> bool {
        self.writer.available() == 0
    }

    /// Enter for reading, blocking the thread until access is granted.
    pub fn enter_read(&self) -> RwSemReadGuard<'_> {
        let entered = self.read_blocking(None, None);
        debug_assert!(entered);
        RwSemReadGuard { lock: self }
    }

    /// Enter for writing, blocking the thread until access is granted.
    pub fn enter_write(&self) -> RwSemWriteGuard<'_> {
        self.writer.acquire();
        RwSemWriteGuard { lock: self }
    }

    /// Enter for reading, making a bounded number of timed attempts. Returns
    /// `None` if every attempt timed out or `cancel` fired.
    pub fn try_enter_read(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Option<RwSemReadGuard<'_>> {
        let opts = self.opts.with_timeout(timeout);
        retry_blocking(opts, cancel, |deadline| {
            self.read_blocking(Some(deadline), cancel)
        })
        .then(|| RwSemReadGuard { lock: self })
    }

    /// Enter for writing, making a bounded number of timed attempts. Returns
    /// `None` if every attempt timed out or `cancel` fired.
    pub fn try_enter_write(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Option<RwSemWriteGuard<'_>> {
        let opts = self.opts.with_timeout(timeout);
        retry_blocking(opts, cancel, |deadline| {
            self.writer.wait_blocking(Some(deadline), cancel)
        })
        .then(|| RwSemWriteGuard { lock: self })
    }

    /// Async form of [Self::try_enter_read]. The task is suspended, not the
    /// thread, while it waits.
    pub async fn enter_read_async(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Option<RwSemReadGuard<'_>> {
        let opts = self.opts.with_timeout(timeout);
        retry_async(opts, cancel, |deadline| self.read_async(deadline, cancel))
            .await
            .then(|| RwSemReadGuard { lock: self })
    }

    /// Async form of [Self::try_enter_write].
    pub async fn enter_write_async(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancelToken>,
    ) -> Option<RwSemWriteGuard<'_>> {
        let opts = self.opts.with_timeout(timeout);
        retry_async(opts, cancel, |deadline| {
            self.writer.acquire_async(deadline, cancel)
        })
        .await
        .then(|| RwSemWriteGuard { lock: self })
    }

    fn read_blocking(&self, deadline: Option<Instant>, cancel: Option<&CancelToken>) -> bool {
        let Some(_counter) = self.counter.permit_blocking(deadline, cancel) else {
            return false;
        };
        if self.readers.load(Ordering::Relaxed) == 0 {
            match self.writer.permit_blocking(deadline, cancel) {
                // Held by the readers from here on.
                Some(slot) => slot.keep(),
                None => return false,
            }
        }
        self.readers.fetch_add(1, Ordering::AcqRel);
        true
    }

    // The counter slot stays held across the wait for the writer slot, and is
    // given back even if this future is dropped during that wait.
    async fn read_async(&self, deadline: Instant, cancel: Option<&CancelToken>) -> bool {
        let Some(_counter) = self.counter.permit_async(deadline, cancel).await else {
            return false;
        };
        if self.readers.load(Ordering::Relaxed) == 0 {
            match self.writer.permit_async(deadline, cancel).await {
                Some(slot) => slot.keep(),
                None => return false,
            }
        }
        self.readers.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn exit_read(&self) {
        // The counter slot is only held for long while no reader is inside, so
        // a departing reader never waits behind a writer.
        let counter = self.counter.permit_blocking(None, None);
        debug_assert!(counter.is_some());
        let prev = self.readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        if prev == 1 {
            trace!("last reader out, releasing writer slot");
            self.writer.release();
        }
    }

    fn exit_write(&self) {
        self.writer.release();
    }
}

/// Shared access to an [AsyncRwLock], released on drop.
#[derive(Debug)]
#[must_use = "dropping the guard releases the lock immediately"]
pub struct RwSemReadGuard<'a> {
    lock: &'a AsyncRwLock,
}

impl RwSemReadGuard<'_> {
    /// Release the lock now.
    pub fn exit(self) {}
}

impl Drop for RwSemReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit_read();
    }
}

/// Exclusive access to an [AsyncRwLock], released on drop.
#[derive(Debug)]
#[must_use = "dropping the guard releases the lock immediately"]
pub struct RwSemWriteGuard<'a> {
    lock: &'a AsyncRwLock,
}

impl RwSemWriteGuard<'_> {
    /// Release the lock now.
    pub fn exit(self) {}
}

impl Drop for RwSemWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit_write();
    }
}
