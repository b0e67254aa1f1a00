use super::{cancelled, is_cancelled, next_wake, retry_async, retry_blocking};
use super::{CancelToken, WaitOptions};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::trace;

/// The kind of access a [LockGuard] grants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Shared with other readers.
    Read,
    /// Exclusive.
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Holder {
    Thread(ThreadId),
    // An async task may move between threads, so it is never considered
    // for re-entry. A task that re-enters waits on itself until it times out,
    // or forever through the plain blocking entry points.
    Task,
}

impl Holder {
    fn current_thread() -> Self {
        Holder::Thread(thread::current().id())
    }
}

#[derive(Debug, Default)]
struct LockState {
    writer: Option<Holder>,
    readers: usize,
    reader_threads: HashMap<ThreadId, usize>,
}

impl LockState {
    fn check_reentry(&self, access: Access, tid: ThreadId) {
        if self.writer == Some(Holder::Thread(tid)) {
            panic!(
                "{:?} access requested by a thread that already holds the write lock; \
                 write locks are not re-entrant",
                access
            );
        }
        if access == Access::Write && self.reader_threads.contains_key(&tid) {
            panic!(
                "write access requested by a thread that holds a read lock; \
                 read locks can not be upgraded"
            );
        }
    }

    fn try_grant(&mut self, access: Access, holder: Holder) -> bool {
        if let Holder::Thread(tid) = holder {
            self.check_reentry(access, tid);
        }
        match access {
            Access::Read if self.writer.is_none() => {
                self.readers += 1;
                if let Holder::Thread(tid) = holder {
                    *self.reader_threads.entry(tid).or_insert(0) += 1;
                }
                true
            }
            Access::Write if self.writer.is_none() && self.readers == 0 => {
                self.writer = Some(holder);
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, access: Access, holder: Holder) {
        match access {
            Access::Read => {
                debug_assert!(self.readers > 0, "read lock released but not held");
                self.readers -= 1;
                if let Holder::Thread(tid) = holder {
                    if let Some(count) = self.reader_threads.get_mut(&tid) {
                        *count -= 1;
                        if *count == 0 {
                            self.reader_threads.remove(&tid);
                        }
                    }
                }
            }
            Access::Write => {
                debug_assert_eq!(self.writer, Some(holder), "write lock released by non holder");
                self.writer = None;
            }
        }
    }
}

/// A reader-writer lock that blocks threads and suspends tasks.
///
/// Any number of readers or one writer may hold the lock. The thread that holds
/// a read lock may take further read locks. A thread that asks for any access
/// while holding the write lock, or for write access while holding a read lock,
/// panics; such a request can never be granted and would otherwise hang forever.
///
/// Only locks entered by a thread are checked this way. A guard returned by
/// [enter_read_async](Self::enter_read_async) or
/// [enter_write_async](Self::enter_write_async) is held by the task, not by the
/// thread it happens to run on. A task that asks for the lock again while its
/// guard is alive is not detected: bounded entry gives up after its attempts
/// and blocking entry, such as [ConcurrentRbTree::search](crate::ConcurrentRbTree::search)
/// called from that task, deadlocks.
///
/// The lock is not fair. Writers may starve under a constant stream of readers.
pub struct BlockingRwLock {
    state: Mutex<LockState>,
    cond: Condvar,
    released: Notify,
}

impl fmt::Debug for BlockingRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BlockingRwLock")
            .field("readers", &state.readers)
            .field("write_locked", &state.writer.is_some())
            .finish()
    }
}

impl Default for BlockingRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockingRwLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        BlockingRwLock {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            released: Notify::new(),
        }
    }

    /// Enter for reading, blocking the thread for as long as it takes.
    pub fn enter_read(&self) -> LockGuard<'_> {
        self.enter_blocking(Access::Read)
    }

    /// Enter for writing, blocking the thread for as long as it takes.
    pub fn enter_write(&self) -> LockGuard<'_> {
        self.enter_blocking(Access::Write)
    }

    /// Enter for reading only if that is possible without waiting.
    pub fn try_enter_read(&self) -> Option<LockGuard<'_>> {
        self.try_enter(Access::Read, Holder::current_thread())
    }

    /// Enter for writing only if that is possible without waiting.
    pub fn try_enter_write(&self) -> Option<LockGuard<'_>> {
        self.try_enter(Access::Write, Holder::current_thread())
    }

    /// Enter for reading, blocking for at most the attempts `opts` allows.
    /// Returns `None` if they all timed out or `cancel` fired.
    pub fn enter_read_timeout(
        &self,
        opts: WaitOptions,
        cancel: Option<&CancelToken>,
    ) -> Option<LockGuard<'_>> {
        self.enter_bounded(Access::Read, opts, cancel)
    }

    /// Enter for writing, blocking for at most the attempts `opts` allows.
    /// Returns `None` if they all timed out or `cancel` fired.
    pub fn enter_write_timeout(
        &self,
        opts: WaitOptions,
        cancel: Option<&CancelToken>,
    ) -> Option<LockGuard<'_>> {
        self.enter_bounded(Access::Write, opts, cancel)
    }

    /// Enter for reading from a task. The task is suspended while it waits.
    pub async fn enter_read_async(
        &self,
        opts: WaitOptions,
        cancel: Option<&CancelToken>,
    ) -> Option<LockGuard<'_>> {
        self.enter_async(Access::Read, opts, cancel).await
    }

    /// Enter for writing from a task. The task is suspended while it waits.
    pub async fn enter_write_async(
        &self,
        opts: WaitOptions,
        cancel: Option<&CancelToken>,
    ) -> Option<LockGuard<'_>> {
        self.enter_async(Access::Write, opts, cancel).await
    }

    /// How many read locks are held.
    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }

    /// Is the write lock held.
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// Is the lock held by anyone.
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.writer.is_some() || state.readers > 0
    }

    /// The access the calling thread holds, if any.
    pub fn held_by_current_thread(&self) -> Option<Access> {
        let tid = thread::current().id();
        let state = self.state.lock();
        if state.writer == Some(Holder::Thread(tid)) {
            Some(Access::Write)
        } else if state.reader_threads.contains_key(&tid) {
            Some(Access::Read)
        } else {
            None
        }
    }

    fn guard(&self, access: Access, holder: Holder) -> LockGuard<'_> {
        trace!(?access, ?holder, "lock entered");
        LockGuard {
            lock: self,
            access,
            holder,
            _not_send: PhantomData,
        }
    }

    fn try_grant(&self, access: Access, holder: Holder) -> bool {
        self.state.lock().try_grant(access, holder)
    }

    fn try_enter(&self, access: Access, holder: Holder) -> Option<LockGuard<'_>> {
        self.try_grant(access, holder)
            .then(|| self.guard(access, holder))
    }

    fn enter_blocking(&self, access: Access) -> LockGuard<'_> {
        let holder = Holder::current_thread();
        let entered = self.wait_blocking(access, holder, None, None);
        debug_assert!(entered);
        self.guard(access, holder)
    }

    fn enter_bounded(
        &self,
        access: Access,
        opts: WaitOptions,
        cancel: Option<&CancelToken>,
    ) -> Option<LockGuard<'_>> {
        let holder = Holder::current_thread();
        retry_blocking(opts, cancel, |deadline| {
            self.wait_blocking(access, holder, Some(deadline), cancel)
        })
        .then(|| self.guard(access, holder))
    }

    async fn enter_async(
        &self,
        access: Access,
        opts: WaitOptions,
        cancel: Option<&CancelToken>,
    ) -> Option<LockGuard<'_>> {
        let entered = retry_async(opts, cancel, |deadline| {
            self.wait_async(access, deadline, cancel)
        })
        .await;
        entered.then(|| self.guard(access, Holder::Task))
    }

    fn wait_blocking(
        &self,
        access: Access,
        holder: Holder,
        deadline: Option<Instant>,
        cancel: Option<&CancelToken>,
    ) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.try_grant(access, holder) {
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
                    self.cond.wait_until(&mut state, at);
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    async fn wait_async(
        &self,
        access: Access,
        deadline: Instant,
        cancel: Option<&CancelToken>,
    ) -> bool {
        loop {
            if is_cancelled(cancel) {
                return false;
            }
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_grant(access, Holder::Task) {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancelled(cancel) => return false,
                _ = tokio::time::sleep_until(deadline.into()) => {
                    return self.try_grant(access, Holder::Task);
                }
            }
        }
    }

    fn release(&self, access: Access, holder: Holder) {
        self.state.lock().release(access, holder);
        trace!(?access, ?holder, "lock released");
        self.cond.notify_all();
        self.released.notify_waiters();
    }
}

/// Proof of access to a [BlockingRwLock]. The lock is released when the guard
/// is dropped or [exited](LockGuard::exit).
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockGuard<'a> {
    lock: &'a BlockingRwLock,
    access: Access,
    holder: Holder,
    // Release must happen on the thread that entered, or the re-entry
    // bookkeeping would be wrong.
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("access", &self.access)
            .finish()
    }
}

impl LockGuard<'_> {
    /// The access this guard grants.
    pub fn access(&self) -> Access {
        self.access
    }

    /// Release the lock now.
    pub fn exit(self) {}
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.access, self.holder);
    }
}

#[cfg(test)]
mod tests {
    use super::{Access, BlockingRwLock};
    use crate::lock::{CancelToken, WaitOptions};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    fn quick() -> WaitOptions {
        WaitOptions::new(Duration::from_millis(10), 3)
    }

    #[test]
    fn test_blocking_read_share() {
        let lock = BlockingRwLock::new();
        let a = lock.enter_read();
        assert_eq!(a.access(), Access::Read);
        // Same thread read re-entry.
        let b = lock.enter_read();
        assert_eq!(lock.readers(), 2);
        assert!(lock.try_enter_write().is_none());
        assert_eq!(lock.held_by_current_thread(), Some(Access::Read));
        drop(a);
        assert!(lock.try_enter_write().is_none());
        b.exit();
        assert!(!lock.is_locked());
        assert_eq!(lock.held_by_current_thread(), None);
        let w = lock.try_enter_write().expect("lock is free");
        assert_eq!(w.access(), Access::Write);
        assert!(lock.is_write_locked());
        assert_eq!(lock.held_by_current_thread(), Some(Access::Write));
    }

    #[test]
    #[should_panic(expected = "not re-entrant")]
    fn test_blocking_write_reentry_panics() {
        let lock = BlockingRwLock::new();
        let _w = lock.enter_write();
        let _again = lock.enter_write();
    }

    #[test]
    #[should_panic(expected = "not re-entrant")]
    fn test_blocking_read_under_write_panics() {
        let lock = BlockingRwLock::new();
        let _w = lock.enter_write();
        let _r = lock.enter_read();
    }

    #[test]
    #[should_panic(expected = "can not be upgraded")]
    fn test_blocking_upgrade_panics() {
        let lock = BlockingRwLock::new();
        let _r = lock.enter_read();
        let _w = lock.enter_write();
    }

    #[test]
    fn test_blocking_writer_waits_for_readers() {
        let lock = BlockingRwLock::new();
        let reader_done = AtomicBool::new(false);
        let r = lock.enter_read();
        thread::scope(|scope| {
            let writer = scope.spawn(|| {
                let _w = lock.enter_write();
                assert!(reader_done.load(Ordering::SeqCst));
            });
            thread::sleep(Duration::from_millis(20));
            reader_done.store(true, Ordering::SeqCst);
            drop(r);
            writer.join().unwrap();
        });
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_blocking_readers_progress_together() {
        let lock = BlockingRwLock::new();
        let barrier = Barrier::new(8);
        let peak = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let _r = lock.enter_read();
                    barrier.wait();
                    peak.fetch_max(lock.readers(), Ordering::SeqCst);
                    barrier.wait();
                });
            }
        });
        assert_eq!(peak.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_blocking_timeout_gives_up() {
        let lock = BlockingRwLock::new();
        thread::scope(|scope| {
            let _w = lock.enter_write();
            let waiter = scope.spawn(|| {
                let start = Instant::now();
                let got = lock.enter_read_timeout(quick(), None).is_some();
                (got, start.elapsed())
            });
            let (got, waited) = waiter.join().unwrap();
            assert!(!got);
            assert!(waited >= Duration::from_millis(30));
        });
        assert!(lock.enter_write_timeout(quick(), None).is_some());
    }

    #[test]
    fn test_blocking_cancel() {
        let lock = BlockingRwLock::new();
        let token = CancelToken::new();
        thread::scope(|scope| {
            let _r = lock.enter_read();
            let waiter = scope.spawn(|| {
                lock.enter_write_timeout(WaitOptions::default(), Some(&token))
                    .is_some()
            });
            thread::sleep(Duration::from_millis(10));
            token.cancel();
            assert!(!waiter.join().unwrap());
        });
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_blocking_async_waits_for_release() {
        let lock = Arc::new(BlockingRwLock::new());
        let (tx, rx) = std::sync::mpsc::channel();
        let holder = {
            let lock = lock.clone();
            thread::spawn(move || {
                let _w = lock.enter_write();
                tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(30));
            })
        };
        rx.recv().unwrap();
        assert!(lock.is_write_locked());
        let guard = lock
            .enter_read_async(WaitOptions::default(), None)
            .await
            .expect("writer releases well within the timeout");
        assert_eq!(guard.access(), Access::Read);
        assert_eq!(lock.readers(), 1);
        drop(guard);
        holder.join().unwrap();
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_blocking_async_timeout_and_cancel() {
        let lock = BlockingRwLock::new();
        let w = lock.enter_write();
        assert!(lock.enter_read_async(quick(), None).await.is_none());

        let token = CancelToken::new();
        token.cancel();
        assert!(lock
            .enter_write_async(WaitOptions::default(), Some(&token))
            .await
            .is_none());
        drop(w);
        // A task holder is not subject to thread re-entry checks.
        let a = lock.enter_read_async(quick(), None).await;
        let b = lock.enter_read_async(quick(), None).await;
        assert!(a.is_some() && b.is_some());
        assert_eq!(lock.readers(), 2);
    }

    #[tokio::test]
    async fn test_blocking_task_holder_not_attributed_to_thread() {
        let lock = BlockingRwLock::new();
        let w = lock
            .enter_write_async(quick(), None)
            .await
            .expect("lock is free");
        assert!(lock.is_write_locked());
        assert_eq!(lock.held_by_current_thread(), None);
        // Asking again from the same task and thread is not caught; it waits
        // out its attempts instead of panicking.
        let start = Instant::now();
        assert!(lock.enter_read_timeout(quick(), None).is_none());
        assert!(lock.enter_write_async(quick(), None).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(60));
        drop(w);
        assert!(!lock.is_locked());
    }
}
