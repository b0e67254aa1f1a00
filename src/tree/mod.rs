//! See the documentation for [ConcurrentRbTree]

mod asynch;
mod cursor;
mod parallel;

pub use self::cursor::LazyCursor;

#[cfg(feature = "serde")]
use serde::{
    de::{Deserialize, Deserializer},
    ser::{Serialize, Serializer},
};

use crate::error::BuildError;
use crate::lock::{Access, BlockingRwLock, WaitOptions};
use crate::rbtree::RbTree;
use std::borrow::Borrow;
use std::cell::UnsafeCell;
use std::fmt::{self, Debug};
use std::time::Duration;
use tracing::{error, trace};

/// A builder for [ConcurrentRbTree], allowing the lock waits and the worker
/// pool of the tree to be configured before it is created.
#[derive(Debug, Default, Clone)]
pub struct ConcurrentRbTreeBuilder {
    wait: WaitOptions,
    parallelism: Option<usize>,
    capacity: usize,
}

impl ConcurrentRbTreeBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a single attempt of an async operation may wait for the lock.
    /// Defaults to 30 seconds.
    #[must_use]
    pub fn set_wait_timeout(self, timeout: Duration) -> Self {
        ConcurrentRbTreeBuilder {
            wait: self.wait.set_timeout(timeout),
            ..self
        }
    }

    /// How many attempts an async operation makes to take the lock before it
    /// gives up. Defaults to 5, and is never less than 1.
    #[must_use]
    pub fn set_retries(self, retries: usize) -> Self {
        ConcurrentRbTreeBuilder {
            wait: self.wait.set_retries(retries),
            ..self
        }
    }

    /// Run the parallel operations of this tree on a dedicated pool of
    /// `threads` workers. Without this the global rayon pool is used.
    #[must_use]
    pub fn set_parallelism(self, threads: usize) -> Self {
        ConcurrentRbTreeBuilder {
            parallelism: Some(threads),
            ..self
        }
    }

    /// Reserve room for `capacity` keys up front.
    #[must_use]
    pub fn set_capacity(self, capacity: usize) -> Self {
        ConcurrentRbTreeBuilder { capacity, ..self }
    }

    /// Consume this builder, returning the empty tree it describes.
    pub fn build<K>(self) -> Result<ConcurrentRbTree<K>, BuildError>
    where
        K: Ord + Clone + Debug + Sync + Send + 'static,
    {
        let ConcurrentRbTreeBuilder {
            wait,
            parallelism,
            capacity,
        } = self;

        let pool = match parallelism {
            Some(0) => return Err(BuildError::ZeroParallelism),
            Some(threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("crbtree-worker-{}", i))
                    .build()?,
            ),
            None => None,
        };

        Ok(ConcurrentRbTree {
            lock: BlockingRwLock::new(),
            inner: UnsafeCell::new(RbTree::with_capacity(capacity)),
            wait,
            pool,
        })
    }
}

/// An ordered set that many threads and tasks can share.
///
/// This wraps a single threaded [RbTree] in a [BlockingRwLock]. Lookups run
/// under a read lock and may proceed in parallel, mutations run under the
/// write lock one at a time. Every public operation takes the lock itself,
/// so the tree can be shared by reference or through an `Arc`.
///
/// Plain operations block the calling thread until the lock is granted. The
/// `_async` forms suspend the task instead, and give up with `false` or `None`
/// once the configured [WaitOptions] are exhausted or the caller cancels.
///
/// Several steps that must appear atomic to other users of the tree can be
/// grouped with [batch_operation](Self::batch_operation), which hands the
/// closure the unsynchronised engine under one write lock. While inside such
/// a closure the tree must not be used through its locking API from the
/// same thread; doing so panics.
pub struct ConcurrentRbTree<K> {
    lock: BlockingRwLock,
    inner: UnsafeCell<RbTree<K>>,
    wait: WaitOptions,
    pool: Option<rayon::ThreadPool>,
}

// The engine is only reached through the lock: shared access while a read
// guard is held, exclusive access while the write guard is held.
unsafe impl<K: Send> Send for ConcurrentRbTree<K> {}
unsafe impl<K: Send + Sync> Sync for ConcurrentRbTree<K> {}

impl<K: Ord + Clone + Debug + Sync + Send + 'static> Default for ConcurrentRbTree<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone + Debug + Sync + Send + 'static> FromIterator<K> for ConcurrentRbTree<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        Self::from_engine(iter.into_iter().collect())
    }
}

impl<K: Ord + Clone + Debug + Sync + Send + 'static> ConcurrentRbTree<K> {
    /// Construct a new empty tree with the default configuration.
    pub fn new() -> Self {
        Self::from_engine(RbTree::new())
    }

    /// Wrap an already populated engine.
    pub fn from_engine(tree: RbTree<K>) -> Self {
        ConcurrentRbTree {
            lock: BlockingRwLock::new(),
            inner: UnsafeCell::new(tree),
            wait: WaitOptions::default(),
            pool: None,
        }
    }

    /// Unwrap the tree, returning the engine.
    pub fn into_inner(self) -> RbTree<K> {
        // Drop must still run its leak check, so take the engine out rather
        // than destructuring.
        let mut this = self;
        std::mem::take(this.inner.get_mut())
    }

    /// The wait options async operations are bounded by.
    pub fn wait_options(&self) -> WaitOptions {
        self.wait
    }

    /// The lock guarding this tree.
    pub fn lock(&self) -> &BlockingRwLock {
        &self.lock
    }

    /// Add `key` to the tree. Returns false without changing the tree if an
    /// equal key is already present.
    pub fn insert(&self, key: K) -> bool {
        self.write_locked(|tree| tree.insert(key))
    }

    /// Is a key equal to `k` present.
    pub fn search<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.read_locked(|tree| tree.contains(k))
    }

    /// Remove the key equal to `k`. Returns false if it was not present.
    pub fn delete<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.write_locked(|tree| tree.remove(k))
    }

    /// Number of keys in the tree.
    pub fn len(&self) -> usize {
        self.read_locked(|tree| tree.len())
    }

    /// Is the tree empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every key.
    pub fn clear(&self) {
        self.write_locked(|tree| tree.clear())
    }

    /// Run `f` against the engine under a single write lock, so that every
    /// change it makes becomes visible to other users at once.
    ///
    /// ```
    /// use crbtree::ConcurrentRbTree;
    ///
    /// let tree: ConcurrentRbTree<u32> = [300, 500, 700].into_iter().collect();
    /// tree.batch_operation(|t| {
    ///     t.remove(&500);
    ///     t.insert(555);
    /// });
    /// assert_eq!(tree.snapshot(), vec![300, 555, 700]);
    /// ```
    pub fn batch_operation<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut RbTree<K>) -> R,
    {
        self.write_locked(f)
    }

    /// Run `f` against the engine under a single read lock.
    pub fn read_operation<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&RbTree<K>) -> R,
    {
        self.read_locked(f)
    }

    /// Copy every key, in ascending order.
    pub fn snapshot(&self) -> Vec<K> {
        self.read_locked(|tree| tree.iter().cloned().collect())
    }

    /// Copy every key in `min..=max`, in ascending order. Empty when `min`
    /// is greater than `max`.
    pub fn range<Q>(&self, min: &Q, max: &Q) -> Vec<K>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.read_locked(|tree| tree.range(min, max).cloned().collect())
    }

    /// The smallest key.
    pub fn first(&self) -> Option<K> {
        self.read_locked(|tree| tree.first().cloned())
    }

    /// The largest key.
    pub fn last(&self) -> Option<K> {
        self.read_locked(|tree| tree.last().cloned())
    }

    /// Walk the tree in order without copying it. The cursor holds the read
    /// lock from now until it is exhausted, released or dropped, so writers
    /// wait for it.
    pub fn lazy_iterator(&self) -> LazyCursor<'_, K> {
        let guard = self.lock.enter_read();
        // SAFETY: the cursor owns the read guard for as long as it can reach
        // the engine.
        let tree = unsafe { &*self.inner.get() };
        LazyCursor::new(guard, tree)
    }

    /// Check the red-black invariants under a read lock.
    pub fn verify(&self) -> bool {
        self.read_locked(|tree| tree.verify())
    }

    fn read_locked<R>(&self, f: impl FnOnce(&RbTree<K>) -> R) -> R {
        let _guard = self.lock.enter_read();
        // SAFETY: the read guard excludes writers until it drops.
        f(unsafe { &*self.inner.get() })
    }

    fn write_locked<R>(&self, f: impl FnOnce(&mut RbTree<K>) -> R) -> R {
        let _guard = self.lock.enter_write();
        // SAFETY: the write guard excludes every other guard, and a
        // re-entrant request from this thread panics before it can alias.
        f(unsafe { &mut *self.inner.get() })
    }

    /// # Safety
    ///
    /// The caller must hold a guard from `self.lock` for as long as the
    /// reference lives.
    pub(crate) unsafe fn engine(&self) -> &RbTree<K> {
        &*self.inner.get()
    }

    /// # Safety
    ///
    /// The caller must hold the write guard from `self.lock` for as long as
    /// the reference lives.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn engine_mut(&self) -> &mut RbTree<K> {
        &mut *self.inner.get()
    }
}

impl<K> Drop for ConcurrentRbTree<K> {
    fn drop(&mut self) {
        // A guard borrows the tree, so the lock can only still be held here if
        // one was leaked.
        if self.lock.is_locked() {
            error!(
                readers = self.lock.readers(),
                write_locked = self.lock.is_write_locked(),
                "tree dropped while its lock is held, a guard or cursor was leaked"
            );
            debug_assert!(false, "tree dropped while its lock is held");
        } else {
            trace!("tree dropped");
        }
    }
}

impl<K: Ord + Clone + Debug + Sync + Send + 'static> Debug for ConcurrentRbTree<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Asking for the read lock while holding the write lock would panic.
        if self.lock.held_by_current_thread() == Some(Access::Write) {
            return f.write_str("ConcurrentRbTree { <write locked> }");
        }
        match self.lock.try_enter_read() {
            Some(_guard) => {
                // SAFETY: read guard held.
                let tree = unsafe { self.engine() };
                f.debug_struct("ConcurrentRbTree")
                    .field("keys", tree)
                    .finish()
            }
            None => f.write_str("ConcurrentRbTree { <write locked> }"),
        }
    }
}

#[cfg(feature = "serde")]
impl<K> Serialize for ConcurrentRbTree<K>
where
    K: Serialize + Ord + Clone + Debug + Sync + Send + 'static,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.read_locked(|tree| tree.serialize(serializer))
    }
}

#[cfg(feature = "serde")]
impl<'de, K> Deserialize<'de> for ConcurrentRbTree<K>
where
    K: Deserialize<'de> + Ord + Clone + Debug + Sync + Send + 'static,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        RbTree::deserialize(deserializer).map(Self::from_engine)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConcurrentRbTree, ConcurrentRbTreeBuilder};
    use crate::error::BuildError;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_tree_basic() {
        let tree = ConcurrentRbTree::new();
        assert!(tree.is_empty());
        assert!(tree.insert(10));
        assert!(tree.insert(5));
        assert!(!tree.insert(10));
        assert!(tree.search(&5));
        assert!(!tree.search(&6));
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.first(), Some(5));
        assert_eq!(tree.last(), Some(10));
        assert!(tree.delete(&5));
        assert!(!tree.delete(&5));
        assert_eq!(tree.snapshot(), vec![10]);
        tree.clear();
        assert!(tree.is_empty());
        assert!(tree.verify());
        assert!(!tree.lock().is_locked());
    }

    #[test]
    fn test_tree_borrowed_lookup() {
        let tree: ConcurrentRbTree<String> =
            ["apple", "pear", "fig"].iter().map(|s| s.to_string()).collect();
        assert!(tree.search("fig"));
        assert!(tree.delete("pear"));
        assert_eq!(tree.range("a", "g"), vec!["apple".to_string(), "fig".to_string()]);
    }

    #[test]
    fn test_tree_batch_operation() {
        let tree: ConcurrentRbTree<u32> = [300, 500, 700].into_iter().collect();
        let replaced = tree.batch_operation(|t| t.remove(&500) && t.insert(555));
        assert!(replaced);
        assert_eq!(tree.snapshot(), vec![300, 555, 700]);
    }

    #[test]
    fn test_tree_batch_is_atomic_to_readers() {
        let tree: ConcurrentRbTree<u32> = (0..100).collect();
        let stop = AtomicBool::new(false);
        thread::scope(|scope| {
            let reader = scope.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    // Each batch moves a key from one half to the other, so
                    // the count is always 100 when observed whole.
                    assert_eq!(tree.len(), 100);
                }
            });
            for i in 0..50 {
                tree.batch_operation(|t| {
                    assert!(t.remove(&i));
                    assert!(t.insert(1000 + i));
                });
            }
            stop.store(true, Ordering::Release);
            reader.join().unwrap();
        });
        assert_eq!(tree.len(), 100);
        assert!(tree.verify());
    }

    #[test]
    fn test_tree_range() {
        let tree: ConcurrentRbTree<i64> = (0..50).map(|i| i * 2).collect();
        assert_eq!(tree.range(&10, &16), vec![10, 12, 14, 16]);
        assert_eq!(tree.range(&9, &11), vec![10]);
        assert!(tree.range(&20, &10).is_empty());
        assert!(tree.range(&1000, &2000).is_empty());
    }

    #[test]
    fn test_tree_disjoint_concurrent_inserts() {
        let tree = ConcurrentRbTree::new();
        thread::scope(|scope| {
            for t in 0..8u64 {
                let tree = &tree;
                scope.spawn(move || {
                    for i in 0..250u64 {
                        assert!(tree.insert(t * 1000 + i));
                    }
                });
            }
        });
        let expect: Vec<u64> = (0..8u64)
            .flat_map(|t| (0..250u64).map(move |i| t * 1000 + i))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        assert_eq!(tree.snapshot(), expect);
        assert!(tree.verify());
    }

    #[test]
    fn test_tree_mixed_concurrent_ops() {
        let _ = tracing_subscriber::fmt::try_init();
        let tree: ConcurrentRbTree<u32> = (0..1000).collect();
        thread::scope(|scope| {
            // Remove evens while others read and add odds above 1000.
            scope.spawn(|| {
                for i in (0..1000).step_by(2) {
                    assert!(tree.delete(&i));
                }
            });
            scope.spawn(|| {
                for i in (1001..2000).step_by(2) {
                    assert!(tree.insert(i));
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for i in (1..1000).step_by(2) {
                        assert!(tree.search(&i));
                    }
                });
            }
        });
        assert_eq!(tree.len(), 1000);
        assert!(tree.snapshot().iter().all(|k| k % 2 == 1));
        assert!(tree.verify());
    }

    #[test]
    fn test_tree_readers_concurrent_writer_waits() {
        let tree: ConcurrentRbTree<u32> = (0..10).collect();
        let barrier = Barrier::new(3);
        let written = AtomicBool::new(false);
        thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    tree.read_operation(|t| {
                        // Both readers are inside at the same time.
                        barrier.wait();
                        thread::sleep(Duration::from_millis(20));
                        assert!(!written.load(Ordering::SeqCst));
                        assert_eq!(t.len(), 10);
                    });
                });
            }
            barrier.wait();
            tree.insert(10);
            written.store(true, Ordering::SeqCst);
        });
        assert_eq!(tree.len(), 11);
    }

    #[test]
    #[should_panic(expected = "not re-entrant")]
    fn test_tree_reentry_from_batch_panics() {
        let tree: ConcurrentRbTree<u32> = (0..10).collect();
        tree.batch_operation(|_| tree.insert(11));
    }

    #[test]
    fn test_tree_read_reentry() {
        let tree: ConcurrentRbTree<u32> = (0..10).collect();
        let found = tree.read_operation(|t| t.contains(&3) && tree.search(&4));
        assert!(found);
    }

    #[test]
    fn test_tree_builder() {
        let tree: ConcurrentRbTree<u32> = ConcurrentRbTreeBuilder::new()
            .set_wait_timeout(Duration::from_millis(50))
            .set_retries(2)
            .set_parallelism(2)
            .set_capacity(64)
            .build()
            .expect("valid configuration");
        assert_eq!(tree.wait_options().timeout(), Duration::from_millis(50));
        assert_eq!(tree.wait_options().retries(), 2);
        assert!(tree.insert(1));

        let bad = ConcurrentRbTreeBuilder::new()
            .set_parallelism(0)
            .build::<u32>();
        assert!(matches!(bad, Err(BuildError::ZeroParallelism)));
    }

    #[test]
    fn test_tree_debug_and_into_inner() {
        let tree: ConcurrentRbTree<u32> = [2, 1].into_iter().collect();
        assert_eq!(format!("{:?}", tree), "ConcurrentRbTree { keys: {1, 2} }");
        tree.batch_operation(|_| {
            assert_eq!(
                format!("{:?}", tree),
                "ConcurrentRbTree { <write locked> }"
            );
        });
        let engine = tree.into_inner();
        assert_eq!(engine.len(), 2);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock is held")]
    fn test_tree_leaked_cursor_detected() {
        let tree: ConcurrentRbTree<u32> = (0..4).collect();
        let raw = Box::into_raw(Box::new(tree));
        // SAFETY: raw came from Box::into_raw and is freed exactly once below.
        std::mem::forget(unsafe { &*raw }.lazy_iterator());
        drop(unsafe { Box::from_raw(raw) });
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_tree_serde() {
        let tree: ConcurrentRbTree<u32> = [3, 1, 2].into_iter().collect();
        let json = serde_json::to_string(&tree).unwrap();
        assert_eq!(json, "[1,2,3]");
        let back: ConcurrentRbTree<u32> = serde_json::from_str("[5,4,5]").unwrap();
        assert_eq!(back.snapshot(), vec![4, 5]);
    }
}
