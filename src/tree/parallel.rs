//! Bulk operations that fan out across a rayon pool.
//!
//! The pool is the tree's own when it was built with
//! [set_parallelism](super::ConcurrentRbTreeBuilder::set_parallelism), the
//! global rayon pool otherwise. A panic in any unit of work is propagated to
//! the caller once the rest have finished.

use super::ConcurrentRbTree;
use crate::lock::Access;
use rayon::prelude::*;
use std::borrow::Borrow;
use std::fmt::Debug;
use tracing::debug;

impl<K: Ord + Clone + Debug + Sync + Send + 'static> ConcurrentRbTree<K> {
    fn fork_join<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    // Workers take the lock on threads of their own, so they would wait
    // forever on a lock this thread holds. A rayon worker that waits for a
    // join may run stolen jobs itself, and those would inherit its read lock.
    fn assert_can_fan_out(&self, op: &str, readers_ok: bool) {
        match self.lock.held_by_current_thread() {
            Some(Access::Write) => panic!(
                "{} called while this thread holds the write lock of the tree",
                op
            ),
            Some(Access::Read) if !readers_ok => panic!(
                "{} called while this thread holds a read lock of the tree",
                op
            ),
            Some(Access::Read) if rayon::current_thread_index().is_some() => panic!(
                "{} called from a rayon worker thread that holds a read lock of the tree",
                op
            ),
            _ => {}
        }
    }

    /// Insert every key, each under its own write lock, spread over the
    /// worker pool. Returns how many keys were not already present.
    pub fn parallel_insert<I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = K>,
    {
        self.assert_can_fan_out("parallel_insert", false);
        let keys: Vec<K> = keys.into_iter().collect();
        let total = keys.len();
        let inserted = self.fork_join(|| {
            keys.into_par_iter()
                .map(|k| self.insert(k))
                .filter(|new| *new)
                .count()
        });
        debug!(total, inserted, "parallel_insert");
        inserted
    }

    /// Look up every key in `keys` in parallel. The result at each position
    /// answers the key at the same position.
    ///
    /// # Panics
    ///
    /// If the calling thread holds the write lock. Also if it holds a read
    /// lock and is itself a rayon worker, for example inside an action of
    /// [parallel_traverse](Self::parallel_traverse) that opened a cursor.
    pub fn parallel_search<Q>(&self, keys: &[Q]) -> Vec<bool>
    where
        K: Borrow<Q>,
        Q: Ord + Sync,
    {
        self.assert_can_fan_out("parallel_search", true);
        self.fork_join(|| keys.par_iter().map(|k| self.search(k)).collect())
    }

    /// Remove every key matching `pred`. Returns how many were removed.
    ///
    /// Matching keys are collected under one read lock, then removed under
    /// one write lock. Keys removed by someone else in between are skipped.
    /// `pred` runs on the calling thread and must not use this tree's locking
    /// API.
    pub fn parallel_delete<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let candidates: Vec<K> =
            self.read_locked(|tree| tree.iter().filter(|k| pred(*k)).cloned().collect());
        if candidates.is_empty() {
            debug!(removed = 0, "parallel_delete found no candidates");
            return 0;
        }
        let removed = self.write_locked(|tree| {
            candidates.iter().filter(|k| tree.remove(*k)).count()
        });
        debug!(candidates = candidates.len(), removed, "parallel_delete");
        removed
    }

    /// Run `action` on every key in parallel. The keys are copied under a read
    /// lock that is released before any action runs, so actions see a
    /// point in time copy and may use the tree freely.
    ///
    /// # Panics
    ///
    /// Under the same conditions as [parallel_search](Self::parallel_search).
    pub fn parallel_traverse<F>(&self, action: F)
    where
        F: Fn(&K) + Sync + Send,
    {
        self.assert_can_fan_out("parallel_traverse", true);
        let keys = self.snapshot();
        debug!(keys = keys.len(), "parallel_traverse");
        self.fork_join(|| keys.par_iter().for_each(|k| action(k)));
    }
}
