//! Async operations on [ConcurrentRbTree].
//!
//! These never block the executor thread while waiting for the lock. Each
//! takes an optional [CancelToken] and an optional per attempt timeout that
//! overrides the tree's configured [WaitOptions](crate::lock::WaitOptions).
//! When the lock can not be taken they report failure and leave the tree
//! untouched.

use super::ConcurrentRbTree;
use crate::lock::CancelToken;
use std::borrow::Borrow;
use std::fmt::Debug;
use std::time::Duration;
use tracing::debug;

impl<K: Ord + Clone + Debug + Sync + Send + 'static> ConcurrentRbTree<K> {
    /// Add `key`. Returns false if the key was already present, or if the
    /// write lock could not be taken in time.
    pub async fn insert_async(
        &self,
        key: K,
        cancel: Option<&CancelToken>,
        timeout: Option<Duration>,
    ) -> bool {
        let opts = self.wait.with_timeout(timeout);
        match self.lock.enter_write_async(opts, cancel).await {
            Some(_guard) => {
                // SAFETY: write guard held.
                unsafe { self.engine_mut() }.insert(key)
            }
            None => {
                debug!(?key, "insert_async could not take the write lock");
                false
            }
        }
    }

    /// Is a key equal to `k` present. Also false if the read lock could not be
    /// taken in time.
    pub async fn search_async<Q>(
        &self,
        k: &Q,
        cancel: Option<&CancelToken>,
        timeout: Option<Duration>,
    ) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let opts = self.wait.with_timeout(timeout);
        match self.lock.enter_read_async(opts, cancel).await {
            // SAFETY: read guard held.
            Some(_guard) => unsafe { self.engine() }.contains(k),
            None => {
                debug!("search_async could not take the read lock");
                false
            }
        }
    }

    /// Remove the key equal to `k`. Returns false if it was absent, or if the
    /// write lock could not be taken in time.
    pub async fn delete_async<Q>(
        &self,
        k: &Q,
        cancel: Option<&CancelToken>,
        timeout: Option<Duration>,
    ) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let opts = self.wait.with_timeout(timeout);
        match self.lock.enter_write_async(opts, cancel).await {
            // SAFETY: write guard held.
            Some(_guard) => unsafe { self.engine_mut() }.remove(k),
            None => {
                debug!("delete_async could not take the write lock");
                false
            }
        }
    }

    /// Copy every key in order, or `None` if the read lock could not be taken
    /// in time.
    pub async fn snapshot_async(
        &self,
        cancel: Option<&CancelToken>,
        timeout: Option<Duration>,
    ) -> Option<Vec<K>> {
        let opts = self.wait.with_timeout(timeout);
        let _guard = self.lock.enter_read_async(opts, cancel).await?;
        // SAFETY: read guard held.
        Some(unsafe { self.engine() }.iter().cloned().collect())
    }

    /// Copy every key in `min..=max` in order, or `None` if the read lock could
    /// not be taken in time.
    pub async fn range_async<Q>(
        &self,
        min: &Q,
        max: &Q,
        cancel: Option<&CancelToken>,
        timeout: Option<Duration>,
    ) -> Option<Vec<K>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let opts = self.wait.with_timeout(timeout);
        let _guard = self.lock.enter_read_async(opts, cancel).await?;
        // SAFETY: read guard held.
        Some(unsafe { self.engine() }.range(min, max).cloned().collect())
    }
}
