use crate::error::CursorError;
use crate::lock::LockGuard;
use crate::rbtree::{Iter, RbTree};
use std::fmt;
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CursorState {
    Fresh,
    Positioned,
    Exhausted,
    Released,
}

/// An in-order cursor over a [ConcurrentRbTree](super::ConcurrentRbTree) that
/// visits keys without copying the tree.
///
/// The cursor holds the tree's read lock from creation until it walks off
/// the end, is [released](Self::release) or is dropped, whichever is first.
/// Writers wait for it the whole time, so long-lived cursors should be
/// avoided. Cursors can not be rewound.
pub struct LazyCursor<'a, K> {
    guard: Option<LockGuard<'a>>,
    iter: Option<Iter<'a, K>>,
    current: Option<&'a K>,
    state: CursorState,
}

impl<K> fmt::Debug for LazyCursor<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCursor")
            .field("state", &self.state)
            .field("holds_lock", &self.guard.is_some())
            .finish()
    }
}

impl<'a, K> LazyCursor<'a, K> {
    pub(super) fn new(guard: LockGuard<'a>, tree: &'a RbTree<K>) -> Self {
        trace!(len = tree.len(), "cursor opened");
        LazyCursor {
            guard: Some(guard),
            iter: Some(tree.iter()),
            current: None,
            state: CursorState::Fresh,
        }
    }

    /// Move to the next key. Returns `Ok(false)` once every key has been
    /// visited, which also gives up the read lock.
    pub fn advance(&mut self) -> Result<bool, CursorError> {
        match self.state {
            CursorState::Released => return Err(CursorError::Released),
            CursorState::Exhausted => return Ok(false),
            CursorState::Fresh | CursorState::Positioned => {}
        }
        match self.iter.as_mut().and_then(Iterator::next) {
            Some(k) => {
                self.current = Some(k);
                self.state = CursorState::Positioned;
                Ok(true)
            }
            None => {
                self.finish(CursorState::Exhausted);
                Ok(false)
            }
        }
    }

    /// The key the cursor is positioned on.
    pub fn current(&self) -> Result<&K, CursorError> {
        match (self.state, self.current) {
            (CursorState::Positioned, Some(k)) => Ok(k),
            (CursorState::Exhausted, _) => Err(CursorError::Exhausted),
            (CursorState::Released, _) => Err(CursorError::Released),
            _ => Err(CursorError::NotPositioned),
        }
    }

    /// Always fails, a cursor can not be rewound.
    pub fn reset(&mut self) -> Result<(), CursorError> {
        Err(CursorError::RestartNotSupported)
    }

    /// Give up the read lock now. Further calls to [advance](Self::advance)
    /// or [current](Self::current) fail. Releasing twice, or after the cursor
    /// is exhausted, does nothing.
    pub fn release(&mut self) {
        if self.guard.is_some() {
            self.finish(CursorState::Released);
        }
    }

    /// Does the cursor still hold the read lock.
    pub fn is_active(&self) -> bool {
        self.guard.is_some()
    }

    fn finish(&mut self, state: CursorState) {
        // Borrows of the tree must be gone before the guard is.
        self.current = None;
        self.iter = None;
        self.guard = None;
        self.state = state;
        trace!(?state, "cursor closed");
    }
}

impl<K: Clone> Iterator for LazyCursor<'_, K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        match self.advance() {
            Ok(true) => self.current.cloned(),
            _ => None,
        }
    }
}

impl<K> Drop for LazyCursor<'_, K> {
    fn drop(&mut self) {
        self.release();
    }
}
