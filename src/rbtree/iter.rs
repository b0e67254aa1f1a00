//! In-order iterators for the tree.

use super::node::NodeId;
use super::RbTree;
use smallvec::SmallVec;
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt::Debug;
use std::iter::FusedIterator;

// Height is bounded by 2 * log2(n + 1), so this only spills for very large trees.
const STACK_INLINE: usize = 32;

/// Ascending iterator over the keys of a [RbTree].
///
/// Keeps an explicit stack of pending ancestors rather than recursing: the
/// left spine of a node is pushed, popping visits a key, and then the left
/// spine of the popped node's right child is pushed.
pub struct Iter<'a, K> {
    tree: &'a RbTree<K>,
    stack: SmallVec<[NodeId; STACK_INLINE]>,
    remaining: usize,
}

impl<'a, K> Iter<'a, K> {
    pub(crate) fn new(tree: &'a RbTree<K>) -> Self {
        let mut iter = Iter {
            tree,
            stack: SmallVec::new(),
            remaining: tree.len(),
        };
        iter.push_left_spine(tree.root);
        iter
    }

    /// Position on the smallest key that is not less than `min`.
    pub(crate) fn seek<Q>(tree: &'a RbTree<K>, min: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut stack = SmallVec::new();
        let mut work = tree.root;
        while !work.is_nil() {
            if min.cmp(tree.key(work).borrow()) != Ordering::Greater {
                // Candidate, but something smaller may still qualify.
                stack.push(work);
                work = tree.arena[work].left;
            } else {
                work = tree.arena[work].right;
            }
        }
        Iter {
            tree,
            stack,
            remaining: tree.len(),
        }
    }

    fn push_left_spine(&mut self, mut work: NodeId) {
        while !work.is_nil() {
            self.stack.push(work);
            work = self.tree.arena[work].left;
        }
    }
}

impl<'a, K> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        let work = self.stack.pop()?;
        self.push_left_spine(self.tree.arena[work].right);
        self.remaining = self.remaining.saturating_sub(1);
        Some(self.tree.key(work))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.stack.is_empty() {
            (0, Some(0))
        } else {
            (1, Some(self.remaining))
        }
    }
}

impl<K> FusedIterator for Iter<'_, K> {}

impl<K: Debug> Debug for Iter<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iter")
            .field("pending", &self.stack.len())
            .finish()
    }
}

/// Ascending iterator over the keys within an inclusive range.
pub struct RangeIter<'a, K, Q: ?Sized> {
    inner: Iter<'a, K>,
    max: &'a Q,
}

impl<'a, K, Q> RangeIter<'a, K, Q>
where
    K: Borrow<Q>,
    Q: Ord + ?Sized,
{
    pub(crate) fn new(tree: &'a RbTree<K>, min: &Q, max: &'a Q) -> Self {
        let inner = if min > max {
            // Nothing can satisfy min <= k <= max.
            Iter {
                tree,
                stack: SmallVec::new(),
                remaining: 0,
            }
        } else {
            Iter::seek(tree, min)
        };
        RangeIter { inner, max }
    }
}

impl<'a, K, Q> Iterator for RangeIter<'a, K, Q>
where
    K: Borrow<Q>,
    Q: Ord + ?Sized,
{
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        let k = self.inner.next()?;
        if self.max.cmp(k.borrow()) != Ordering::Less {
            Some(k)
        } else {
            // Past the upper bound, nothing further can match.
            self.inner.stack.clear();
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.inner.size_hint().1)
    }
}

impl<K, Q> FusedIterator for RangeIter<'_, K, Q>
where
    K: Borrow<Q>,
    Q: Ord + ?Sized,
{
}
