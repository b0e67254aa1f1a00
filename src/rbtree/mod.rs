//! RbTree - the single threaded red-black tree engine.
//!
//! This is the unsynchronized algorithm that [ConcurrentRbTree](crate::tree::ConcurrentRbTree)
//! wraps. Every method here assumes the caller already holds exclusive (`&mut self`) or
//! shared (`&self`) access, which the borrow checker enforces. It is also the type handed
//! to the closures of `batch_operation` and `read_operation`, so a multi-step transaction
//! can run against the raw engine without touching the lock again.
//!
//! The tree maintains the usual red-black invariants:
//!
//! * keys are in search order with no duplicates,
//! * the root and the sentinel are black,
//! * no red node has a red child,
//! * every path from a node down to the sentinel holds the same number of black nodes.
//!
//! Together these bound the height to `2 * log2(n + 1)`.

mod iter;
pub(crate) mod node;

pub use self::iter::{Iter, RangeIter};
pub use self::node::Color;

use self::node::{Arena, NodeId};
use crate::error::InvariantError;
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt::Debug;

/// An ordered set of keys stored in a red-black tree.
///
/// # Examples
/// ```
/// use crbtree::rbtree::RbTree;
///
/// let mut tree = RbTree::new();
/// assert!(tree.insert(300));
/// assert!(tree.insert(500));
/// // Duplicates are refused.
/// assert!(!tree.insert(500));
/// assert!(tree.remove(&300));
/// assert_eq!(tree.iter().copied().collect::<Vec<_>>(), vec![500]);
/// ```
#[derive(Clone)]
pub struct RbTree<K> {
    arena: Arena<K>,
    root: NodeId,
    len: usize,
}

impl<K> Default for RbTree<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> RbTree<K> {
    /// Create an empty tree.
    pub fn new() -> Self {
        RbTree {
            arena: Arena::new(),
            root: NodeId::NIL,
            len: 0,
        }
    }

    /// Create an empty tree with room for `capacity` keys before reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        RbTree {
            arena: Arena::with_capacity(capacity),
            root: NodeId::NIL,
            len: 0,
        }
    }

    /// The number of keys in the tree.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Determine if the tree is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove every key from the tree.
    pub fn clear(&mut self) {
        self.arena.clear();
        self.root = NodeId::NIL;
        self.len = 0;
    }

    /// Iterate over all keys in ascending order.
    pub fn iter(&self) -> Iter<'_, K> {
        Iter::new(self)
    }

    /// The smallest key in the tree.
    pub fn first(&self) -> Option<&K> {
        if self.root.is_nil() {
            None
        } else {
            Some(self.key(self.minimum(self.root)))
        }
    }

    /// The largest key in the tree.
    pub fn last(&self) -> Option<&K> {
        let mut work = self.root;
        if work.is_nil() {
            return None;
        }
        while !self.arena[work].right.is_nil() {
            work = self.arena[work].right;
        }
        Some(self.key(work))
    }

    #[inline(always)]
    pub(crate) fn key(&self, id: NodeId) -> &K {
        debug_assert!(!id.is_nil());
        self.arena[id]
            .key
            .as_ref()
            .expect("linked node must hold a key")
    }

    #[inline(always)]
    fn color(&self, id: NodeId) -> Color {
        self.arena[id].color
    }

    #[inline(always)]
    fn set_color(&mut self, id: NodeId, color: Color) {
        debug_assert!(!(id.is_nil() && color == Color::Red));
        self.arena[id].color = color;
    }

    #[inline(always)]
    fn left(&self, id: NodeId) -> NodeId {
        self.arena[id].left
    }

    #[inline(always)]
    fn right(&self, id: NodeId) -> NodeId {
        self.arena[id].right
    }

    #[inline(always)]
    fn parent(&self, id: NodeId) -> NodeId {
        self.arena[id].parent
    }

    fn minimum(&self, mut work: NodeId) -> NodeId {
        while !self.left(work).is_nil() {
            work = self.left(work);
        }
        work
    }

    /*
     *      x                y
     *     / \              / \
     *    a   y     ->     x   c
     *       / \          / \
     *      b   c        a   b
     */
    fn left_rotate(&mut self, x: NodeId) {
        let y = self.right(x);
        debug_assert!(!y.is_nil());
        let b = self.left(y);

        self.arena[x].right = b;
        if !b.is_nil() {
            self.arena[b].parent = x;
        }

        let xp = self.parent(x);
        self.arena[y].parent = xp;
        if xp.is_nil() {
            self.root = y;
        } else if x == self.left(xp) {
            self.arena[xp].left = y;
        } else {
            self.arena[xp].right = y;
        }

        self.arena[y].left = x;
        self.arena[x].parent = y;
    }

    // Mirror of left_rotate.
    fn right_rotate(&mut self, y: NodeId) {
        let x = self.left(y);
        debug_assert!(!x.is_nil());
        let b = self.right(x);

        self.arena[y].left = b;
        if !b.is_nil() {
            self.arena[b].parent = y;
        }

        let yp = self.parent(y);
        self.arena[x].parent = yp;
        if yp.is_nil() {
            self.root = x;
        } else if y == self.right(yp) {
            self.arena[yp].right = x;
        } else {
            self.arena[yp].left = x;
        }

        self.arena[x].right = y;
        self.arena[y].parent = x;
    }

    /// Replace the subtree at `u` with the subtree at `v`. `v` may be the
    /// sentinel, in which case the sentinel's parent is written so that
    /// delete fix-up can climb from it.
    fn transplant(&mut self, u: NodeId, v: NodeId) {
        let up = self.parent(u);
        if up.is_nil() {
            self.root = v;
        } else if u == self.left(up) {
            self.arena[up].left = v;
        } else {
            self.arena[up].right = v;
        }
        self.arena[v].parent = up;
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while self.color(self.parent(z)) == Color::Red {
            // A red parent is never the root, so the grandparent exists.
            let p = self.parent(z);
            let g = self.parent(p);
            if p == self.left(g) {
                let uncle = self.right(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.left_rotate(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.right_rotate(g);
                }
            } else {
                let uncle = self.left(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.right_rotate(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.left_rotate(g);
                }
            }
        }
        let root = self.root;
        self.set_color(root, Color::Black);
    }

    fn delete_fixup(&mut self, mut x: NodeId) {
        while x != self.root && self.color(x) == Color::Black {
            // When x is the sentinel its sibling can not be, so comparing
            // against the parent's left link still picks the right side.
            let p = self.parent(x);
            if x == self.left(p) {
                let mut w = self.right(p);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.left_rotate(p);
                    w = self.right(self.parent(x));
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.right(w)) == Color::Black {
                        let wl = self.left(w);
                        self.set_color(wl, Color::Black);
                        self.set_color(w, Color::Red);
                        self.right_rotate(w);
                        w = self.right(self.parent(x));
                    }
                    let p = self.parent(x);
                    self.set_color(w, self.color(p));
                    self.set_color(p, Color::Black);
                    let wr = self.right(w);
                    self.set_color(wr, Color::Black);
                    self.left_rotate(p);
                    x = self.root;
                }
            } else {
                let mut w = self.left(p);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.right_rotate(p);
                    w = self.left(self.parent(x));
                }
                if self.color(self.right(w)) == Color::Black
                    && self.color(self.left(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.left(w)) == Color::Black {
                        let wr = self.right(w);
                        self.set_color(wr, Color::Black);
                        self.set_color(w, Color::Red);
                        self.left_rotate(w);
                        w = self.left(self.parent(x));
                    }
                    let p = self.parent(x);
                    self.set_color(w, self.color(p));
                    self.set_color(p, Color::Black);
                    let wl = self.left(w);
                    self.set_color(wl, Color::Black);
                    self.right_rotate(p);
                    x = self.root;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    /// Unlink `z` from the tree and rebalance, returning its key.
    fn unlink(&mut self, z: NodeId) -> Option<K> {
        let mut removed_color = self.color(z);
        let x;

        if self.left(z).is_nil() {
            x = self.right(z);
            self.transplant(z, x);
        } else if self.right(z).is_nil() {
            x = self.left(z);
            self.transplant(z, x);
        } else {
            // Two children, the successor takes z's place.
            let y = self.minimum(self.right(z));
            removed_color = self.color(y);
            x = self.right(y);

            if self.parent(y) == z {
                self.arena[x].parent = y;
            } else {
                self.transplant(y, x);
                let zr = self.right(z);
                self.arena[y].right = zr;
                self.arena[zr].parent = y;
            }

            self.transplant(z, y);
            let zl = self.left(z);
            self.arena[y].left = zl;
            self.arena[zl].parent = y;
            self.set_color(y, self.color(z));
        }

        if removed_color == Color::Black {
            self.delete_fixup(x);
        }

        // The sentinel may have been used as a temporary parent anchor.
        self.arena[NodeId::NIL].parent = NodeId::NIL;
        self.len -= 1;
        self.arena.release(z)
    }

    /// Walk the tree checking every red-black invariant. Returns the black
    /// height of the tree (counting the sentinel) when all hold.
    pub fn check_invariants(&self) -> Result<usize, InvariantError>
    where
        K: Ord,
    {
        if self.color(NodeId::NIL) != Color::Black {
            return Err(InvariantError::RedSentinel);
        }
        if self.color(self.root) != Color::Black {
            return Err(InvariantError::RedRoot);
        }
        if !self.root.is_nil() && !self.parent(self.root).is_nil() {
            return Err(InvariantError::BrokenParentLink { depth: 0 });
        }
        let mut found = 0;
        let height = self.check_subtree(self.root, None, None, 0, &mut found)?;
        if found != self.len || self.arena.live() != self.len {
            return Err(InvariantError::LengthMismatch {
                expected: self.len,
                found,
            });
        }
        Ok(height)
    }

    fn check_subtree(
        &self,
        id: NodeId,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: usize,
        found: &mut usize,
    ) -> Result<usize, InvariantError>
    where
        K: Ord,
    {
        if id.is_nil() {
            return Ok(1);
        }
        *found += 1;
        let k = self.key(id);
        if lower.is_some_and(|l| k <= l) || upper.is_some_and(|u| k >= u) {
            return Err(InvariantError::OrderViolation { depth });
        }

        let (l, r) = (self.left(id), self.right(id));
        for child in [l, r] {
            if child.is_nil() {
                continue;
            }
            if self.parent(child) != id {
                return Err(InvariantError::BrokenParentLink { depth: depth + 1 });
            }
            if self.color(id) == Color::Red && self.color(child) == Color::Red {
                return Err(InvariantError::RedRedViolation { depth });
            }
        }

        let left = self.check_subtree(l, lower, Some(k), depth + 1, found)?;
        let right = self.check_subtree(r, Some(k), upper, depth + 1, found)?;
        if left != right {
            return Err(InvariantError::BlackHeightMismatch { depth, left, right });
        }
        Ok(left + usize::from(self.color(id) == Color::Black))
    }

    /// Verify the tree is a valid red-black tree. See [Self::check_invariants]
    /// for the reason when this is false.
    pub fn verify(&self) -> bool
    where
        K: Ord,
    {
        self.check_invariants().is_ok()
    }
}

impl<K: Ord> RbTree<K> {
    fn find<Q>(&self, k: &Q) -> NodeId
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut work = self.root;
        while !work.is_nil() {
            match k.cmp(self.key(work).borrow()) {
                Ordering::Less => work = self.left(work),
                Ordering::Greater => work = self.right(work),
                Ordering::Equal => return work,
            }
        }
        NodeId::NIL
    }

    /// Insert a key. Returns `false`, leaving the tree untouched, if an equal
    /// key is already present.
    pub fn insert(&mut self, key: K) -> bool {
        let mut parent = NodeId::NIL;
        let mut work = self.root;
        let mut ord = Ordering::Less;
        while !work.is_nil() {
            parent = work;
            ord = key.cmp(self.key(work));
            match ord {
                Ordering::Less => work = self.left(work),
                Ordering::Greater => work = self.right(work),
                Ordering::Equal => return false,
            }
        }

        let z = self.arena.alloc(key, parent);
        if parent.is_nil() {
            self.root = z;
        } else if ord == Ordering::Less {
            self.arena[parent].left = z;
        } else {
            self.arena[parent].right = z;
        }
        self.len += 1;
        self.insert_fixup(z);
        true
    }

    /// Assert if a key exists in the tree.
    pub fn contains<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        !self.find(k).is_nil()
    }

    /// Retrieve the stored key equal to `k`.
    pub fn get<Q>(&self, k: &Q) -> Option<&K>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let id = self.find(k);
        if id.is_nil() {
            None
        } else {
            Some(self.key(id))
        }
    }

    /// Remove a key, returning `true` if it was present.
    pub fn remove<Q>(&mut self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.take(k).is_some()
    }

    /// Remove a key, handing back the stored key if it was present.
    pub fn take<Q>(&mut self, k: &Q) -> Option<K>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let z = self.find(k);
        if z.is_nil() {
            None
        } else {
            self.unlink(z)
        }
    }

    /// Iterate over the keys `k` where `min <= k <= max`, in ascending order.
    pub fn range<'a, Q>(&'a self, min: &Q, max: &'a Q) -> RangeIter<'a, K, Q>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        RangeIter::new(self, min, max)
    }
}

impl<K: Debug> Debug for RbTree<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<K: Ord> FromIterator<K> for RbTree<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut tree = RbTree::new();
        tree.extend(iter);
        tree
    }
}

impl<K: Ord> Extend<K> for RbTree<K> {
    fn extend<I: IntoIterator<Item = K>>(&mut self, iter: I) {
        iter.into_iter().for_each(|k| {
            self.insert(k);
        });
    }
}

impl<'a, K> IntoIterator for &'a RbTree<K> {
    type Item = &'a K;
    type IntoIter = Iter<'a, K>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(feature = "serde")]
impl<K: serde::Serialize> serde::Serialize for RbTree<K> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.iter())
    }
}

#[cfg(feature = "serde")]
impl<'de, K> serde::Deserialize<'de> for RbTree<K>
where
    K: serde::Deserialize<'de> + Ord,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_seq(crate::utils::SetCollector::default())
    }
}
