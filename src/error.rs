//! Error types for the tree and its cursors.
//!
//! Lock acquisition failure is never an error here: bounded and async waits
//! report it as `None` or `false`.

use thiserror::Error;

/// Errors reported by a [LazyCursor](crate::tree::LazyCursor).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CursorError {
    /// `current` was called before the first successful `advance`.
    #[error("cursor is not positioned on a key")]
    NotPositioned,

    /// The cursor walked past the last key and gave up its read lock.
    #[error("cursor is exhausted")]
    Exhausted,

    /// The cursor was released before it was exhausted.
    #[error("cursor has been released")]
    Released,

    /// Cursors can not be rewound, the tree may have changed shape since the
    /// cursor began. Create a new cursor instead.
    #[error("cursor restart is not supported, create a new cursor")]
    RestartNotSupported,
}

/// A broken red-black tree invariant, as found by
/// [RbTree::check_invariants](crate::rbtree::RbTree::check_invariants).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantError {
    /// The root node is red.
    #[error("root node is red")]
    RedRoot,

    /// The sentinel was recolored red.
    #[error("sentinel node is red")]
    RedSentinel,

    /// A red node has a red child.
    #[error("red node at depth {depth} has a red child")]
    RedRedViolation {
        /// Depth of the offending parent, root is 0.
        depth: usize,
    },

    /// Two paths from the same node hold different numbers of black nodes.
    #[error("black height mismatch at depth {depth}: left {left}, right {right}")]
    BlackHeightMismatch {
        /// Depth of the node whose subtrees disagree.
        depth: usize,
        /// Black height of the left subtree.
        left: usize,
        /// Black height of the right subtree.
        right: usize,
    },

    /// A key is out of order relative to its ancestors.
    #[error("key at depth {depth} violates search order")]
    OrderViolation {
        /// Depth of the misplaced key.
        depth: usize,
    },

    /// A child does not point back at its parent.
    #[error("child at depth {depth} does not link back to its parent")]
    BrokenParentLink {
        /// Depth of the child.
        depth: usize,
    },

    /// The node count does not match the tracked length.
    #[error("tree holds {found} nodes but tracks a length of {expected}")]
    LengthMismatch {
        /// The tracked length.
        expected: usize,
        /// Nodes reachable from the root.
        found: usize,
    },
}

/// Reasons a [ConcurrentRbTreeBuilder](crate::tree::ConcurrentRbTreeBuilder)
/// can not build a tree.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A dedicated worker pool needs at least one thread.
    #[error("parallelism must be at least 1")]
    ZeroParallelism,

    /// The dedicated worker pool could not be started.
    #[error("failed to start the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
