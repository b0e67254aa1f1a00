//! crbtree - a Concurrently accessible Red-Black Tree
//!
//! This crate provides an ordered set that many threads and async tasks can share. It is
//! a classic red-black tree guarded by a reader-writer lock: any number of readers may
//! search and enumerate the tree at once, while writers take turns.
//!
//! There are several ways in:
//!
//! * Blocking operations ([ConcurrentRbTree::insert], [ConcurrentRbTree::search],
//!   [ConcurrentRbTree::delete]) which wait for the lock as long as it takes.
//! * Async operations (`insert_async` and friends) which suspend the task rather than the
//!   thread, and give up after a bounded number of timed attempts or on cancellation.
//! * Bulk operations (`parallel_insert`, `parallel_search`, `parallel_delete`,
//!   `parallel_traverse`) which fan out across a rayon pool.
//! * [ConcurrentRbTree::batch_operation], which applies several changes under one write
//!   lock so others see all or none of them.
//! * Enumeration, either as an eager [ConcurrentRbTree::snapshot] or through a
//!   [LazyCursor] that holds the read lock while it walks.
//!
//! The locks are not fair. A tree under constant read load may starve its writers.
//!
//! The single threaded engine, [RbTree], and the locks in [lock] are usable on their own.
//!
//! # Features
//!
//! * `serde` - serialize trees as ordered sequences

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]
#![allow(clippy::needless_lifetimes)]

pub mod error;
pub mod lock;
pub mod rbtree;
pub mod tree;

// Shared helpers, not part of the API.
mod utils;

pub use error::{BuildError, CursorError, InvariantError};
pub use lock::{CancelToken, WaitOptions};
pub use rbtree::RbTree;
pub use tree::{ConcurrentRbTree, ConcurrentRbTreeBuilder, LazyCursor};
