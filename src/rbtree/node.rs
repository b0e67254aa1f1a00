//! Node storage for the red-black tree.
//!
//! Nodes live in an arena and refer to each other through [NodeId] handles
//! instead of pointers, so parent/child cycles never become ownership cycles.
//! Slot 0 of every arena is the tree's own sentinel.

use std::ops::{Index, IndexMut};

/// The color of a node in the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Color {
    /// Red nodes may not have red children.
    Red,
    /// Black nodes count towards the black-height of a path.
    Black,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(usize);

impl NodeId {
    /// The sentinel. Always black, never holds a key.
    pub(crate) const NIL: NodeId = NodeId(0);

    #[inline(always)]
    pub(crate) fn is_nil(self) -> bool {
        self == Self::NIL
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Node<K> {
    // None only for the sentinel and for freed slots.
    pub(crate) key: Option<K>,
    pub(crate) color: Color,
    pub(crate) left: NodeId,
    pub(crate) right: NodeId,
    pub(crate) parent: NodeId,
}

impl<K> Node<K> {
    fn sentinel() -> Self {
        Node {
            key: None,
            color: Color::Black,
            left: NodeId::NIL,
            right: NodeId::NIL,
            parent: NodeId::NIL,
        }
    }

    fn new(key: K, parent: NodeId) -> Self {
        Node {
            key: Some(key),
            color: Color::Red,
            left: NodeId::NIL,
            right: NodeId::NIL,
            parent,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Arena<K> {
    nodes: Vec<Node<K>>,
    free: Vec<NodeId>,
}

impl<K> Arena<K> {
    pub(crate) fn new() -> Self {
        Self::with_capacity(0)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity + 1);
        nodes.push(Node::sentinel());
        Arena {
            nodes,
            free: Vec::new(),
        }
    }

    /// Place a new red node holding `key` below `parent`, recycling a freed
    /// slot when one is available.
    pub(crate) fn alloc(&mut self, key: K, parent: NodeId) -> NodeId {
        let node = Node::new(key, parent);
        match self.free.pop() {
            Some(id) => {
                debug_assert!(self.nodes[id.0].key.is_none());
                self.nodes[id.0] = node;
                id
            }
            None => {
                self.nodes.push(node);
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    /// Detach the slot, handing back the key it held. The slot is unlinked
    /// by the caller before this is called.
    pub(crate) fn release(&mut self, id: NodeId) -> Option<K> {
        debug_assert!(!id.is_nil());
        let node = &mut self.nodes[id.0];
        let key = node.key.take();
        node.left = NodeId::NIL;
        node.right = NodeId::NIL;
        node.parent = NodeId::NIL;
        node.color = Color::Black;
        self.free.push(id);
        key
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.truncate(1);
        self.nodes[0] = Node::sentinel();
        self.free.clear();
    }

    /// Number of slots in use, sentinel excluded.
    pub(crate) fn live(&self) -> usize {
        self.nodes.len() - 1 - self.free.len()
    }
}

impl<K> Index<NodeId> for Arena<K> {
    type Output = Node<K>;

    #[inline(always)]
    fn index(&self, id: NodeId) -> &Node<K> {
        &self.nodes[id.0]
    }
}

impl<K> IndexMut<NodeId> for Arena<K> {
    #[inline(always)]
    fn index_mut(&mut self, id: NodeId) -> &mut Node<K> {
        &mut self.nodes[id.0]
    }
}
