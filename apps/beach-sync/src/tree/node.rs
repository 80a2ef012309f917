use std::fmt;
use std::sync::Arc;

use crate::protocol::{BlockPayload, ElementPayload};

/// Stable node identity. Allocated once per created node and never reused
/// within a tree lineage, so it survives sibling insertion and removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Owning top-level script identity. Each key has its own root container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RootKey(pub String);

impl RootKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provenance recorded when a delta creates or rewrites a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStamp {
    pub owner: RootKey,
    pub run_id: String,
    pub fragment_id: Option<String>,
}

impl NodeStamp {
    pub fn new(owner: RootKey, run_id: impl Into<String>, fragment_id: Option<String>) -> Self {
        Self {
            owner,
            run_id: run_id.into(),
            fragment_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeafNode {
    pub id: NodeId,
    pub stamp: NodeStamp,
    pub element: ElementPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerNode {
    pub id: NodeId,
    pub stamp: NodeStamp,
    pub block: BlockPayload,
    pub children: Vec<Node>,
}

impl ContainerNode {
    pub fn new(id: NodeId, stamp: NodeStamp, block: BlockPayload) -> Self {
        Self {
            id,
            stamp,
            block,
            children: Vec::new(),
        }
    }
}

/// A node in a snapshot. Subtrees are reference counted so successive
/// snapshots share everything a delta did not touch.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(Arc<LeafNode>),
    Container(Arc<ContainerNode>),
}

impl Node {
    pub fn id(&self) -> NodeId {
        match self {
            Node::Leaf(leaf) => leaf.id,
            Node::Container(container) => container.id,
        }
    }

    pub fn stamp(&self) -> &NodeStamp {
        match self {
            Node::Leaf(leaf) => &leaf.stamp,
            Node::Container(container) => &container.stamp,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.stamp().run_id
    }

    pub fn fragment_id(&self) -> Option<&str> {
        self.stamp().fragment_id.as_deref()
    }

    pub fn children(&self) -> &[Node] {
        match self {
            Node::Leaf(_) => &[],
            Node::Container(container) => &container.children,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            Node::Container(_) => None,
        }
    }

    pub fn as_container(&self) -> Option<&ContainerNode> {
        match self {
            Node::Leaf(_) => None,
            Node::Container(container) => Some(container),
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Node::Container(_))
    }

    /// Whether two handles point at the same allocation.
    pub fn shares_allocation(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Leaf(a), Node::Leaf(b)) => Arc::ptr_eq(a, b),
            (Node::Container(a), Node::Container(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
