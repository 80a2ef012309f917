//! Persistent tree of the UI state streamed by the host.
//!
//! Every mutating operation takes `&self` and returns a new [`SessionTree`].
//! Untouched subtrees are shared between the old and the new snapshot through
//! `Arc`, and the path to the modified node is copied on write
//! (`Arc::make_mut`). A reader holding an older snapshot therefore never sees
//! a partially applied delta.
//!
//! Layout:
//!
//! ```text
//! roots[RootKey("main")]          <- one container per owning script
//!   ├─ [0] leaf      run=r2
//!   ├─ [1] container run=r2 fragment=F
//!   │    └─ [1,0] leaf run=r1 fragment=F   <- stale once F reruns
//!   └─ [2] leaf      run=r1                <- stale once a full run completes
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::trace;

use crate::protocol::{BlockPayload, Delta, DeltaOp, ElementPayload, MessageMetadata};

mod node;
mod stale;

pub use node::{ContainerNode, LeafNode, Node, NodeId, NodeStamp, RootKey};
pub use stale::{ScriptRunState, is_stale};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("delta has an empty path")]
    EmptyPath,
    #[error("invalid delta path {path:?}: {reason}")]
    InvalidPath {
        path: Vec<usize>,
        reason: &'static str,
    },
    #[error("unrecognized delta operation")]
    UnrecognizedDelta,
}

const ROOT_BLOCK_KIND: &str = "root";

#[derive(Debug, Clone, Default)]
pub struct SessionTree {
    roots: BTreeMap<RootKey, Arc<ContainerNode>>,
    active_root: RootKey,
    next_id: u64,
}

impl SessionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_active_root(key: RootKey) -> Self {
        Self {
            active_root: key,
            ..Self::default()
        }
    }

    pub fn active_root(&self) -> &RootKey {
        &self.active_root
    }

    /// Switches the active root. Nodes under other roots are kept until
    /// [`SessionTree::clear_root`] or [`SessionTree::clear_inactive_roots`]
    /// drops them.
    pub fn set_active_root(&self, key: RootKey) -> SessionTree {
        let mut next = self.clone();
        next.active_root = key;
        next
    }

    pub fn clear_root(&self, key: &RootKey) -> SessionTree {
        let mut next = self.clone();
        next.roots.remove(key);
        next
    }

    /// Drops every root except the active one and those holding a node
    /// written by `run_id`.
    pub fn clear_inactive_roots(&self, run_id: &str) -> SessionTree {
        let mut next = self.clone();
        next.roots.retain(|key, root| {
            if key == &self.active_root {
                return true;
            }
            let mut written = false;
            collect(&root.children, &mut |node| {
                written |= node.stamp().run_id == run_id;
            });
            written
        });
        next
    }

    pub fn root(&self, key: &RootKey) -> Option<&ContainerNode> {
        self.roots.get(key).map(|root| root.as_ref())
    }

    pub fn root_keys(&self) -> impl Iterator<Item = &RootKey> {
        self.roots.keys()
    }

    /// Top-level children of the active root.
    pub fn children(&self) -> &[Node] {
        self.roots
            .get(&self.active_root)
            .map(|root| root.children.as_slice())
            .unwrap_or(&[])
    }

    /// Node at `path` below the active root.
    pub fn get(&self, path: &[usize]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        let mut node = self.children().get(*first)?;
        for index in rest {
            node = node.children().get(*index)?;
        }
        Some(node)
    }

    /// Applies one delta addressed by `metadata.delta_path` and returns the
    /// resulting snapshot.
    ///
    /// The root is chosen by `metadata.active_script_hash`, falling back to
    /// the active root. Written nodes are stamped with `run_id` and the
    /// metadata's fragment id.
    pub fn apply_delta(
        &self,
        run_id: &str,
        delta: &Delta,
        metadata: &MessageMetadata,
    ) -> Result<SessionTree, TreeError> {
        let path = metadata.delta_path.as_slice();
        if path.is_empty() {
            return Err(TreeError::EmptyPath);
        }
        if matches!(delta.op, DeltaOp::Unknown) {
            return Err(TreeError::UnrecognizedDelta);
        }

        let owner = metadata
            .active_script_hash
            .as_ref()
            .map(RootKey::new)
            .unwrap_or_else(|| self.active_root.clone());
        let stamp = NodeStamp::new(owner.clone(), run_id, metadata.fragment_id.clone());

        let mut next = self.clone();
        let mut ids = IdAllocator {
            next: next.next_id,
        };
        let root = next.roots.entry(owner).or_insert_with(|| {
            Arc::new(ContainerNode::new(
                ids.allocate(),
                stamp.clone(),
                BlockPayload::new(ROOT_BLOCK_KIND),
            ))
        });
        let written = write_at(Arc::make_mut(root), path, 0, &delta.op, &stamp, &mut ids)?;
        next.next_id = ids.next;

        trace!(
            target = "beach_sync::tree",
            run_id,
            path = ?path,
            op = delta.op.kind(),
            node = %written,
            "applied delta"
        );
        Ok(next)
    }

    /// Removes nodes left behind by earlier runs under the active root.
    ///
    /// With no fragments every node whose run id differs from `run_id` is
    /// dropped together with its subtree. During a fragment run only nodes
    /// belonging to one of `fragment_ids_this_run` are candidates; everything
    /// else is kept and its children are examined. The root itself is never
    /// removed.
    pub fn clear_stale_nodes(&self, run_id: &str, fragment_ids_this_run: &[String]) -> SessionTree {
        let mut next = self.clone();
        if let Some(root) = next.roots.get_mut(&self.active_root) {
            if let Some(children) = prune_children(&root.children, run_id, fragment_ids_this_run) {
                Arc::make_mut(root).children = children;
            }
        }
        next
    }

    /// Ids of the active root's nodes that are stale for the given run state.
    pub fn stale_node_ids(
        &self,
        run_state: ScriptRunState,
        current_run_id: &str,
        fragment_ids_this_run: &[String],
    ) -> Vec<NodeId> {
        self.walk()
            .into_iter()
            .filter(|(_, node)| {
                is_stale(node.stamp(), run_state, current_run_id, fragment_ids_this_run)
            })
            .map(|(_, node)| node.id())
            .collect()
    }

    /// Depth-first, render-order traversal of the active root.
    pub fn walk(&self) -> Vec<(Vec<usize>, &Node)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        walk_children(self.children(), &mut path, &mut out);
        out
    }

    /// Ids of every node below every root.
    pub fn live_node_ids(&self) -> BTreeSet<NodeId> {
        let mut ids = BTreeSet::new();
        for root in self.roots.values() {
            collect(&root.children, &mut |node| {
                ids.insert(node.id());
            });
        }
        ids
    }

    /// Widget ids of every leaf below every root.
    pub fn widget_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for root in self.roots.values() {
            collect(&root.children, &mut |node| {
                if let Some(widget_id) = node.as_leaf().and_then(|leaf| leaf.element.widget_id.as_ref()) {
                    ids.insert(widget_id.clone());
                }
            });
        }
        ids
    }

    pub fn node_count(&self) -> usize {
        self.live_node_ids().len()
    }
}

struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    fn allocate(&mut self) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        id
    }
}

fn write_at(
    container: &mut ContainerNode,
    path: &[usize],
    depth: usize,
    op: &DeltaOp,
    stamp: &NodeStamp,
    ids: &mut IdAllocator,
) -> Result<NodeId, TreeError> {
    let index = path[depth];
    if depth + 1 < path.len() {
        return match container.children.get_mut(index) {
            Some(Node::Container(child)) => {
                write_at(Arc::make_mut(child), path, depth + 1, op, stamp, ids)
            }
            Some(Node::Leaf(_)) => Err(invalid(path, "intermediate node is not a container")),
            None => Err(invalid(path, "intermediate container does not exist")),
        };
    }

    let node = match op {
        DeltaOp::NewElement { element } => Node::Leaf(Arc::new(LeafNode {
            id: ids.allocate(),
            stamp: stamp.clone(),
            element: element.clone(),
        })),
        DeltaOp::AddBlock { block } => Node::Container(Arc::new(ContainerNode::new(
            ids.allocate(),
            stamp.clone(),
            block.clone(),
        ))),
        DeltaOp::AppendData { rows } => {
            return match container.children.get_mut(index) {
                Some(Node::Leaf(leaf)) => {
                    let leaf = Arc::make_mut(leaf);
                    leaf.element.rows.extend(rows.iter().cloned());
                    leaf.stamp = stamp.clone();
                    Ok(leaf.id)
                }
                Some(Node::Container(_)) => Err(invalid(path, "append target is a container")),
                None => Err(invalid(path, "append target does not exist")),
            };
        }
        DeltaOp::Unknown => return Err(TreeError::UnrecognizedDelta),
    };

    let id = node.id();
    let children = &mut container.children;
    if index < children.len() {
        children[index] = node;
    } else {
        while children.len() < index {
            children.push(Node::Leaf(Arc::new(LeafNode {
                id: ids.allocate(),
                stamp: stamp.clone(),
                element: ElementPayload::empty(),
            })));
        }
        children.push(node);
    }
    Ok(id)
}

fn invalid(path: &[usize], reason: &'static str) -> TreeError {
    TreeError::InvalidPath {
        path: path.to_vec(),
        reason,
    }
}

/// Returns `None` when nothing under `children` changed.
fn prune_children(children: &[Node], run_id: &str, fragments: &[String]) -> Option<Vec<Node>> {
    let mut changed = false;
    let mut kept = Vec::with_capacity(children.len());
    for child in children {
        match prune_node(child, run_id, fragments) {
            Pruned::Unchanged => kept.push(child.clone()),
            Pruned::Replaced(node) => {
                changed = true;
                kept.push(node);
            }
            Pruned::Removed => changed = true,
        }
    }
    changed.then_some(kept)
}

enum Pruned {
    Unchanged,
    Replaced(Node),
    Removed,
}

fn prune_node(node: &Node, run_id: &str, fragments: &[String]) -> Pruned {
    let stamp = node.stamp();
    let candidate = fragments.is_empty()
        || stamp
            .fragment_id
            .as_ref()
            .map(|id| fragments.contains(id))
            .unwrap_or(false);
    if candidate && stamp.run_id != run_id {
        return Pruned::Removed;
    }
    match node {
        Node::Leaf(_) => Pruned::Unchanged,
        Node::Container(container) => match prune_children(&container.children, run_id, fragments) {
            None => Pruned::Unchanged,
            Some(children) => {
                let mut replacement = ContainerNode::clone(container);
                replacement.children = children;
                Pruned::Replaced(Node::Container(Arc::new(replacement)))
            }
        },
    }
}

fn walk_children<'a>(
    children: &'a [Node],
    path: &mut Vec<usize>,
    out: &mut Vec<(Vec<usize>, &'a Node)>,
) {
    for (index, child) in children.iter().enumerate() {
        path.push(index);
        out.push((path.clone(), child));
        walk_children(child.children(), path, out);
        path.pop();
    }
}

fn collect(children: &[Node], visit: &mut dyn FnMut(&Node)) {
    for child in children {
        visit(child);
        collect(child.children(), visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn element(text: &str) -> Delta {
        Delta::new_element(ElementPayload::new("text", json!({ "text": text })))
    }

    fn at(path: &[usize]) -> MessageMetadata {
        MessageMetadata::at_path(path.to_vec())
    }

    fn at_in(path: &[usize], fragment: &str) -> MessageMetadata {
        at(path).in_fragment(fragment)
    }

    fn text_of(node: &Node) -> String {
        node.as_leaf().unwrap().element.body["text"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn sequential_paths_append_in_insertion_order() {
        let mut tree = SessionTree::new();
        for (index, text) in ["a", "b", "c"].into_iter().enumerate() {
            tree = tree.apply_delta("r1", &element(text), &at(&[index])).unwrap();
        }
        let texts: Vec<String> = tree.children().iter().map(text_of).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn applying_does_not_touch_previous_snapshot() {
        let before = SessionTree::new()
            .apply_delta("r1", &element("a"), &at(&[0]))
            .unwrap();
        let after = before.apply_delta("r2", &element("b"), &at(&[0])).unwrap();

        assert_eq!(text_of(&before.children()[0]), "a");
        assert_eq!(before.children()[0].run_id(), "r1");
        assert_eq!(text_of(&after.children()[0]), "b");
        assert_eq!(after.children()[0].run_id(), "r2");
    }

    #[test]
    fn untouched_siblings_are_shared_between_snapshots() {
        let before = SessionTree::new()
            .apply_delta("r1", &element("a"), &at(&[0]))
            .unwrap()
            .apply_delta("r1", &element("b"), &at(&[1]))
            .unwrap();
        let after = before.apply_delta("r1", &element("c"), &at(&[1])).unwrap();
        assert!(before.children()[0].shares_allocation(&after.children()[0]));
        assert!(!before.children()[1].shares_allocation(&after.children()[1]));
    }

    #[test]
    fn replaying_deltas_is_deterministic() {
        let deltas = [
            (Delta::add_block(BlockPayload::new("column")), at(&[0])),
            (element("x"), at(&[0, 0])),
            (element("y"), at(&[1])),
            (element("z"), at(&[0, 0])),
        ];
        let build = || {
            deltas.iter().fold(SessionTree::new(), |tree, (delta, metadata)| {
                tree.apply_delta("r1", delta, metadata).unwrap()
            })
        };
        let (first, second) = (build(), build());
        let shape = |tree: &SessionTree| {
            tree.walk()
                .into_iter()
                .map(|(path, node)| (path, node.id(), node.is_container()))
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&first), shape(&second));
    }

    #[test]
    fn replacing_a_container_drops_its_subtree() {
        let tree = SessionTree::new()
            .apply_delta("r1", &Delta::add_block(BlockPayload::new("column")), &at(&[0]))
            .unwrap()
            .apply_delta("r1", &element("inner"), &at(&[0, 0]))
            .unwrap()
            .apply_delta("r2", &element("flat"), &at(&[0]))
            .unwrap();
        let node = tree.get(&[0]).unwrap();
        assert!(!node.is_container());
        assert_eq!(node.run_id(), "r2");
        assert!(tree.get(&[0, 0]).is_none());
    }

    #[test]
    fn writing_past_the_end_pads_with_empty_leaves() {
        let tree = SessionTree::new()
            .apply_delta("r1", &element("late"), &at(&[2]))
            .unwrap();
        assert_eq!(tree.children().len(), 3);
        assert_eq!(tree.children()[0].as_leaf().unwrap().element.kind, "empty");
        assert_eq!(text_of(&tree.children()[2]), "late");
    }

    #[test]
    fn invalid_intermediate_paths_are_rejected() {
        let tree = SessionTree::new()
            .apply_delta("r1", &element("leaf"), &at(&[0]))
            .unwrap();
        let err = tree.apply_delta("r1", &element("x"), &at(&[0, 0])).unwrap_err();
        assert!(matches!(err, TreeError::InvalidPath { .. }));
        let err = tree.apply_delta("r1", &element("x"), &at(&[4, 0])).unwrap_err();
        assert!(matches!(err, TreeError::InvalidPath { .. }));
        let err = tree.apply_delta("r1", &element("x"), &at(&[])).unwrap_err();
        assert_eq!(err, TreeError::EmptyPath);
    }

    #[test]
    fn unrecognized_operation_is_fatal() {
        let delta = Delta { op: DeltaOp::Unknown };
        let err = SessionTree::new().apply_delta("r1", &delta, &at(&[0])).unwrap_err();
        assert_eq!(err, TreeError::UnrecognizedDelta);
    }

    #[test]
    fn append_data_extends_leaf_and_restamps_it() {
        let tree = SessionTree::new()
            .apply_delta("r1", &element("table"), &at(&[0]))
            .unwrap();
        let id = tree.children()[0].id();
        let tree = tree
            .apply_delta("r2", &Delta::append_data(vec![json!([1, 2])]), &at_in(&[0], "F"))
            .unwrap();
        let leaf = tree.children()[0].as_leaf().unwrap();
        assert_eq!(leaf.id, id);
        assert_eq!(leaf.element.rows, vec![json!([1, 2])]);
        assert_eq!(leaf.stamp.run_id, "r2");
        assert_eq!(leaf.stamp.fragment_id.as_deref(), Some("F"));

        let err = tree
            .apply_delta("r2", &Delta::append_data(vec![]), &at(&[3]))
            .unwrap_err();
        assert!(matches!(err, TreeError::InvalidPath { .. }));
    }

    #[test]
    fn full_run_cleanup_drops_nodes_from_older_runs() {
        let tree = SessionTree::new()
            .apply_delta("r1", &element("old"), &at(&[0]))
            .unwrap()
            .apply_delta("r1", &element("old tail"), &at(&[1]))
            .unwrap()
            .apply_delta("r2", &element("new"), &at(&[0]))
            .unwrap();
        let cleaned = tree.clear_stale_nodes("r2", &[]);
        let texts: Vec<String> = cleaned.children().iter().map(text_of).collect();
        assert_eq!(texts, vec!["new"]);
        assert_eq!(tree.children().len(), 2);
    }

    #[test]
    fn fragment_cleanup_keeps_nodes_outside_the_fragment() {
        let fragment = vec!["F".to_string()];
        let tree = SessionTree::new()
            .apply_delta("r1", &element("outside"), &at(&[0]))
            .unwrap()
            .apply_delta("r1", &Delta::add_block(BlockPayload::new("fragment")), &at(&[1]))
            .unwrap()
            .apply_delta("r1", &element("stale in F"), &at_in(&[1, 0], "F"))
            .unwrap()
            .apply_delta("r1", &element("also stale in F"), &at_in(&[1, 1], "F"))
            .unwrap()
            .apply_delta("r2", &element("fresh in F"), &at_in(&[1, 0], "F"))
            .unwrap();

        let cleaned = tree.clear_stale_nodes("r2", &fragment);
        assert_eq!(text_of(cleaned.get(&[0]).unwrap()), "outside");
        let block = cleaned.get(&[1]).unwrap();
        assert_eq!(block.children().len(), 1);
        assert_eq!(text_of(&block.children()[0]), "fresh in F");
    }

    #[test]
    fn cleanup_with_nothing_stale_shares_the_root() {
        let tree = SessionTree::new()
            .apply_delta("r1", &element("a"), &at(&[0]))
            .unwrap();
        let cleaned = tree.clear_stale_nodes("r1", &[]);
        assert!(tree.children()[0].shares_allocation(&cleaned.children()[0]));
        assert_eq!(tree.live_node_ids(), cleaned.live_node_ids());
    }

    #[test]
    fn roots_are_kept_until_explicitly_cleared() {
        let main = RootKey::new("main");
        let page = RootKey::new("page_two");
        let tree = SessionTree::with_active_root(main.clone())
            .apply_delta("r1", &element("main body"), &at(&[0]))
            .unwrap()
            .set_active_root(page.clone())
            .apply_delta("r2", &element("page body"), &at(&[0]))
            .unwrap();

        assert_eq!(tree.root(&main).unwrap().children.len(), 1);
        assert_eq!(text_of(&tree.children()[0]), "page body");

        let cleaned = tree.clear_stale_nodes("r2", &[]);
        assert_eq!(cleaned.root(&main).unwrap().children.len(), 1);

        let cleared = cleaned.clear_root(&main);
        assert!(cleared.root(&main).is_none());
        assert_eq!(cleared.root_keys().collect::<Vec<_>>(), vec![&page]);
    }

    #[test]
    fn inactive_roots_go_unless_written_this_run() {
        let main = RootKey::new("main");
        let page = RootKey::new("page_two");
        let tree = SessionTree::with_active_root(main.clone())
            .apply_delta(
                "r1",
                &Delta::new_element(ElementPayload::widget("slider", "w-old", json!({}))),
                &at(&[0]),
            )
            .unwrap()
            .set_active_root(page.clone())
            .apply_delta("r2", &element("page body"), &at(&[0]))
            .unwrap()
            .apply_delta("r2", &element("nav"), &at(&[0]).owned_by("nav"))
            .unwrap();

        let cleared = tree.clear_inactive_roots("r2");
        assert!(cleared.root(&main).is_none());
        assert!(cleared.root(&RootKey::new("nav")).is_some());
        assert_eq!(text_of(&cleared.children()[0]), "page body");
        assert!(!cleared.widget_ids().contains("w-old"));
        assert!(tree.widget_ids().contains("w-old"));
    }

    #[test]
    fn owner_from_metadata_selects_the_root() {
        let tree = SessionTree::with_active_root(RootKey::new("main"))
            .apply_delta("r1", &element("elsewhere"), &at(&[0]).owned_by("other"))
            .unwrap();
        assert!(tree.children().is_empty());
        let other = tree.root(&RootKey::new("other")).unwrap();
        assert_eq!(other.children[0].stamp().owner, RootKey::new("other"));
    }

    #[test]
    fn stale_ids_and_widget_ids_follow_node_identity() {
        let tree = SessionTree::new()
            .apply_delta(
                "r1",
                &Delta::new_element(ElementPayload::widget("slider", "w-1", json!({}))),
                &at(&[0]),
            )
            .unwrap()
            .apply_delta("r2", &element("fresh"), &at(&[1]))
            .unwrap();
        let slider = tree.children()[0].id();

        let stale = tree.stale_node_ids(ScriptRunState::Running, "r2", &[]);
        assert_eq!(stale, vec![slider]);
        assert!(tree.widget_ids().contains("w-1"));

        let cleaned = tree.clear_stale_nodes("r2", &[]);
        assert!(!cleaned.live_node_ids().contains(&slider));
        assert!(cleaned.widget_ids().is_empty());
        // The survivor moved from index 1 to 0 but kept its id.
        assert_eq!(cleaned.children()[0].id(), tree.children()[1].id());
    }
}
