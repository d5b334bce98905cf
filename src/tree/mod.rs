//! Tree overlay
//!
//! `Tree` is the immutable shape of a run: node identities plus parent and
//! ordered child links. `TreeOverlay` is the delivery surface a protocol
//! instance talks to, and `LocalOverlay` implements it in-process with
//! per-edge latency and fault injection.
use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::error::Result;
use crate::node::NodeId;
use crate::setup_error;

pub mod local;
pub mod overlay;

pub use local::{FrozenOverlayStats, LocalOverlay, OverlayStats};
pub use overlay::TreeOverlay;

#[derive(Clone, Debug, PartialEq, Eq)]
struct TreeNode {
    id: NodeId,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Clone, Debug)]
pub struct Tree {
    root: NodeId,
    nodes: BTreeMap<NodeId, TreeNode>,
}

impl Tree {
    /// A tree made of the root alone
    pub fn single(root: NodeId) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            root,
            TreeNode {
                id: root,
                parent: None,
                children: Vec::new(),
            },
        );
        Self { root, nodes }
    }

    /// Complete k-ary tree over ids `0..n`, rooted at 0
    pub fn k_ary(n: u32, k: u32) -> Result<Self> {
        if n == 0 {
            return Err(setup_error!("a tree needs at least one node"));
        }
        if k == 0 && n > 1 {
            return Err(setup_error!("branching must be positive for {} nodes", n));
        }
        let edges: Vec<(NodeId, NodeId)> = (1..n)
            .map(|i| (NodeId::new((i - 1) / k), NodeId::new(i)))
            .collect();
        Self::from_edges(NodeId::new(0), &edges)
    }

    /// Build a tree from `(parent, child)` edges. Children keep edge order.
    pub fn from_edges(root: NodeId, edges: &[(NodeId, NodeId)]) -> Result<Self> {
        let mut tree = Self::single(root);
        for &(parent, child) in edges {
            if child == root {
                return Err(setup_error!("root {} cannot have a parent", root));
            }
            if parent == child {
                return Err(setup_error!("node {} cannot be its own parent", child));
            }
            match tree.nodes.get(&child) {
                Some(existing) if existing.parent.is_some() => {
                    return Err(setup_error!("node {} has more than one parent", child));
                }
                Some(_) => {}
                None => {
                    tree.nodes.insert(
                        child,
                        TreeNode {
                            id: child,
                            parent: None,
                            children: Vec::new(),
                        },
                    );
                }
            }
            if let Some(node) = tree.nodes.get_mut(&child) {
                node.parent = Some(parent);
            }
            tree.nodes
                .entry(parent)
                .or_insert_with(|| TreeNode {
                    id: parent,
                    parent: None,
                    children: Vec::new(),
                })
                .children
                .push(child);
        }

        let reached = tree.reachable_from(root, &HashSet::new());
        if reached.len() != tree.nodes.len() {
            return Err(setup_error!(
                "{} of {} nodes are not connected to root {}",
                tree.nodes.len() - reached.len(),
                tree.nodes.len(),
                root
            ));
        }
        Ok(tree)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(&node).and_then(|n| n.parent)
    }

    pub fn children_of(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(&node)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// True when `a` and `b` share a tree edge
    pub fn are_neighbors(&self, a: NodeId, b: NodeId) -> bool {
        self.parent_of(a) == Some(b) || self.parent_of(b) == Some(a)
    }

    pub fn depth(&self, node: NodeId) -> Option<usize> {
        let mut current = self.nodes.get(&node)?;
        let mut depth = 0;
        while let Some(parent) = current.parent {
            current = self.nodes.get(&parent)?;
            depth += 1;
        }
        Some(depth)
    }

    pub fn height(&self) -> usize {
        self.node_ids()
            .filter_map(|id| self.depth(id))
            .max()
            .unwrap_or(0)
    }

    /// Non-root nodes a lossless run can reach when `blocked` nodes never take part
    pub fn reachable_count(&self, blocked: &HashSet<NodeId>) -> usize {
        if blocked.contains(&self.root) {
            return 0;
        }
        self.reachable_from(self.root, blocked).len().saturating_sub(1)
    }

    // Breadth-first walk that does not enter blocked nodes
    fn reachable_from(&self, start: NodeId, blocked: &HashSet<NodeId>) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if blocked.contains(&id) || !seen.insert(id) {
                continue;
            }
            order.push(id);
            queue.extend(self.children_of(id).iter().copied());
        }
        order
    }
}
