//! Overlay trait for tree-edge communication
//!
//! A protocol instance only ever talks to its parent and its children. The
//! overlay owns node identity, the parent/child relationships and the wire
//! format; delivery is reliable and in order per edge.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::node::NodeId;
use crate::protocol::{CountPacket, NodeCommand};

#[async_trait]
pub trait TreeOverlay: Send + Sync {
    /// Root of the tree this overlay spans
    fn root(&self) -> NodeId;

    /// Whether `node` is part of the tree
    fn contains(&self, node: NodeId) -> bool;

    /// Parent link, `None` for the root
    fn parent_of(&self, node: NodeId) -> Option<NodeId>;

    /// Ordered child links
    fn children_of(&self, node: NodeId) -> Vec<NodeId>;

    /// Register the inbox packets for `node` are delivered to. The overlay
    /// never keeps an inbox open on its own.
    fn attach(&self, node: NodeId, inbox: mpsc::WeakSender<NodeCommand>) -> Result<()>;

    /// Stop delivering to `node`; packets already in flight are discarded
    fn detach(&self, node: NodeId);

    /// Send a packet along the edge `from -> to`
    async fn send_to_neighbor(&self, from: NodeId, to: NodeId, packet: &CountPacket)
        -> Result<()>;
}
