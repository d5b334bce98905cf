/// Commands delivered to a node's dispatch loop.
use crate::node::NodeId;

use super::CountPacket;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    /// Begin a counting run under `run_id` (root only)
    Start { run_id: u64 },
    /// The host is done with this node; leave the dispatch loop
    Stop,
    /// A packet arrived over the tree edge from `from`
    PacketReceived { from: NodeId, packet: CountPacket },
}
