//! In-process tree overlay
//!
//! Every directed tree edge gets its own link task fed by an unbounded queue.
//! A packet is encoded on send, stamped with `now + link_latency`, and the
//! link task decodes and hands it to the destination inbox once that instant
//! is reached. One queue per edge keeps delivery in order on that edge.
//!
//! Fault injection:
//! - `unresponsive` nodes accept sends but never see the packets (silent drop)
//! - `unreachable` nodes make every send to them fail with a transport error
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::overlay::TreeOverlay;
use super::Tree;
use crate::error::{CountError, Result};
use crate::node::NodeId;
use crate::protocol::{CountPacket, NodeCommand};
use crate::settings::SimulationSettings;
use crate::{setup_error, transport_error};

type Inboxes = Arc<RwLock<HashMap<NodeId, mpsc::WeakSender<NodeCommand>>>>;

/// Statistics for the overlay
#[derive(Debug, Default)]
pub struct OverlayStats {
    pub packets_sent: AtomicU64,
    pub packets_delivered: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub send_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FrozenOverlayStats {
    pub packets_sent: u64,
    pub packets_delivered: u64,
    pub packets_dropped: u64,
    pub send_errors: u64,
}

impl OverlayStats {
    pub fn freeze(&self) -> FrozenOverlayStats {
        FrozenOverlayStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_delivered: self.packets_delivered.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct InFlight {
    data: Vec<u8>,
    deliver_at: Instant,
}

pub struct LocalOverlay {
    tree: Arc<Tree>,
    link_latency: Duration,
    unresponsive: HashSet<NodeId>,
    unreachable: HashSet<NodeId>,
    inboxes: Inboxes,
    links: Mutex<HashMap<(NodeId, NodeId), mpsc::UnboundedSender<InFlight>>>,
    stats: Arc<OverlayStats>,
}

impl std::fmt::Debug for LocalOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalOverlay")
            .field("root", &self.tree.root())
            .field("nodes", &self.tree.len())
            .field("link_latency", &self.link_latency)
            .field("unresponsive", &self.unresponsive)
            .field("unreachable", &self.unreachable)
            .finish()
    }
}

impl LocalOverlay {
    pub fn new(tree: Arc<Tree>, link_latency: Duration) -> Self {
        Self {
            tree,
            link_latency,
            unresponsive: HashSet::new(),
            unreachable: HashSet::new(),
            inboxes: Arc::new(RwLock::new(HashMap::new())),
            links: Mutex::new(HashMap::new()),
            stats: Arc::new(OverlayStats::default()),
        }
    }

    pub fn from_settings(tree: Arc<Tree>, settings: &SimulationSettings) -> Self {
        Self::new(tree, settings.link_latency)
            .with_unresponsive(settings.unresponsive.iter().copied())
            .with_unreachable(settings.unreachable.iter().copied())
    }

    pub fn with_unresponsive(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.unresponsive.extend(nodes);
        self
    }

    pub fn with_unreachable(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.unreachable.extend(nodes);
        self
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// Nodes that never take part in a run: they and their subtrees are not counted
    pub fn faulty_nodes(&self) -> HashSet<NodeId> {
        self.unresponsive
            .union(&self.unreachable)
            .copied()
            .collect()
    }

    pub fn stats(&self) -> FrozenOverlayStats {
        self.stats.freeze()
    }

    fn link(&self, from: NodeId, to: NodeId) -> Result<mpsc::UnboundedSender<InFlight>> {
        let mut links = self
            .links
            .lock()
            .map_err(|e| CountError::Concurrency(format!("Mutex lock fail {}", e)))?;
        if let Some(link) = links.get(&(from, to)) {
            if !link.is_closed() {
                return Ok(link.clone());
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_link(
            from,
            to,
            rx,
            Arc::clone(&self.inboxes),
            Arc::clone(&self.stats),
        ));
        links.insert((from, to), tx.clone());
        Ok(tx)
    }
}

// Delivers packets queued on one directed edge, in order, each at its own instant
async fn run_link(
    from: NodeId,
    to: NodeId,
    mut queue: mpsc::UnboundedReceiver<InFlight>,
    inboxes: Inboxes,
    stats: Arc<OverlayStats>,
) {
    while let Some(in_flight) = queue.recv().await {
        tokio::time::sleep_until(in_flight.deliver_at).await;

        let packet = match CountPacket::deserialize(&in_flight.data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("[link {}->{}] Dropping undecodable packet: {}", from, to, e);
                stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let inbox = inboxes
            .read()
            .ok()
            .and_then(|inboxes| inboxes.get(&to).and_then(|inbox| inbox.upgrade()));
        let delivered = match inbox {
            Some(inbox) => inbox
                .send(NodeCommand::PacketReceived { from, packet })
                .await
                .is_ok(),
            None => false,
        };
        if delivered {
            stats.packets_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(
                "[link {}->{}] Node {} is not attached, discarding {}",
                from,
                to,
                to,
                packet.message.kind()
            );
            stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl TreeOverlay for LocalOverlay {
    fn root(&self) -> NodeId {
        self.tree.root()
    }

    fn contains(&self, node: NodeId) -> bool {
        self.tree.contains(node)
    }

    fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.tree.parent_of(node)
    }

    fn children_of(&self, node: NodeId) -> Vec<NodeId> {
        self.tree.children_of(node).to_vec()
    }

    fn attach(&self, node: NodeId, inbox: mpsc::WeakSender<NodeCommand>) -> Result<()> {
        if !self.tree.contains(node) {
            return Err(setup_error!("node {} is not part of the tree", node));
        }
        self.inboxes
            .write()
            .map_err(|e| CountError::Concurrency(format!("RwLock fail {}", e)))?
            .insert(node, inbox);
        Ok(())
    }

    fn detach(&self, node: NodeId) {
        if let Ok(mut inboxes) = self.inboxes.write() {
            inboxes.remove(&node);
        }
    }

    async fn send_to_neighbor(
        &self,
        from: NodeId,
        to: NodeId,
        packet: &CountPacket,
    ) -> Result<()> {
        if !self.tree.are_neighbors(from, to) {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(transport_error!("{} -> {} is not a tree edge", from, to));
        }
        if self.unreachable.contains(&to) {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(transport_error!("node {} is unreachable from {}", to, from));
        }

        let data = packet.serialize()?;
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);

        if self.unresponsive.contains(&to) {
            debug!(
                "[link {}->{}] Node {} is unresponsive, {} lost",
                from,
                to,
                to,
                packet.message.kind()
            );
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let in_flight = InFlight {
            data,
            deliver_at: Instant::now() + self.link_latency,
        };
        self.link(from, to)?
            .send(in_flight)
            .map_err(|_| transport_error!("link {} -> {} is closed", from, to))
    }
}
