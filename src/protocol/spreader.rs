//! Rumor fan-out
//!
//! The protocol hands every rumor to a `RumorSpreader` instead of sending it
//! itself. `TreeSpreader` contacts at most `fanout` of the node's children per
//! call and remembers who is still waiting, so a node with more children than
//! its fan-out spreads in stages rather than flooding all of them at once.
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;

use crate::error::{CountError, Result};
use crate::node::NodeId;
use crate::settings::SpreadPolicy;
use crate::transport_error;
use crate::tree::TreeOverlay;

use super::CountPacket;

/// Outcome of one spread stage. Every send is independent.
#[derive(Debug, Default)]
pub struct SpreadReport {
    pub sent: Vec<NodeId>,
    pub failed: Vec<(NodeId, CountError)>,
}

impl SpreadReport {
    pub fn attempted(&self) -> usize {
        self.sent.len() + self.failed.len()
    }

    /// Collapse failed sends into one transport error
    pub fn into_result(self) -> Result<Vec<NodeId>> {
        if self.failed.is_empty() {
            return Ok(self.sent);
        }
        let failures: Vec<String> = self
            .failed
            .iter()
            .map(|(node, e)| format!("{}: {}", node, e))
            .collect();
        Err(transport_error!(
            "{} of {} rumor sends failed ({})",
            self.failed.len(),
            self.attempted(),
            failures.join("; ")
        ))
    }
}

#[async_trait]
pub trait RumorSpreader: Send + Sync {
    /// Send `packet` to at most `fanout` children not yet contacted in this run
    async fn spread(&mut self, fanout: usize, packet: &CountPacket) -> SpreadReport;

    /// Children still waiting for a later stage
    fn remaining(&self) -> usize;
}

pub struct TreeSpreader {
    node_id: NodeId,
    overlay: Arc<dyn TreeOverlay>,
    policy: SpreadPolicy,
    pending: Vec<NodeId>,
    rng: StdRng,
}

impl std::fmt::Debug for TreeSpreader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeSpreader")
            .field("node_id", &self.node_id)
            .field("policy", &self.policy)
            .field("pending", &self.pending)
            .finish()
    }
}

impl TreeSpreader {
    pub fn new(node_id: NodeId, overlay: Arc<dyn TreeOverlay>, policy: SpreadPolicy) -> Self {
        let pending = overlay.children_of(node_id);
        Self {
            node_id,
            overlay,
            policy,
            pending,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic child selection for the random policy
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn select(&mut self, fanout: usize) -> Vec<NodeId> {
        let take = fanout.min(self.pending.len());
        let chosen: Vec<NodeId> = match self.policy {
            SpreadPolicy::InOrder => self.pending[..take].to_vec(),
            SpreadPolicy::Random => self
                .pending
                .choose_multiple(&mut self.rng, take)
                .copied()
                .collect(),
        };
        self.pending.retain(|child| !chosen.contains(child));
        chosen
    }
}

#[async_trait]
impl RumorSpreader for TreeSpreader {
    async fn spread(&mut self, fanout: usize, packet: &CountPacket) -> SpreadReport {
        let mut report = SpreadReport::default();
        for child in self.select(fanout) {
            match self
                .overlay
                .send_to_neighbor(self.node_id, child, packet)
                .await
            {
                Ok(()) => report.sent.push(child),
                // The caller logs failures; keep going with the other children
                Err(e) => report.failed.push((child, e)),
            }
        }
        report
    }

    fn remaining(&self) -> usize {
        self.pending.len()
    }
}
