//! Simulated counting runs
//!
//! Assembles one protocol instance per tree node on a `LocalOverlay`, starts
//! the run on the root, waits for the count and then stops every node.
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Result;
use crate::node::NodeId;
use crate::protocol::{CountProtocol, ProtocolHandle, RunSummary, TreeSpreader};
use crate::settings::Settings;
use crate::tree::{FrozenOverlayStats, LocalOverlay, Tree, TreeOverlay};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RunReport {
    pub count: u64,
    // Non-root nodes a lossless run should reach given the injected faults
    pub expected: u64,
    pub nodes: usize,
    pub height: usize,
    pub timeout_ms: u64,
    pub elapsed_ms: u64,
    pub overlay: FrozenOverlayStats,
    pub summaries: Vec<RunSummary>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.count == self.expected
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug)]
pub struct Simulation {
    settings: Settings,
    overlay: Arc<LocalOverlay>,
}

impl Simulation {
    pub fn new(tree: Tree, settings: Settings) -> Result<Self> {
        settings.protocol.validate()?;
        let overlay = LocalOverlay::from_settings(Arc::new(tree), &settings.simulation);
        Ok(Self {
            settings,
            overlay: Arc::new(overlay),
        })
    }

    /// Build the complete k-ary tree described by the simulation settings
    pub fn from_settings(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let tree = Tree::k_ary(settings.simulation.nodes, settings.simulation.branching)?;
        Self::new(tree, settings)
    }

    pub fn overlay(&self) -> Arc<LocalOverlay> {
        Arc::clone(&self.overlay)
    }

    pub fn tree(&self) -> &Arc<Tree> {
        self.overlay.tree()
    }

    /// Attach and spawn an instance for every node in the tree
    pub fn spawn_nodes(&self) -> Result<BTreeMap<NodeId, ProtocolHandle>> {
        let overlay: Arc<dyn TreeOverlay> = self.overlay.clone();
        let mut handles = BTreeMap::new();
        for node_id in self.tree().node_ids() {
            let policy = self.settings.protocol.spread_policy;
            let mut spreader = TreeSpreader::new(node_id, Arc::clone(&overlay), policy);
            if let Some(seed) = self.settings.simulation.seed {
                spreader = spreader.with_seed(seed.wrapping_add(u64::from(node_id.value())));
            }
            let protocol = CountProtocol::new(
                node_id,
                Some(Arc::clone(&overlay)),
                self.settings.protocol.clone(),
            )?
            .with_spreader(Box::new(spreader));
            handles.insert(node_id, protocol.spawn());
        }
        debug!("Spawned {} protocol instances", handles.len());
        Ok(handles)
    }

    /// One counting pass from start to published count
    pub async fn run(&self) -> Result<RunReport> {
        let mut handles = self.spawn_nodes()?;
        let root = self.tree().root();
        let expected = self.tree().reachable_count(&self.overlay.faulty_nodes()) as u64;

        let started = Instant::now();
        let outcome = match handles.get_mut(&root) {
            Some(root_handle) => match root_handle.start().await {
                Ok(run_id) => {
                    info!("Run {} started on root {}", run_id, root);
                    root_handle.result().await
                }
                Err(e) => Err(e),
            },
            None => Err(crate::setup_error!("root {} has no instance", root)),
        };
        let elapsed = started.elapsed();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles.values() {
            handle.stop().await;
        }
        for (_, handle) in handles {
            summaries.push(handle.join().await?);
        }
        let count = outcome?;

        info!(
            "Counted {} of {} reachable nodes in {:?}",
            count, expected, elapsed
        );
        Ok(RunReport {
            count,
            expected,
            nodes: self.tree().len(),
            height: self.tree().height(),
            timeout_ms: u64::try_from(self.settings.protocol.timeout.as_millis())
                .unwrap_or(u64::MAX),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            overlay: self.overlay.stats(),
            summaries,
        })
    }
}
