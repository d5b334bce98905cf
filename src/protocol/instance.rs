//! Per-node protocol instance.
//!
//! `CountProtocol` owns all run state for one node and is driven by a single
//! dispatch loop, so nothing in here needs a lock except the shared timeout.
//! Callers keep a `ProtocolHandle` to start the run, adjust the timeout,
//! stop the node and collect the root's count.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use super::result::{result_channel, CountResult, ResultSlot};
use super::spreader::{RumorSpreader, TreeSpreader};
use super::timeout::{SilenceTimer, TimeoutController};
use super::{CountMessage, CountPacket, NodeCommand};
use crate::error::{CountError, Result};
use crate::node::NodeId;
use crate::settings::ProtocolSettings;
use crate::setup_error;
use crate::tree::TreeOverlay;

const INBOX_CAPACITY: usize = 1024;

/// Root: `Idle -> Spreading -> WaitingForSilence -> Terminated`.
/// Non-root: `Idle -> Forwarded -> Terminated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Phase {
    Idle,
    Spreading,
    WaitingForSilence,
    Forwarded,
    Terminated,
}

/// Final state of a node once its dispatch loop has exited
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RunSummary {
    pub node_id: NodeId,
    pub is_root: bool,
    pub phase: Phase,
    pub run_id: Option<u64>,
    pub replies_received: u64,
    pub children_contacted: usize,
    pub duplicate_rumors: u64,
    pub reports_relayed: u64,
    pub published: bool,
}

// Closed set of things the dispatch loop reacts to
#[derive(Debug)]
enum Event {
    Command(NodeCommand),
    SpreadStage,
    TimeoutFired,
    InboxClosed,
}

pub struct CountProtocol {
    node_id: NodeId,
    overlay: Arc<dyn TreeOverlay>,
    settings: ProtocolSettings,
    is_root: bool,
    parent: Option<NodeId>,

    // Run state
    phase: Phase,
    run_id: Option<u64>,
    replies_received: u64,
    fanout: u32,
    children_contacted: usize,
    duplicate_rumors: u64,
    reports_relayed: u64,
    published: bool,

    timeout: TimeoutController,
    silence: SilenceTimer,
    next_stage: Option<Instant>,
    spreader: Box<dyn RumorSpreader>,

    result_slot: Option<ResultSlot>,
    result: Option<CountResult>,

    // Handed to the handle on spawn; the overlay only keeps a weak sender
    inbox_tx: Option<mpsc::Sender<NodeCommand>>,
    inbox_rx: mpsc::Receiver<NodeCommand>,
}

impl std::fmt::Debug for CountProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountProtocol")
            .field("node_id", &self.node_id)
            .field("is_root", &self.is_root)
            .field("phase", &self.phase)
            .field("replies_received", &self.replies_received)
            .field("timeout", &self.timeout.timeout())
            .finish()
    }
}

impl CountProtocol {
    /// Create the instance for `node`. Fails if there is no overlay to run on.
    pub fn new(
        node_id: NodeId,
        overlay: Option<Arc<dyn TreeOverlay>>,
        settings: ProtocolSettings,
    ) -> Result<Self> {
        let overlay = overlay.ok_or_else(|| setup_error!("cannot find tree"))?;
        settings.validate()?;
        if !overlay.contains(node_id) {
            return Err(setup_error!("node {} is not part of the tree", node_id));
        }

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        overlay.attach(node_id, inbox_tx.downgrade())?;

        let is_root = overlay.root() == node_id;
        let parent = overlay.parent_of(node_id);
        let (result_slot, result) = if is_root {
            let (slot, result) = result_channel();
            (Some(slot), Some(result))
        } else {
            (None, None)
        };
        let timeout = TimeoutController::new(settings.timeout);
        let spreader = Box::new(TreeSpreader::new(
            node_id,
            Arc::clone(&overlay),
            settings.spread_policy,
        ));

        debug!(
            "[{}] Created count protocol instance (root: {}, parent: {:?})",
            node_id, is_root, parent
        );

        Ok(Self {
            node_id,
            overlay,
            fanout: settings.spread_factor,
            is_root,
            parent,
            phase: Phase::Idle,
            run_id: None,
            replies_received: 0,
            children_contacted: 0,
            duplicate_rumors: 0,
            reports_relayed: 0,
            published: false,
            silence: SilenceTimer::new(timeout.clone()),
            timeout,
            next_stage: None,
            spreader,
            result_slot,
            result,
            inbox_tx: Some(inbox_tx),
            inbox_rx,
            settings,
        })
    }

    /// Replace the fan-out strategy
    pub fn with_spreader(mut self, spreader: Box<dyn RumorSpreader>) -> Self {
        self.spreader = spreader;
        self
    }

    /// Run the dispatch loop on its own task. Dropping the returned handle
    /// closes the inbox, which ends the loop and detaches the node.
    pub fn spawn(mut self) -> ProtocolHandle {
        let mut handle = ProtocolHandle {
            node_id: self.node_id,
            is_root: self.is_root,
            commands: self.inbox_tx.take(),
            timeout: self.timeout.clone(),
            result: self.result.take(),
            task: None,
        };
        handle.task = Some(tokio::spawn(self.dispatch()));
        handle
    }

    // Main loop: wait for the next message, spread stage or silence timeout
    async fn dispatch(mut self) -> RunSummary {
        debug!("[{}] Entering dispatch loop", self.node_id);
        loop {
            let event = self.next_event().await;
            if !self.handle_event(event).await {
                break;
            }
        }
        self.done()
    }

    async fn next_event(&mut self) -> Event {
        let deadline = self.silence.deadline();
        let next_stage = self.next_stage;
        tokio::select! {
            biased;
            cmd = self.inbox_rx.recv() => match cmd {
                Some(cmd) => Event::Command(cmd),
                None => Event::InboxClosed,
            },
            _ = time::sleep_until(next_stage.unwrap_or_else(far_future)),
                if next_stage.is_some() => Event::SpreadStage,
            _ = time::sleep_until(deadline.unwrap_or_else(far_future)),
                if deadline.is_some() => Event::TimeoutFired,
        }
    }

    // Returns false once the loop should exit
    async fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Command(NodeCommand::Start { run_id }) => {
                self.start(run_id).await;
                true
            }
            Event::Command(NodeCommand::PacketReceived { from, packet }) => {
                self.handle_packet(from, packet).await;
                true
            }
            Event::Command(NodeCommand::Stop) => {
                if self.result_slot.is_some() {
                    warn!(
                        "[{}] Stopped before timing out, discarding {} replies",
                        self.node_id, self.replies_received
                    );
                } else {
                    debug!("[{}] Stop received in phase {:?}", self.node_id, self.phase);
                }
                false
            }
            Event::SpreadStage => {
                self.spread_stage().await;
                true
            }
            Event::TimeoutFired => self.on_timeout(),
            Event::InboxClosed => {
                info!("[{}] Inbox closed, exiting", self.node_id);
                false
            }
        }
    }

    async fn start(&mut self, run_id: u64) {
        if !self.is_root {
            debug!("[{}] Start ignored: not the root", self.node_id);
            return;
        }
        if self.phase != Phase::Idle {
            warn!(
                "[{}] Start ignored: run {:?} already in phase {:?}",
                self.node_id, self.run_id, self.phase
            );
            return;
        }
        info!(
            "[{}] Starting to count (run {}, spread factor {}, timeout {:?})",
            self.node_id,
            run_id,
            self.fanout,
            self.timeout.timeout()
        );
        self.run_id = Some(run_id);
        self.phase = Phase::Spreading;
        self.spread_stage().await;
    }

    async fn handle_packet(&mut self, from: NodeId, packet: CountPacket) {
        match (self.run_id, packet.message) {
            (Some(run_id), _) if run_id != packet.run_id => {
                debug!(
                    "[{}] Ignoring {} from {} for stale run {} (current {})",
                    self.node_id,
                    packet.message.kind(),
                    from,
                    packet.run_id,
                    run_id
                );
            }
            (_, CountMessage::Rumor { fanout_count }) => {
                self.on_rumor(from, packet.run_id, fanout_count).await
            }
            (None, message) => {
                debug!(
                    "[{}] Ignoring {} from {} before any rumor",
                    self.node_id,
                    message.kind(),
                    from
                );
            }
            (Some(_), CountMessage::LivenessReport { child_count }) => {
                self.on_liveness_report(from, child_count).await
            }
            (Some(_), CountMessage::DeadlineAnnouncement { timeout_ms }) => {
                self.on_deadline_announcement(from, timeout_ms)
            }
        }
    }

    async fn on_rumor(&mut self, from: NodeId, run_id: u64, fanout_count: u32) {
        if self.is_root {
            debug!("[{}] Root ignores rumor from {}", self.node_id, from);
            return;
        }
        if self.phase != Phase::Idle {
            self.duplicate_rumors += 1;
            debug!(
                "[{}] Already forwarded run {}, ignoring rumor from {}",
                self.node_id, run_id, from
            );
            return;
        }

        self.run_id = Some(run_id);
        self.phase = Phase::Forwarded;
        self.fanout = fanout_count.max(1);

        // Tell the root we're up before contacting our own children
        self.send_to_parent(CountMessage::liveness_report(1)).await;
        self.spread_stage().await;
    }

    async fn on_liveness_report(&mut self, from: NodeId, child_count: u32) {
        if !self.is_root {
            self.reports_relayed += 1;
            self.send_to_parent(CountMessage::liveness_report(child_count))
                .await;
            return;
        }
        self.replies_received += u64::from(child_count);
        self.silence.reset();
        debug!(
            "[{}] Liveness report from {} ({} replies so far), waiting another {:?}",
            self.node_id,
            from,
            self.replies_received,
            self.timeout.timeout()
        );
    }

    fn on_deadline_announcement(&mut self, from: NodeId, timeout_ms: u64) {
        if self.is_root {
            return;
        }
        let timeout = Duration::from_millis(timeout_ms);
        debug!(
            "[{}] Adopting timeout {:?} announced by {}",
            self.node_id, timeout, from
        );
        self.timeout.set_timeout(timeout);
    }

    // Contact the next batch of children; schedules another stage if some remain
    async fn spread_stage(&mut self) {
        let Some(run_id) = self.run_id else {
            return;
        };
        if self.is_root {
            self.silence.reset();
        }

        let packet = CountPacket::new(run_id, CountMessage::rumor(self.fanout));
        let report = self.spreader.spread(self.fanout as usize, &packet).await;
        self.children_contacted += report.sent.len();

        if self.settings.announce_deadline && !report.sent.is_empty() {
            let announcement = CountPacket::new(
                run_id,
                CountMessage::deadline_announcement(self.timeout.timeout()),
            );
            for child in &report.sent {
                if let Err(e) = self
                    .overlay
                    .send_to_neighbor(self.node_id, *child, &announcement)
                    .await
                {
                    warn!(
                        "[{}] Couldn't announce deadline to {}: {}",
                        self.node_id, child, e
                    );
                }
            }
        }
        if let Err(e) = report.into_result() {
            warn!("[{}] Couldn't spread rumor: {}", self.node_id, e);
        }

        if self.spreader.remaining() > 0 {
            self.next_stage = Some(Instant::now() + self.settings.spread_interval);
        } else {
            self.next_stage = None;
            if self.phase == Phase::Spreading {
                self.phase = Phase::WaitingForSilence;
            }
        }
    }

    async fn send_to_parent(&self, message: CountMessage) {
        let (Some(parent), Some(run_id)) = (self.parent, self.run_id) else {
            return;
        };
        let packet = CountPacket::new(run_id, message);
        if let Err(e) = self
            .overlay
            .send_to_neighbor(self.node_id, parent, &packet)
            .await
        {
            warn!(
                "[{}] Couldn't send {} to parent {}: {}",
                self.node_id,
                message.kind(),
                parent,
                e
            );
        }
    }

    fn on_timeout(&mut self) -> bool {
        if !self.is_root {
            self.silence.disarm();
            return true;
        }
        info!(
            "[{}] Timed out after {:?} of silence: {} nodes confirmed",
            self.node_id,
            self.silence.silence(),
            self.replies_received
        );
        self.silence.disarm();
        self.next_stage = None;
        self.phase = Phase::Terminated;
        if let Some(slot) = self.result_slot.take() {
            self.published = true;
            if !slot.publish(self.replies_received) {
                warn!("[{}] Nobody is waiting for the count", self.node_id);
            }
        }
        false
    }

    /// Leave the overlay and report the final state
    fn done(mut self) -> RunSummary {
        self.overlay.detach(self.node_id);
        self.phase = Phase::Terminated;
        info!(
            "[{}] Count protocol done (run {:?}, {} children contacted)",
            self.node_id, self.run_id, self.children_contacted
        );
        RunSummary {
            node_id: self.node_id,
            is_root: self.is_root,
            phase: self.phase,
            run_id: self.run_id,
            replies_received: self.replies_received,
            children_contacted: self.children_contacted,
            duplicate_rumors: self.duplicate_rumors,
            reports_relayed: self.reports_relayed,
            published: self.published,
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}

/// Caller-side handle for a spawned protocol instance
#[derive(Debug)]
pub struct ProtocolHandle {
    node_id: NodeId,
    is_root: bool,
    commands: Option<mpsc::Sender<NodeCommand>>,
    timeout: TimeoutController,
    result: Option<CountResult>,
    task: Option<JoinHandle<RunSummary>>,
}

impl ProtocolHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Start a run and return its id. A no-op on non-root nodes.
    pub async fn start(&self) -> Result<u64> {
        let run_id = rand::random();
        let sent = match &self.commands {
            Some(commands) => commands.send(NodeCommand::Start { run_id }).await.is_ok(),
            None => false,
        };
        if !sent {
            return Err(CountError::Concurrency(format!(
                "node {} has already exited",
                self.node_id
            )));
        }
        Ok(run_id)
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout.set_timeout(timeout);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.timeout()
    }

    /// Ask the node to leave its dispatch loop. Stopping an exited node is fine.
    pub async fn stop(&self) {
        let sent = match &self.commands {
            Some(commands) => commands.send(NodeCommand::Stop).await.is_ok(),
            None => false,
        };
        if !sent {
            debug!("[{}] Stop sent to an exited node", self.node_id);
        }
    }

    /// Wait for the root's final count. Can be taken once.
    pub async fn result(&mut self) -> Result<u64> {
        match self.result.take() {
            Some(result) => result.wait().await,
            None if self.is_root => Err(CountError::Concurrency(format!(
                "count of node {} was already taken",
                self.node_id
            ))),
            None => Err(setup_error!(
                "node {} is not the root and never reports a count",
                self.node_id
            )),
        }
    }

    /// Wait for the dispatch loop to exit
    pub async fn join(mut self) -> Result<RunSummary> {
        match self.task.take() {
            Some(task) => task.await.map_err(|e| {
                CountError::Concurrency(format!("dispatch loop of {} failed: {}", self.node_id, e))
            }),
            None => Err(CountError::Concurrency(format!(
                "node {} was never spawned",
                self.node_id
            ))),
        }
    }
}
