use std::sync::Arc;

use async_trait::async_trait;
use rumorcount::error::CountError;
use rumorcount::node::NodeId;
use rumorcount::protocol::{
    CountMessage, CountPacket, CountProtocol, Phase, ProtocolHandle, RumorSpreader, SpreadReport,
};
use rumorcount::settings::ProtocolSettings;
use rumorcount::tree::{LocalOverlay, Tree, TreeOverlay};
use tokio::time::{sleep, Duration, Instant};

fn id(n: u32) -> NodeId {
    NodeId::new(n)
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn settings(timeout_ms: u64) -> ProtocolSettings {
    ProtocolSettings::default().with_timeout(ms(timeout_ms))
}

fn spawn(overlay: &Arc<LocalOverlay>, node: u32, settings: ProtocolSettings) -> ProtocolHandle {
    let overlay: Arc<dyn TreeOverlay> = overlay.clone();
    CountProtocol::new(id(node), Some(overlay), settings)
        .expect("Failed to create protocol instance")
        .spawn()
}

fn assert_close(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual <= expected + ms(1),
        "expected ~{:?}, got {:?}",
        expected,
        actual
    );
}

// root(0) -> {A(1), B(2)}, A -> {C(3)}
fn small_tree() -> Tree {
    Tree::from_edges(id(0), &[(id(0), id(1)), (id(0), id(2)), (id(1), id(3))]).unwrap()
}

#[tokio::test(start_paused = true)]
async fn single_node_tree_times_out_after_one_period() {
    let overlay = Arc::new(LocalOverlay::new(Arc::new(Tree::single(id(0))), ms(10)));
    let mut root = spawn(&overlay, 0, settings(200));

    let started = Instant::now();
    root.start().await.unwrap();
    assert_eq!(root.result().await.unwrap(), 0);
    assert_close(started.elapsed(), ms(200));

    let summary = root.join().await.unwrap();
    assert_eq!(summary.phase, Phase::Terminated);
    assert!(summary.published);
    assert_eq!(summary.children_contacted, 0);
}

#[tokio::test(start_paused = true)]
async fn small_tree_counts_every_reached_node() {
    let overlay = Arc::new(LocalOverlay::new(Arc::new(small_tree()), ms(10)));
    let children: Vec<_> = (1..=3).map(|n| spawn(&overlay, n, settings(200))).collect();
    let mut root = spawn(&overlay, 0, settings(200));

    let started = Instant::now();
    root.start().await.unwrap();
    let count = root.result().await.unwrap();

    assert_eq!(count, 3);
    // Last report lands at 40ms (C -> A -> root), then one silent period
    assert_close(started.elapsed(), ms(240));

    for child in &children {
        child.stop().await;
    }
    for child in children {
        let summary = child.join().await.unwrap();
        assert_eq!(summary.duplicate_rumors, 0);
        assert!(summary.run_id.is_some());
    }
    let summary = root.join().await.unwrap();
    assert_eq!(summary.replies_received, 3);
    assert_eq!(summary.children_contacted, 2);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_child_yields_zero_after_one_period() {
    let tree = Tree::from_edges(id(0), &[(id(0), id(1))]).unwrap();
    let overlay =
        Arc::new(LocalOverlay::new(Arc::new(tree), ms(10)).with_unresponsive([id(1)]));
    let child = spawn(&overlay, 1, settings(200));
    let mut root = spawn(&overlay, 0, settings(200));

    let started = Instant::now();
    root.start().await.unwrap();
    assert_eq!(root.result().await.unwrap(), 0);
    assert_close(started.elapsed(), ms(200));

    child.stop().await;
    let summary = child.join().await.unwrap();
    assert_eq!(summary.run_id, None);
}

#[tokio::test(start_paused = true)]
async fn dropped_handle_shuts_the_node_down() {
    let tree = Tree::from_edges(id(0), &[(id(0), id(1))]).unwrap();
    let overlay = Arc::new(LocalOverlay::new(Arc::new(tree), ms(10)));
    drop(spawn(&overlay, 1, settings(200)));
    sleep(ms(3_600_000)).await;

    let mut root = spawn(&overlay, 0, settings(200));
    root.start().await.unwrap();
    assert_eq!(root.result().await.unwrap(), 0);

    // rumor and deadline announcement both find node 1 gone
    let stats = overlay.stats();
    assert_eq!(stats.packets_sent, 2);
    assert_eq!(stats.packets_delivered, 0);
    assert_eq!(stats.packets_dropped, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_spread_still_waits_for_silence() {
    let tree = Tree::from_edges(id(0), &[(id(0), id(1))]).unwrap();
    let overlay =
        Arc::new(LocalOverlay::new(Arc::new(tree), ms(10)).with_unreachable([id(1)]));
    let mut root = spawn(&overlay, 0, settings(200));

    let started = Instant::now();
    root.start().await.unwrap();
    assert_eq!(root.result().await.unwrap(), 0);
    assert_close(started.elapsed(), ms(200));
    assert_eq!(overlay.stats().send_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn steady_reports_keep_the_root_waiting() {
    let tree = Tree::from_edges(id(0), &[(id(0), id(1))]).unwrap();
    let overlay = Arc::new(LocalOverlay::new(Arc::new(tree), Duration::ZERO));
    let mut root = spawn(&overlay, 0, settings(200));

    let started = Instant::now();
    let run_id = root.start().await.unwrap();
    let report = CountPacket::new(run_id, CountMessage::liveness_report(1));
    for _ in 0..10 {
        sleep(ms(150)).await;
        overlay.send_to_neighbor(id(1), id(0), &report).await.unwrap();
    }

    // Every report landed before the root gave up, 1500ms after a 200ms timeout
    assert_eq!(root.result().await.unwrap(), 10);
    assert_close(started.elapsed(), ms(1700));
}

#[tokio::test(start_paused = true)]
async fn stale_run_reports_are_ignored() {
    let tree = Tree::from_edges(id(0), &[(id(0), id(1))]).unwrap();
    let overlay = Arc::new(LocalOverlay::new(Arc::new(tree), Duration::ZERO));
    let mut root = spawn(&overlay, 0, settings(100));

    let run_id = root.start().await.unwrap();
    let stale = CountPacket::new(run_id.wrapping_add(1), CountMessage::liveness_report(5));
    sleep(ms(50)).await;
    overlay.send_to_neighbor(id(1), id(0), &stale).await.unwrap();

    let started = Instant::now();
    assert_eq!(root.result().await.unwrap(), 0);
    // the stale report did not reset the timer
    assert_close(started.elapsed(), ms(50));
}

#[tokio::test(start_paused = true)]
async fn duplicate_rumor_is_forwarded_once() {
    // root(0) is not running; the test plays its part
    let tree = Tree::from_edges(id(0), &[(id(0), id(1)), (id(1), id(2))]).unwrap();
    let overlay = Arc::new(LocalOverlay::new(Arc::new(tree), ms(1)));
    let a = spawn(&overlay, 1, settings(200));
    let c = spawn(&overlay, 2, settings(200));

    let rumor = CountPacket::new(42, CountMessage::rumor(2));
    overlay.send_to_neighbor(id(0), id(1), &rumor).await.unwrap();
    overlay.send_to_neighbor(id(0), id(1), &rumor).await.unwrap();
    sleep(ms(20)).await;

    a.stop().await;
    c.stop().await;
    let a = a.join().await.unwrap();
    let c = c.join().await.unwrap();

    assert_eq!(a.run_id, Some(42));
    assert_eq!(a.children_contacted, 1);
    assert_eq!(a.duplicate_rumors, 1);
    // A relayed C's report exactly once
    assert_eq!(a.reports_relayed, 1);
    assert_eq!(c.duplicate_rumors, 0);
    assert_eq!(c.run_id, Some(42));
}

#[tokio::test(start_paused = true)]
async fn timeout_change_applies_on_next_wait_cycle() {
    let tree = Tree::from_edges(id(0), &[(id(0), id(1))]).unwrap();
    let overlay = Arc::new(LocalOverlay::new(Arc::new(tree), ms(10)));
    let child = spawn(&overlay, 1, settings(200));
    let mut root = spawn(&overlay, 0, settings(200));

    let started = Instant::now();
    root.start().await.unwrap();
    sleep(ms(5)).await;
    root.set_timeout(ms(50));
    assert_eq!(root.timeout(), ms(50));

    // A's report lands at 20ms and re-arms with the new 50ms window
    assert_eq!(root.result().await.unwrap(), 1);
    assert_close(started.elapsed(), ms(70));

    child.stop().await;
    child.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn children_adopt_the_announced_deadline() {
    let tree = Tree::from_edges(id(0), &[(id(0), id(1))]).unwrap();
    let overlay = Arc::new(LocalOverlay::new(Arc::new(tree), ms(1)));
    let child = spawn(&overlay, 1, settings(5000));
    let mut root = spawn(&overlay, 0, settings(300));

    root.start().await.unwrap();
    sleep(ms(10)).await;
    assert_eq!(child.timeout(), ms(300));

    assert_eq!(root.result().await.unwrap(), 1);
    child.stop().await;
}

#[tokio::test(start_paused = true)]
async fn staged_spread_reaches_every_child() {
    let edges: Vec<_> = (1..=5).map(|c| (id(0), id(c))).collect();
    let tree = Tree::from_edges(id(0), &edges).unwrap();
    let overlay = Arc::new(LocalOverlay::new(Arc::new(tree), ms(5)));
    let protocol = ProtocolSettings {
        spread_interval: ms(30),
        ..settings(100)
    };
    let children: Vec<_> = (1..=5).map(|n| spawn(&overlay, n, protocol.clone())).collect();
    let mut root = spawn(&overlay, 0, protocol);

    let started = Instant::now();
    root.start().await.unwrap();
    assert_eq!(root.result().await.unwrap(), 5);
    // stages at 0, 30, 60; the last report lands at 70
    assert_close(started.elapsed(), ms(170));

    for child in &children {
        child.stop().await;
    }
    let summary = root.join().await.unwrap();
    assert_eq!(summary.children_contacted, 5);
}

#[tokio::test]
async fn missing_overlay_is_a_setup_error() {
    let result = CountProtocol::new(id(0), None, ProtocolSettings::default());
    assert!(matches!(result, Err(CountError::Setup(_))));
}

#[tokio::test]
async fn unknown_node_is_a_setup_error() {
    let overlay: Arc<dyn TreeOverlay> =
        Arc::new(LocalOverlay::new(Arc::new(small_tree()), Duration::ZERO));
    let result = CountProtocol::new(id(99), Some(overlay), ProtocolSettings::default());
    assert!(matches!(result, Err(CountError::Setup(_))));
}

#[tokio::test(start_paused = true)]
async fn start_on_non_root_is_a_no_op() {
    let overlay = Arc::new(LocalOverlay::new(Arc::new(small_tree()), Duration::ZERO));
    let mut child = spawn(&overlay, 3, settings(100));
    assert!(!child.is_root());

    child.start().await.unwrap();
    assert!(matches!(child.result().await, Err(CountError::Setup(_))));

    child.stop().await;
    let summary = child.join().await.unwrap();
    assert_eq!(summary.run_id, None);
    assert_eq!(summary.children_contacted, 0);
}

#[tokio::test(start_paused = true)]
async fn stopped_root_discards_its_count() {
    let overlay = Arc::new(LocalOverlay::new(Arc::new(small_tree()), ms(10)));
    let mut root = spawn(&overlay, 0, settings(1000));

    root.start().await.unwrap();
    sleep(ms(100)).await;
    root.stop().await;

    assert!(matches!(root.result().await, Err(CountError::Aborted(_))));
    let summary = root.join().await.unwrap();
    assert!(!summary.published);
}

struct FailingSpreader;

#[async_trait]
impl RumorSpreader for FailingSpreader {
    async fn spread(&mut self, _fanout: usize, _packet: &CountPacket) -> SpreadReport {
        SpreadReport {
            sent: Vec::new(),
            failed: vec![(id(1), CountError::Transport("link down".to_string()))],
        }
    }

    fn remaining(&self) -> usize {
        0
    }
}

#[tokio::test(start_paused = true)]
async fn injected_spreader_failure_is_not_fatal() {
    let overlay: Arc<dyn TreeOverlay> =
        Arc::new(LocalOverlay::new(Arc::new(small_tree()), ms(10)));
    let mut root = CountProtocol::new(id(0), Some(overlay), settings(150))
        .unwrap()
        .with_spreader(Box::new(FailingSpreader))
        .spawn();

    let started = Instant::now();
    root.start().await.unwrap();
    assert_eq!(root.result().await.unwrap(), 0);
    assert_close(started.elapsed(), ms(150));
}
