//! Single-slot handoff of the final count from the root's dispatch loop to
//! the caller that started the run.
use tokio::sync::oneshot;

use crate::error::{CountError, Result};

/// Write side, owned by the root's dispatch loop. Publishing consumes the slot.
#[derive(Debug)]
pub struct ResultSlot {
    tx: oneshot::Sender<u64>,
}

/// Read side, handed to the caller. Resolves once, after the run terminates.
#[derive(Debug)]
pub struct CountResult {
    rx: oneshot::Receiver<u64>,
}

pub fn result_channel() -> (ResultSlot, CountResult) {
    let (tx, rx) = oneshot::channel();
    (ResultSlot { tx }, CountResult { rx })
}

impl ResultSlot {
    /// Publish the final count; returns false if the caller already went away
    pub fn publish(self, count: u64) -> bool {
        self.tx.send(count).is_ok()
    }
}

impl CountResult {
    /// Wait for the root to conclude the run
    pub async fn wait(self) -> Result<u64> {
        self.rx.await.map_err(|_| {
            CountError::Aborted("root discarded the run before publishing a count".to_string())
        })
    }
}
