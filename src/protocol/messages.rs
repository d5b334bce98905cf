//! Counting Protocol Messages
//!
//! Three message kinds travel along tree edges, distinguished by their enum tag:
//!
//! - `Rumor`: parent -> child, starts or continues the counting pass
//! - `LivenessReport`: child -> parent, relayed hop by hop up to the root
//! - `DeadlineAnnouncement`: parent -> child, shares the root's timeout
//!
//! Every message is wrapped in a `CountPacket` carrying the run id so that
//! stale packets from an earlier run are never mistaken for current activity.
use std::time::Duration;

use bincode::{Decode, Encode};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode, Encode)]
pub enum CountMessage {
    /// Counting rumor; `fanout_count` is how many children the receiver should contact per stage
    Rumor { fanout_count: u32 },

    /// Reachability acknowledgement for `child_count` nodes
    LivenessReport { child_count: u32 },

    /// Root timeout, so every node shares the same deadline
    DeadlineAnnouncement { timeout_ms: u64 },
}

impl CountMessage {
    pub fn rumor(fanout_count: u32) -> Self {
        CountMessage::Rumor { fanout_count }
    }

    pub fn liveness_report(child_count: u32) -> Self {
        CountMessage::LivenessReport { child_count }
    }

    pub fn deadline_announcement(timeout: Duration) -> Self {
        CountMessage::DeadlineAnnouncement {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CountMessage::Rumor { .. } => "rumor",
            CountMessage::LivenessReport { .. } => "liveness_report",
            CountMessage::DeadlineAnnouncement { .. } => "deadline_announcement",
        }
    }
}

/// CountPacket wraps messages for delivery over the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode, Encode)]
pub struct CountPacket {
    pub run_id: u64,
    pub message: CountMessage,
}

impl CountPacket {
    pub fn new(run_id: u64, message: CountMessage) -> Self {
        Self { run_id, message }
    }

    /// Serialize for transmission along a tree edge
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard().with_big_endian();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    /// Deserialize a packet received along a tree edge
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let config = bincode::config::standard().with_big_endian();
        let (packet, _) = bincode::decode_from_slice(data, config)?;
        Ok(packet)
    }
}
