//! Reachability Counting Protocol
//!
//! The root spreads a rumor down the tree; every node reached reports
//! liveness toward the root before contacting its own children. The root
//! counts the reports and restarts its silence timer on each one, concluding
//! the run once a full timeout period passes without any report.
pub mod commands;
pub mod instance;
pub mod messages;
pub mod result;
pub mod spreader;
pub mod timeout;

pub use commands::NodeCommand;
pub use instance::{CountProtocol, Phase, ProtocolHandle, RunSummary};
pub use messages::{CountMessage, CountPacket};
pub use result::{result_channel, CountResult, ResultSlot};
pub use spreader::{RumorSpreader, SpreadReport, TreeSpreader};
pub use timeout::{SilenceTimer, TimeoutController};
