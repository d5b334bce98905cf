//! rumorcount settings
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config_error;
use crate::error::Result;
use crate::node::NodeId;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_TIMEOUT_MS: &str = "5000";
pub const DEFAULT_SPREAD_FACTOR: &str = "2";
pub const DEFAULT_SPREAD_INTERVAL_MS: &str = "10";
pub const DEFAULT_NODES: &str = "7";
pub const DEFAULT_BRANCHING: &str = "2";
pub const DEFAULT_LINK_LATENCY_MS: &str = "5";

/// How a node picks which children receive the rumor in one stage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum SpreadPolicy {
    /// Children in overlay order
    #[default]
    InOrder,
    /// Uniformly random children among those not yet contacted
    Random,
}

impl std::fmt::Display for SpreadPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpreadPolicy::InOrder => write!(f, "in-order"),
            SpreadPolicy::Random => write!(f, "random"),
        }
    }
}

impl std::str::FromStr for SpreadPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in-order" | "inorder" | "ordered" => Ok(SpreadPolicy::InOrder),
            "random" => Ok(SpreadPolicy::Random),
            _ => Err(format!("Invalid spread policy: {}", s)),
        }
    }
}

/// Per-node protocol configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProtocolSettings {
    // Silence period after which the root concludes a run
    pub timeout: Duration,
    // Fan-out the root puts in its initial rumor
    pub spread_factor: u32,
    // Delay between spread stages when a node has more children than the fan-out
    pub spread_interval: Duration,
    pub spread_policy: SpreadPolicy,
    // Send the root's timeout along with every rumor
    pub announce_deadline: bool,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            spread_factor: 2,
            spread_interval: Duration::from_millis(10),
            spread_policy: SpreadPolicy::InOrder,
            announce_deadline: true,
        }
    }
}

impl ProtocolSettings {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(config_error!("timeout must be greater than zero"));
        }
        if self.spread_factor == 0 {
            return Err(config_error!("spread factor must be positive"));
        }
        Ok(())
    }
}

/// Shape and fault injection for a simulated run
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SimulationSettings {
    pub nodes: u32,
    pub branching: u32,
    pub link_latency: Duration,
    // Nodes whose inbound packets are silently lost
    pub unresponsive: Vec<NodeId>,
    // Nodes for which every send fails with a transport error
    pub unreachable: Vec<NodeId>,
    pub seed: Option<u64>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            nodes: 7,
            branching: 2,
            link_latency: Duration::from_millis(5),
            unresponsive: Vec::new(),
            unreachable: Vec::new(),
            seed: None,
        }
    }
}

impl SimulationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            return Err(config_error!("a tree needs at least one node"));
        }
        if self.branching == 0 && self.nodes > 1 {
            return Err(config_error!(
                "branching must be positive for a tree of {} nodes",
                self.nodes
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Settings {
    pub protocol: ProtocolSettings,
    pub simulation: SimulationSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate()?;
        self.simulation.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_defaults() {
        let settings = ProtocolSettings::default();
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert_eq!(settings.spread_factor, 2);
        assert!(settings.announce_deadline);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_protocol_settings() {
        let settings = ProtocolSettings::default().with_timeout(Duration::ZERO);
        assert!(settings.validate().is_err());

        let settings = ProtocolSettings {
            spread_factor: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_spread_policy_parse() {
        assert_eq!("random".parse::<SpreadPolicy>(), Ok(SpreadPolicy::Random));
        assert_eq!("In-Order".parse::<SpreadPolicy>(), Ok(SpreadPolicy::InOrder));
        assert!("flood".parse::<SpreadPolicy>().is_err());
        assert_eq!(SpreadPolicy::Random.to_string(), "random");
    }

    #[test]
    fn test_simulation_validation() {
        let mut settings = SimulationSettings::default();
        assert!(settings.validate().is_ok());

        settings.nodes = 0;
        assert!(settings.validate().is_err());

        settings.nodes = 1;
        settings.branching = 0;
        assert!(settings.validate().is_ok());
    }
}
