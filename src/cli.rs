//! CLI for this application
//!
use std::time::Duration;

use crate::node::NodeId;
use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
#[clap(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Silence period after which the root reports its count
    #[clap(
        long,
        default_value = settings::DEFAULT_TIMEOUT_MS,
        env("RUMORCOUNT_TIMEOUT_MS"),
        help = "Milliseconds of silence before the root concludes the run"
    )]
    pub timeout_ms: u64,

    #[clap(
        long,
        default_value = settings::DEFAULT_SPREAD_FACTOR,
        env("RUMORCOUNT_SPREAD_FACTOR"),
        help = "Children contacted per spread stage"
    )]
    pub spread_factor: u32,

    #[clap(
        long,
        default_value = settings::DEFAULT_SPREAD_INTERVAL_MS,
        env("RUMORCOUNT_SPREAD_INTERVAL_MS"),
        help = "Milliseconds between spread stages"
    )]
    pub spread_interval_ms: u64,

    #[clap(
        long,
        default_value = "in-order",
        env("RUMORCOUNT_SPREAD_POLICY"),
        help = "spread-policy: 'in-order' or 'random'"
    )]
    pub spread_policy: settings::SpreadPolicy,

    #[clap(
        long,
        env("RUMORCOUNT_NO_DEADLINE_ANNOUNCEMENT"),
        help = "Do not forward the root's timeout along with the rumor"
    )]
    pub no_deadline_announcement: bool,

    // Simulated tree shape
    #[clap(
        long,
        default_value = settings::DEFAULT_NODES,
        env("RUMORCOUNT_NODES"),
        help = "Number of nodes in the simulated tree (root included)"
    )]
    pub nodes: u32,

    #[clap(
        long,
        default_value = settings::DEFAULT_BRANCHING,
        env("RUMORCOUNT_BRANCHING"),
        help = "Children per node in the simulated k-ary tree"
    )]
    pub branching: u32,

    #[clap(
        long,
        default_value = settings::DEFAULT_LINK_LATENCY_MS,
        env("RUMORCOUNT_LINK_LATENCY_MS"),
        help = "One-way latency of every tree edge in milliseconds"
    )]
    pub link_latency_ms: u64,

    #[clap(
        long,
        value_delimiter = ',',
        env("RUMORCOUNT_UNRESPONSIVE"),
        help = "Node ids that silently drop every packet (e.g., 3,4)"
    )]
    pub unresponsive: Vec<NodeId>,

    #[clap(
        long,
        value_delimiter = ',',
        env("RUMORCOUNT_UNREACHABLE"),
        help = "Node ids for which every send fails"
    )]
    pub unreachable: Vec<NodeId>,

    #[clap(long, env("RUMORCOUNT_SEED"), help = "Seed for the random spread policy")]
    pub seed: Option<u64>,

    #[clap(long, help = "Print the run report as JSON")]
    pub json: bool,
}

impl Cli {
    pub fn into_settings(self) -> settings::Settings {
        settings::Settings {
            protocol: settings::ProtocolSettings {
                timeout: Duration::from_millis(self.timeout_ms),
                spread_factor: self.spread_factor,
                spread_interval: Duration::from_millis(self.spread_interval_ms),
                spread_policy: self.spread_policy,
                announce_deadline: !self.no_deadline_announcement,
            },
            simulation: settings::SimulationSettings {
                nodes: self.nodes,
                branching: self.branching,
                link_latency: Duration::from_millis(self.link_latency_ms),
                unresponsive: self.unresponsive,
                unreachable: self.unreachable,
                seed: self.seed,
            },
        }
    }
}
