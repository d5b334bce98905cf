use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rumorcount::cli;
use rumorcount::simulation::Simulation;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rumorcount=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let args = cli::Cli::parse();
    let json = args.json;
    let settings = args.into_settings();
    settings.validate()?;

    info!(
        "Counting a {}-node tree (branching {}) with a {:?} timeout",
        settings.simulation.nodes, settings.simulation.branching, settings.protocol.timeout
    );
    let simulation = Simulation::from_settings(settings)?;
    let report = match simulation.run().await {
        Ok(report) => report,
        Err(e) => {
            error!("Counting run failed ({}): {}", e.error_type(), e);
            return Err(e.into());
        }
    };

    if json {
        println!("{}", report.to_json()?);
    } else {
        println!(
            "counted {} of {} reachable nodes in {} ms",
            report.count, report.expected, report.elapsed_ms
        );
    }
    Ok(())
}
