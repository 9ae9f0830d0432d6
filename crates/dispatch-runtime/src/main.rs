//! Dispatch runtime - runs a fleet scenario and prints the JSON report

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dispatch_runtime::config::Config;
use dispatch_runtime::scenario::Scenario;

#[derive(Parser, Debug)]
#[command(name = "dispatch-runtime", about = "Run a drone dispatch scenario")]
struct Args {
    /// Scenario JSON file
    scenario: PathBuf,

    /// Let emergencies fly through restricted areas, whatever the scenario says
    #[arg(long)]
    bypass: bool,

    /// Pretty-print the report
    #[arg(long)]
    pretty: bool,

    /// Print only the planned paths and restricted areas as GeoJSON
    #[arg(long)]
    geojson: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env();

    let filter = EnvFilter::from_default_env().add_directive("dispatch_runtime=info".parse()?);
    if config.log_json {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    tracing::info!(scenario = %args.scenario.display(), "Starting dispatch runtime...");

    let scenario = Scenario::load(&args.scenario)?;
    let report = scenario.run(&config, args.bypass).await?;

    let output = match (args.geojson, args.pretty) {
        (true, true) => serde_json::to_string_pretty(&report.geojson)?,
        (true, false) => serde_json::to_string(&report.geojson)?,
        (false, true) => serde_json::to_string_pretty(&report)?,
        (false, false) => serde_json::to_string(&report)?,
    };
    println!("{}", output);

    Ok(())
}
