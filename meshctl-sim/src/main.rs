//! meshctl-sim - Runs the control plane against a simulated mesh
//!
//! Builds a line of motes and a set of rovers, then drives multicast, route
//! resolution and discovery through the controller and prints what it saw.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use meshctl_core::tracing_setup::{CliLogLevel, init_tracing};
use meshctl_sim::SimulationEnvironment;

#[derive(Debug, Parser)]
#[command(name = "meshctl-sim")]
#[command(about = "Runs the mesh control plane against a simulated network")]
struct Cli {
    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,
    /// Directory for the per-run debug log
    #[arg(long)]
    logs_dir: Option<PathBuf>,
    /// Motes in the line, root included
    #[arg(short, long, default_value_t = 4)]
    motes: u16,
    /// Delivery ratio of every link
    #[arg(long, default_value_t = 0.9)]
    pdr: f64,
    /// Probability that the radio drops a message
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Responsive rovers; as many silent ones are added next to them
    #[arg(short, long, default_value_t = 2)]
    rovers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_file = init_tracing(cli.log_level, cli.logs_dir.as_deref())?;

    let mut env = SimulationEnvironment::for_lossy_radio(cli.seed, cli.loss);
    let motes = env.add_line(cli.motes, cli.pdr)?;
    let mut rovers = env.add_responsive_rovers(cli.rovers, 2, Duration::from_millis(5));
    rovers.extend(env.add_unresponsive_rovers(cli.rovers));
    let controller = env.controller()?;

    controller.set_multicast(true).await?;
    controller.set_auto_bitmap(true).await?;
    let bitmap = controller.multicast().bitmap_for_send().await?;

    let Some(&destination) = motes.last() else {
        anyhow::bail!("simulated line has no motes");
    };
    let route = controller.resolve_source_route(destination).await;
    if let Err(e) = &route {
        tracing::warn!(destination = %destination, error = %e, "No source route");
    }

    let list: Vec<String> = rovers.iter().map(ToString::to_string).collect();
    controller.rover_command(&format!("upload@{}", list.join(",")))?;
    let discovery = controller.discover_rovers().await;

    let summary = serde_json::json!({
        "topology": controller.export_topology(),
        "multicast": controller.multicast_status(),
        "bitmap": bitmap,
        "route": route.as_ref().ok(),
        "route_error": route.as_ref().err().map(|e| e.user_message()),
        "discovery": discovery,
        "log_file": log_file,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
