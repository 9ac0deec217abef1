//! fleetd - hierarchical device registry
//!
//! CLI entry point for driving a registry end to end.

use std::collections::BTreeMap;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use eyre::{Context, Result};
use rand::Rng;
use tracing::info;

use fleetd::cli::{Cli, Command, OutputFormat};
use fleetd::config::Config;
use fleetd::registry::{AggregateResult, DeviceManager};

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    // Logs go to stderr so simulate output on stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Some(Command::Simulate {
            groups,
            devices,
            timeout_ms,
            format,
        }) => cmd_simulate(&config, groups, devices, timeout_ms, format).await,
        Some(Command::Check) => cmd_check(&config),
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Populate a registry with simulated devices and aggregate-query each group
async fn cmd_simulate(
    config: &Config,
    groups: Option<usize>,
    devices: Option<usize>,
    timeout_ms: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let groups = groups.unwrap_or(config.simulate.groups);
    let devices = devices.unwrap_or(config.simulate.devices_per_group);
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.registry.query_timeout());

    info!(groups, devices, ?timeout, "Starting simulation");

    let registry = DeviceManager::spawn(config.registry.clone());
    let mut rng = rand::rng();
    let mut request_id = 0u64;

    for g in 0..groups {
        let group_id = format!("group-{g}");
        for d in 0..devices {
            let device = registry.track(&group_id, &format!("device-{d}")).await?;

            // The last device of each group stays unwritten, so every query
            // result shows at least one not-tracked status.
            if d + 1 < devices {
                request_id += 1;
                device.record(request_id, rng.random_range(15.0..30.0)).await?;
            }
        }
    }

    let mut results = BTreeMap::new();
    for g in 0..groups {
        let group_id = format!("group-{g}");
        request_id += 1;
        let result = registry.query(request_id, &group_id, timeout).await?;
        results.insert(group_id, result);
    }

    print_results(&results, format)?;

    registry.shutdown().await?;
    Ok(())
}

fn print_results(results: &BTreeMap<String, AggregateResult>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results)?);
        }
        OutputFormat::Text => {
            for (group_id, result) in results {
                println!("{group_id}:");
                let mut ids: Vec<_> = result.readings.keys().collect();
                ids.sort();
                for id in ids {
                    println!("  {id}: {}", result.readings[id]);
                }
            }
        }
    }
    Ok(())
}

/// Print the effective configuration
fn cmd_check(config: &Config) -> Result<()> {
    print!("{}", serde_yaml::to_string(config).context("Failed to render configuration")?);
    Ok(())
}
