//! Daemon entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use cleave_core::SharderConfig;
use cleave_daemon::http::HttpShardClient;
use cleave_daemon::replicate::NoopReplicator;
use cleave_daemon::ring::StaticRing;
use cleave_daemon::ContainerSharder;

#[derive(Parser)]
#[command(name = "cleave-sharder", about = "Container sharding daemon")]
struct Cli {
    /// Path to the sharder configuration file.
    #[arg(long, default_value = "/etc/cleave/sharder.toml")]
    config: PathBuf,

    /// Path to the container ring file.
    #[arg(long, default_value = "/etc/cleave/container-ring.json")]
    ring: PathBuf,

    /// Base URL of the proxy tier for root-container reads.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    proxy_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single cycle, optionally restricted to devices or partitions.
    Once {
        #[arg(long, value_delimiter = ',')]
        devices: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        partitions: Vec<String>,
    },
    /// Run forever.
    Run,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    // Any init failure is fatal: there is no safe degraded mode for a daemon
    // that rewrites container databases.
    let config = match SharderConfig::from_toml_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "unable to load configuration");
            return ExitCode::FAILURE;
        }
    };
    let ring = match StaticRing::load(&cli.ring) {
        Ok(ring) => Arc::new(ring),
        Err(e) => {
            error!(error = %e, "unable to load ring");
            return ExitCode::FAILURE;
        }
    };
    let client = match HttpShardClient::new(
        cli.proxy_url,
        config.conn_timeout(),
        config.node_timeout(),
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "unable to build http client");
            return ExitCode::FAILURE;
        }
    };

    let mut sharder =
        match ContainerSharder::new(&config, ring, client, Arc::new(NoopReplicator)) {
            Ok(sharder) => sharder,
            Err(e) => {
                error!(error = %e, "unable to initialise sharder");
                return ExitCode::FAILURE;
            }
        };

    match cli.command {
        Command::Once { devices, partitions } => match sharder.run_once(&devices, &partitions) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "cycle failed");
                ExitCode::FAILURE
            }
        },
        Command::Run => sharder.run_forever(),
    }
}
