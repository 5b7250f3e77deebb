//! CLI entry point for the ABR orchestrator
//!
//! Parses command line arguments, installs logging and runs the daemon.

use abr_orchestrator::Daemon;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// ABR Orchestrator - live RTMP sources to multi-rendition HLS
#[derive(Parser, Debug)]
#[command(name = "abr-orchestrator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip the encoder binary check. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config = %args.config.display(), "ABR orchestrator starting");
    if args.skip_checks {
        warn!("skipping encoder check (--skip-checks enabled)");
    }

    let daemon = match Daemon::new(&args.config, args.skip_checks).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    info!(
        bind = %daemon.config.server.bind,
        renditions = daemon.config.ladder.len(),
        output_root = %daemon.config.output.root.display(),
        "daemon initialized"
    );

    if let Err(e) = daemon.run_with_server().await {
        error!(error = %e, "daemon error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
