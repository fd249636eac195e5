//! Tigerbalm host entry point.
//!
//! Loads the configuration named by `-f`, starts logging, loads the plugin
//! directory and serves HTTP until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tigerbalm_gateway::{Host, telemetry};
use tigerbalm_kernel::config::TigerbalmConfig;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "tigerbalm", version, about = "Scriptable HTTP and Kafka event host")]
struct Cli {
    /// Configuration file (yaml, toml or json).
    #[arg(
        short = 'f',
        long = "file",
        env = "TIGERBALM_CONFIG",
        default_value = "./tigerbalm.yaml"
    )]
    file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TigerbalmConfig::load(&cli.file)
        .with_context(|| format!("loading {}", cli.file.display()))?;
    let _guard = telemetry::init(&config.log)?;

    let host = Host::build(config).await.context("starting host")?;
    let served = host.serve(shutdown_signal()).await;
    host.fini().await;
    served.context("serving http")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received"),
        _ = terminate => info!("terminate received"),
    }
}
