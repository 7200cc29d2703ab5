// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::PathBuf;

use anyhow::Result;
use cc_logging::{CliLogLevel, init_plaintext};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use cc_helper::server::HelperServer;

#[derive(Parser, Debug)]
#[command(author, version, about = "cc instance helper", long_about = None)]
struct Args {
    /// Path to the Unix socket to listen on
    #[arg(long)]
    socket: PathBuf,

    /// Log verbosity level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = init_plaintext("cc-helper", args.log_level.into()) {
        eprintln!("cc-helper: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(args).await {
        error!(error = %e, "fatal");
        eprintln!("cc-helper: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut server = HelperServer::new(args.socket)?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = sigint.recv() => {
            info!(signal = "SIGINT", "shutting down");
        }
        _ = sigterm.recv() => {
            info!(signal = "SIGTERM", "shutting down");
        }
    }
    server.shutdown().await?;
    Ok(())
}
