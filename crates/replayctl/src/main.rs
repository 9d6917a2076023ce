//! replayctl - CLI client for replayd
//!
//! Local control plane client for the chat replay test daemon.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use replay_core::RunPhase;
use std::path::PathBuf;
use std::time::Duration;

/// CLI client for the replayd chat replay daemon.
#[derive(Parser)]
#[command(name = "replayctl")]
#[command(about = "Control plane for the replayd chat replay daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7810)
    #[arg(long, global = true, env = "REPLAYD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "REPLAYD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a run from the daemon's configured case file
    Start,

    /// Pause the active run at the next group boundary
    Pause,

    /// Resume a paused run
    Resume,

    /// Stop the active run between turns
    Stop,

    /// Reset a finished run back to idle
    Restart,

    /// Show the current execution status
    Status,

    /// Show recent log entries
    Logs {
        /// Maximum entries to show
        #[arg(long)]
        limit: Option<usize>,

        /// Show the full, uncapped log trail
        #[arg(long)]
        full: bool,
    },

    /// Export result records
    Export {
        /// Export every persisted record instead of the latest run
        #[arg(long)]
        all: bool,

        /// Export a specific run
        #[arg(long)]
        run_id: Option<String>,

        /// Write a TSV report to this path instead of printing a table
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print records as JSON
        #[arg(long, conflicts_with = "output")]
        json: bool,
    },

    /// Poll status until the run reaches a terminal phase
    Watch {
        /// Poll interval in seconds
        #[arg(long, default_value = "2")]
        interval: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7810".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    // Wait for the daemon with exponential backoff before any command.
    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Start => run_start(&client).await,
        Command::Pause => run_pause(&client).await,
        Command::Resume => run_resume(&client).await,
        Command::Stop => run_stop(&client).await,
        Command::Restart => run_restart(&client).await,
        Command::Status => run_status(&client).await,
        Command::Logs { limit, full } => run_logs(&client, limit, full).await,
        Command::Export {
            all,
            run_id,
            output,
            json,
        } => run_export(&client, all, run_id, output, json).await,
        Command::Watch { interval } => run_watch(&client, interval).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run_start(client: &Client) -> Result<(), ClientError> {
    let run_id = client.start().await?;
    println!("Started run: {}", run_id);
    Ok(())
}

async fn run_pause(client: &Client) -> Result<(), ClientError> {
    client.pause().await?;
    println!("Run paused (takes effect at the next group boundary).");
    Ok(())
}

async fn run_resume(client: &Client) -> Result<(), ClientError> {
    client.resume().await?;
    println!("Run resumed.");
    Ok(())
}

async fn run_stop(client: &Client) -> Result<(), ClientError> {
    client.stop().await?;
    println!("Stop requested (takes effect between turns).");
    Ok(())
}

async fn run_restart(client: &Client) -> Result<(), ClientError> {
    client.restart().await?;
    println!("Controller reset to idle.");
    Ok(())
}

async fn run_status(client: &Client) -> Result<(), ClientError> {
    let status = client.status().await?;
    render::print_status(&status);
    Ok(())
}

async fn run_logs(client: &Client, limit: Option<usize>, full: bool) -> Result<(), ClientError> {
    let logs = if full {
        client.export_logs().await?
    } else {
        client.logs(limit).await?
    };
    render::print_logs(&logs);
    Ok(())
}

async fn run_export(
    client: &Client,
    all: bool,
    run_id: Option<String>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<(), ClientError> {
    let records = client.export(all, run_id.as_deref()).await?;

    if let Some(path) = output {
        replay_core::report::write_report(&path, &records)?;
        println!("Wrote {} record(s) to {}", records.len(), path.display());
    } else if json {
        let body = serde_json::to_string_pretty(&records)
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        println!("{body}");
    } else {
        render::print_records(&records);
    }
    Ok(())
}

async fn run_watch(client: &Client, interval: u64) -> Result<(), ClientError> {
    let interval = Duration::from_secs(interval.max(1));

    loop {
        let status = client.status().await?;
        render::print_status(&status);
        println!();

        if status.phase.is_terminal() || status.phase == RunPhase::Idle {
            break;
        }
        tokio::time::sleep(interval).await;
    }
    Ok(())
}
