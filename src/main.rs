mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use miette::Diagnostic;
use slink::Error as SlinkError;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Job failures: the wrapped command's own output is the user
        // feedback. Just propagate the exit code without printing a
        // redundant error.
        if let Some(SlinkError::JobExited { code }) = e.downcast_ref::<SlinkError>() {
            std::process::exit(*code);
        }

        if let Some(slink_error) = e.downcast_ref::<SlinkError>() {
            eprintln!("Error: {}", slink_error);
            if let Some(help) = slink_error.help() {
                eprintln!("\nHint: {}", help);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Run(args) => commands::run_submit(args, commands::SubmitMode::Srun).await,
        Commands::Batch(args) => commands::run_submit(args, commands::SubmitMode::Batch).await,
        Commands::Print { args, batch } => commands::run_print(args, *batch),
        Commands::Release { identifier } => commands::run_release(identifier),
        Commands::Status { json } => commands::run_status(*json),
        Commands::Tunnel {
            service_port,
            loopback_port,
            login_host,
            login_user,
        } => commands::run_tunnel(*service_port, *loopback_port, login_host, login_user),
        Commands::Provision => commands::run_provision().await,
    }
}

/// Logs go to stderr so generated scripts and printed command lines stay
/// machine-readable on stdout.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("SLINK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
