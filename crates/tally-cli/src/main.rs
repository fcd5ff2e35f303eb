//! Tally CLI - offline-first sales ledger from the command line
//!
//! Every change is written to the local store first and uploaded when the
//! remote store is configured and reachable.

mod cli;
mod commands;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::catalog::{run_client, run_employee, run_product};
use crate::commands::common::Context;
use crate::commands::config::run_config;
use crate::commands::day::run_day;
use crate::commands::order::{run_order, run_status, run_void, OrderArgs};
use crate::commands::sync::run_sync;
use crate::commands::watch::run_watch;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tally=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let context = Context::load(cli.config, cli.db_path, cli.offline)?;

    match cli.command {
        Commands::Client { command } => run_client(command, &context).await,
        Commands::Product { command } => run_product(command, &context).await,
        Commands::Employee { command } => run_employee(command, &context).await,
        Commands::Order {
            lines,
            client,
            day,
            purchase,
            pay,
        } => {
            run_order(
                OrderArgs {
                    lines,
                    client,
                    day,
                    purchase,
                    pay,
                },
                &context,
            )
            .await
        }
        Commands::Void { id } => run_void(&id, &context).await,
        Commands::Status { id, status } => run_status(&id, status, &context).await,
        Commands::Day { day, json } => run_day(day.as_deref(), json, &context).await,
        Commands::Sync { command } => run_sync(command, &context).await,
        Commands::Watch { day } => run_watch(day.as_deref(), &context).await,
        Commands::Config { command } => run_config(command, &context),
    }
}
