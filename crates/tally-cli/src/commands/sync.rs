use crate::cli::SyncCommands;
use crate::commands::common::{
    format_sync_conflict_lines, format_sync_status_lines, sync_status, Context,
};
use crate::error::CliError;

pub async fn run_sync(command: SyncCommands, context: &Context) -> Result<(), CliError> {
    match command {
        SyncCommands::Push => run_sync_push(context).await,
        SyncCommands::Pull => run_sync_pull(context).await,
        SyncCommands::Status { json } => run_sync_status(json, context).await,
        SyncCommands::Conflicts { limit, json } => run_sync_conflicts(limit, json, context).await,
    }
}

async fn run_sync_push(context: &Context) -> Result<(), CliError> {
    let engine = context.engine(context.open_store().await?)?;
    let report = engine.push().await;
    if !report.is_success() {
        return Err(CliError::SyncFailed(report.to_string()));
    }
    println!("Push completed: {report}");
    Ok(())
}

async fn run_sync_pull(context: &Context) -> Result<(), CliError> {
    let engine = context.engine(context.open_store().await?)?;
    let bootstrap = engine.bootstrap().await?;
    let report = match bootstrap.restored {
        Some(report) => report,
        None => engine.pull_all().await,
    };
    if bootstrap.walk_in_seeded {
        println!("Created the walk-in client");
    }
    if !report.is_success() {
        return Err(CliError::SyncFailed(report.to_string()));
    }
    println!("Pull completed: {report}");
    Ok(())
}

async fn run_sync_status(as_json: bool, context: &Context) -> Result<(), CliError> {
    let store = context.open_store().await?;
    let status = sync_status(&store, context.config.is_remote_configured()).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    for line in format_sync_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

async fn run_sync_conflicts(
    limit: usize,
    as_json: bool,
    context: &Context,
) -> Result<(), CliError> {
    let conflicts = context.open_store().await?.list_conflicts(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}
