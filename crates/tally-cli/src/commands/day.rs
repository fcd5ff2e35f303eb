use crate::commands::common::{format_ledger_lines, parse_day, Context};
use crate::error::CliError;

pub async fn run_day(day: Option<&str>, as_json: bool, context: &Context) -> Result<(), CliError> {
    let day = parse_day(day)?;
    let ledger = context.ledger().await?.daily_ledger(day).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&ledger)?);
        return Ok(());
    }
    for line in format_ledger_lines(&ledger) {
        println!("{line}");
    }
    Ok(())
}
