use tally_core::config::TallyConfig;
use tally_core::util::{is_http_url, normalize_text_option};

use crate::cli::ConfigCommands;
use crate::commands::common::Context;
use crate::error::CliError;

pub fn run_config(command: ConfigCommands, context: &Context) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => {
            println!("Config file: {}", context.config_path.display());
            println!("Database: {}", context.db_path.display());
            println!("{:#?}", context.config);
            Ok(())
        }
        ConfigCommands::Init {
            supabase_url,
            supabase_anon_key,
            identity_strategy,
        } => {
            let existing = TallyConfig::load_from_path(&context.config_path)?;
            let config =
                apply_init(existing, supabase_url, supabase_anon_key, identity_strategy)?;
            config.save_to_path(&context.config_path)?;
            println!("Saved config to {}", context.config_path.display());
            Ok(())
        }
    }
}

/// Merge `config init` flags into the file's current values.
pub fn apply_init(
    mut config: TallyConfig,
    supabase_url: Option<String>,
    supabase_anon_key: Option<String>,
    identity_strategy: Option<String>,
) -> Result<TallyConfig, CliError> {
    if let Some(url) = normalize_text_option(supabase_url) {
        if !is_http_url(&url) {
            return Err(CliError::InvalidArgument(
                "Supabase URL must include http:// or https://".to_string(),
            ));
        }
        config.supabase_url = Some(url.trim_end_matches('/').to_string());
    }
    if let Some(key) = normalize_text_option(supabase_anon_key) {
        config.supabase_anon_key = Some(key);
    }
    if let Some(strategy) = normalize_text_option(identity_strategy) {
        config.identity_strategy = strategy.parse().map_err(CliError::InvalidArgument)?;
    }
    config.validate()?;
    Ok(config)
}
