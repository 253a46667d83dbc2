use std::path::Path;

use incidents_core::config::normalize_base_url;

use crate::cli::ConfigCommands;
use crate::commands::common::{attachments_dir, App};
use crate::error::CliError;

pub async fn run_config(command: ConfigCommands, db_path: &Path) -> Result<(), CliError> {
    let app = App::open(db_path).await?;
    match command {
        ConfigCommands::Show => {
            let settings = app.settings().await?;
            println!("database:    {}", db_path.display());
            println!("attachments: {}", attachments_dir(db_path).display());
            match app.api_config().await? {
                Some(config) => {
                    let source = if settings.api_base_url.is_some() {
                        "saved"
                    } else {
                        "environment"
                    };
                    println!("server:      {} ({source})", config.base_url);
                    println!("collection:  {}", config.collection);
                }
                None => println!("server:      not configured"),
            }
        }
        ConfigCommands::SetUrl { url } => {
            let base_url = normalize_base_url(&url)?;
            let mut settings = app.settings().await?;
            settings.api_base_url = Some(base_url.clone());
            app.save_settings(&settings).await?;
            println!("{base_url}");
        }
        ConfigCommands::ClearUrl => {
            let mut settings = app.settings().await?;
            settings.api_base_url = None;
            app.save_settings(&settings).await?;
            println!("Saved server URL cleared");
        }
    }
    Ok(())
}
