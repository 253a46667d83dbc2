//! Incidents CLI - file and sync incident reports from the command line
//!
//! Everything works offline; `incidents sync` delivers queued changes once
//! the server is reachable.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::attach::run_attach;
use crate::commands::auth::{run_login, run_logout};
use crate::commands::common::resolve_db_path;
use crate::commands::config::run_config;
use crate::commands::create::run_create;
use crate::commands::delete::run_delete;
use crate::commands::edit::run_edit;
use crate::commands::list::run_list;
use crate::commands::resolve::run_resolve;
use crate::commands::retry::run_retry;
use crate::commands::show::run_show;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
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

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "incidents=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path)?;

    match cli.command {
        Commands::Create(args) => run_create(args, &db_path).await,
        Commands::List {
            status,
            limit,
            json,
        } => run_list(status, limit, json, &db_path).await,
        Commands::Show { id, json } => run_show(&id, json, &db_path).await,
        Commands::Edit(args) => run_edit(args, &db_path).await,
        Commands::Delete { id } => run_delete(&id, &db_path).await,
        Commands::Attach { id, path, mime } => {
            run_attach(&id, &path, mime.as_deref(), &db_path).await
        }
        Commands::Sync { watch } => run_sync(watch, &db_path).await,
        Commands::Retry { id } => run_retry(&id, &db_path).await,
        Commands::Resolve { id, keep } => run_resolve(&id, keep, &db_path).await,
        Commands::Status { json } => run_status(json, &db_path).await,
        Commands::Login { email, password } => run_login(&email, &password, &db_path).await,
        Commands::Logout => run_logout(&db_path).await,
        Commands::Config { command } => run_config(command, &db_path).await,
    }
}
