use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use incidents_core::models::IncidentStatus;
use incidents_core::SyncStatus;

#[derive(Parser)]
#[command(name = "incidents")]
#[command(about = "File incident reports offline and sync them when a connection is available")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// File a new incident report
    #[command(alias = "new")]
    Create(CreateArgs),
    /// List local reports
    List {
        /// Only show reports in this sync state
        #[arg(long, value_parser = parse_sync_status)]
        status: Option<SyncStatus>,
        /// Number of reports to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one report with its attachments
    Show {
        /// Report ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit fields of a report
    Edit(EditArgs),
    /// Delete a report
    Delete {
        /// Report ID or unique ID prefix
        id: String,
    },
    /// Attach a photo or file to a report
    Attach {
        /// Report ID or unique ID prefix
        id: String,
        /// File to attach
        path: PathBuf,
        /// MIME type (guessed from the file name when omitted)
        #[arg(long)]
        mime: Option<String>,
    },
    /// Send queued changes to the server
    Sync {
        /// Keep running and sync in the background until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Re-queue a report that failed to sync
    Retry {
        /// Report ID or unique ID prefix
        id: String,
    },
    /// Resolve an edit conflict
    Resolve {
        /// Report ID or unique ID prefix
        id: String,
        /// Which version to keep
        #[arg(long, value_enum)]
        keep: ConflictSide,
    },
    /// Show session, server and queue state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Log in to the incident server
    Login {
        /// Account email
        #[arg(long, value_name = "EMAIL")]
        email: String,
        /// Account password
        #[arg(long, value_name = "PASSWORD")]
        password: String,
    },
    /// Forget the saved session
    Logout,
    /// Inspect or change client settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args)]
pub struct CreateArgs {
    /// Report title
    #[arg(required = true)]
    pub title: Vec<String>,
    #[arg(short, long)]
    pub description: Option<String>,
    /// Incident type, e.g. "Fire" or "Flood"
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub incident_type: Option<String>,
    /// Workflow status (pending, ongoing, resolved)
    #[arg(long, value_parser = parse_incident_status)]
    pub status: Option<IncidentStatus>,
    #[arg(long, allow_hyphen_values = true, requires = "lon")]
    pub lat: Option<f64>,
    #[arg(long, allow_hyphen_values = true, requires = "lat")]
    pub lon: Option<f64>,
    /// Files to attach
    #[arg(short, long = "attach", value_name = "PATH")]
    pub attachments: Vec<PathBuf>,
}

#[derive(Args)]
pub struct EditArgs {
    /// Report ID or unique ID prefix
    pub id: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(short, long)]
    pub description: Option<String>,
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub incident_type: Option<String>,
    #[arg(long, value_parser = parse_incident_status)]
    pub status: Option<IncidentStatus>,
    #[arg(long, allow_hyphen_values = true, requires = "lon")]
    pub lat: Option<f64>,
    #[arg(long, allow_hyphen_values = true, requires = "lat")]
    pub lon: Option<f64>,
    /// Remove the location
    #[arg(long, conflicts_with_all = ["lat", "lon"])]
    pub clear_location: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConflictSide {
    Local,
    Remote,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Save a server base URL that overrides POCKETBASE_URL
    SetUrl {
        #[arg(value_name = "URL")]
        url: String,
    },
    /// Remove the saved server URL
    ClearUrl,
}

fn parse_incident_status(value: &str) -> Result<IncidentStatus, String> {
    value.parse().map_err(|error: incidents_core::Error| error.to_string())
}

fn parse_sync_status(value: &str) -> Result<SyncStatus, String> {
    value
        .trim()
        .replace('-', "_")
        .parse()
        .map_err(|error: incidents_core::Error| error.to_string())
}
