//! Pecal CLI
//!
//! Operator tools for a Pecal client state directory.
//!
//! # Commands
//!
//! - `session` - Show, validate or end the stored session
//! - `queue` - Inspect or replay the offline write queue
//! - `draft` - Show or clear a workspace's memo draft

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Pecal client state tools.
#[derive(Parser)]
#[command(name = "pecal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the client state directory
    #[arg(global = true, short, long)]
    store: Option<PathBuf>,

    /// API server (defaults to PECAL_API_BASE_URL, then https://pecal.site)
    #[arg(global = true, long)]
    server: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stored session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Offline write queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Memo drafts
    Draft {
        #[command(subcommand)]
        action: DraftAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Print the stored session without contacting the server
    Show,
    /// Validate the stored session against the server, refreshing it if needed
    Restore,
    /// Remove the stored session
    Logout,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Number of queued writes
    Count,
    /// List queued writes in replay order
    List {
        /// Include writes moved to the dead-letter list
        #[arg(short, long)]
        abandoned: bool,
    },
    /// Replay queued writes against the server
    Flush,
}

#[derive(Subcommand)]
enum DraftAction {
    /// Print the draft of a workspace
    Show {
        /// Workspace id
        #[arg(short, long)]
        workspace: i64,
    },
    /// Delete the draft of a workspace
    Clear {
        /// Workspace id
        #[arg(short, long)]
        workspace: i64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Version = cli.command {
        println!("Pecal CLI v{}", env!("CARGO_PKG_VERSION"));
        println!("Pecal sync v{}", pecal_sync::VERSION);
        return Ok(());
    }

    let path = cli.store.ok_or("State directory required (--store)")?;
    let context = commands::Context::open(&path, cli.server.as_deref())?;
    let format = cli.format.as_str();

    let result = match cli.command {
        Commands::Session { action } => match action {
            SessionAction::Show => commands::session::show(&context, format).await,
            SessionAction::Restore => commands::session::restore(&context, format).await,
            SessionAction::Logout => commands::session::logout(&context).await,
        },
        Commands::Queue { action } => match action {
            QueueAction::Count => commands::queue::count(&context, format).await,
            QueueAction::List { abandoned } => {
                commands::queue::list(&context, abandoned, format).await
            }
            QueueAction::Flush => commands::queue::flush(&context, format).await,
        },
        Commands::Draft { action } => match action {
            DraftAction::Show { workspace } => {
                commands::draft::show(&context, workspace, format).await
            }
            DraftAction::Clear { workspace } => commands::draft::clear(&context, workspace).await,
        },
        Commands::Version => Ok(()),
    };

    context.client.shutdown();
    result
}
