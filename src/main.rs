use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "studio")]
#[command(version, about = "Brand studio run orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory holding `.studio/` (defaults to the current directory)
    #[arg(long, global = true, env = "STUDIO_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Run store database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a separately served UI)
        #[arg(long)]
        dev: bool,
    },
    /// Create `.studio/` with a default studio.toml
    Init,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Inspect runs in the run store
    Runs {
        #[command(subcommand)]
        command: Option<RunsCommands>,
    },
    /// Print the ordered stages a run mode walks through
    Stages {
        /// full, ingest, images, video, drift or export
        mode: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the resolved configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum RunsCommands {
    /// List runs, newest first
    List {
        /// Only runs with this status
        #[arg(long)]
        status: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one run
    Show {
        /// Run id
        id: String,

        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            cmd::cmd_serve(
                &project_dir,
                cli.verbose,
                host.clone(),
                *port,
                db_path.clone(),
                *dev,
            )
            .await?;
        }
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Runs { command } => {
            cmd::cmd_runs(&project_dir, cli.verbose, command.clone()).await?;
        }
        Commands::Stages { mode } => cmd::cmd_stages(mode)?,
    }

    Ok(())
}
