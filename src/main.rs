use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use trilha::config::{DEFAULT_CONFIG_FILE, TrilhaConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "trilha")]
#[command(version, about = "Patient-case pipeline with a live Kanban board")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, env = "TRILHA_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Override the database path
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter trilha.toml and create the database
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the HTTP API and board feed
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Allow cross-origin requests from any origin
        #[arg(long)]
        cors: bool,
    },
    /// List the configured board views
    Views,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show a case's outstanding pendencies
    Pendencies {
        case_id: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export a case record
    Export {
        case_id: String,
        /// Comma-separated sections (summary, assignments, clinical-notes, sessions, files)
        #[arg(long)]
        sections: Option<String>,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Commands::Init { force } = &cli.command {
        return cmd::cmd_init(&cli.config, cli.db_path.as_deref(), *force);
    }

    let mut config = TrilhaConfig::load_or_default(&cli.config)?;
    config.apply_env()?;
    if let Some(db_path) = &cli.db_path {
        config.server.db_path = db_path.clone();
    }
    let _log_guard = trilha::logging::init(&config.logging)?;

    match &cli.command {
        Commands::Init { .. } => {}
        Commands::Serve { host, port, cors } => {
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(port) = port {
                config.server.port = *port;
            }
            if *cors {
                config.server.cors_permissive = true;
            }
            cmd::cmd_serve(config).await?;
        }
        Commands::Views => cmd::cmd_views(&config)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command.clone())?,
        Commands::Pendencies { case_id, json } => {
            cmd::cmd_pendencies(&config, case_id, *json).await?
        }
        Commands::Export {
            case_id,
            sections,
            output,
        } => cmd::cmd_export(&config, case_id, sections.as_deref(), output.as_deref()).await?,
    }

    Ok(())
}
