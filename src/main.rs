use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use memhub::{cli, config, server};

#[derive(Parser)]
#[command(name = "memhub", version, about = "Shared memory backend for AI agents")]
struct Cli {
    /// Config file. Defaults to ~/.memhub/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    /// One trusted local session over stdin/stdout
    Stdio,
    /// Untrusted sessions over HTTP + SSE
    Http,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server
    Serve {
        /// Overrides `server.transport`
        #[arg(long, value_enum)]
        transport: Option<Transport>,
    },
    /// Write a JSON Lines backup
    Export {
        /// Output file (stdout if omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Only this owner's records and graph
        #[arg(long)]
        owner: Option<String>,
        /// Include ephemeral-scope records
        #[arg(long)]
        include_ephemeral: bool,
    },
    /// Restore a JSON Lines backup
    Import {
        file: PathBuf,
    },
    /// Manage bearer credentials for the HTTP transport
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    /// Issue a credential for an owner
    Add {
        owner: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Revoke a credential
    Revoke { key: String },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.memhub/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => config::MemhubConfig::load_from(path)?,
        None => config::MemhubConfig::load()?,
    };

    // Log to stderr so stdout stays clean for stdio frames and exports.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { transport } => {
            if let Some(transport) = transport {
                config.server.transport = match transport {
                    Transport::Stdio => "stdio".into(),
                    Transport::Http => "http".into(),
                };
            }
            server::serve(config).await?;
        }
        Command::Export {
            output,
            owner,
            include_ephemeral,
        } => {
            cli::export::export(&config, output.as_deref(), owner, include_ephemeral).await?;
        }
        Command::Import { file } => {
            cli::import::import(&config, &file).await?;
        }
        Command::Keys { action } => match action {
            KeysAction::Add { owner, label } => cli::keys::add(&config, &owner, label.as_deref())?,
            KeysAction::Revoke { key } => cli::keys::revoke(&config, &key)?,
        },
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config.embedding).await?;
            }
        },
    }

    Ok(())
}
