//! CLI argument parsing for intercom

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "ic")]
#[command(author, version, about = "Broadcast events between peers sharing one store", long_about = None)]
#[command(after_help = "Logs are written to: <data dir>/intercom/logs/ic.log")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Path to the SQLite store (overrides config)
    #[arg(short, long)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print events received from other peers until interrupted
    Listen {
        /// Event names to listen for
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Broadcast an event to every peer
    Emit {
        /// Event name
        #[arg(required = true)]
        name: String,

        /// JSON payload; plain text is sent as a string
        payload: Option<String>,

        /// Deduplication id
        #[arg(short, long)]
        id: Option<String>,
    },

    /// Claim a key so only one peer acts on it
    Once {
        /// Key to claim
        #[arg(required = true)]
        key: String,

        /// Message printed when this peer wins the claim
        message: Option<String>,
    },

    /// Print the message log, once-table and lock
    Dump {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Remove every bus key from the store
    Destroy,
}

/// Output format for the dump command
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format '{}'. Valid formats: text, json", s)),
        }
    }
}

/// Where the `ic` binary writes its log file
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("intercom")
        .join("logs")
        .join("ic.log")
}
