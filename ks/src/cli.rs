//! CLI argument parsing for kvstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ks")]
#[command(author, version, about = "Inspect a shared intercom key-value store", long_about = None)]
pub struct Cli {
    /// Path to the SQLite store (default: <data dir>/intercom/store.db)
    #[arg(short, long)]
    pub db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the value stored under a key
    Get {
        /// Key to read
        #[arg(required = true)]
        key: String,
    },

    /// Store a value under a key
    Set {
        /// Key to write
        #[arg(required = true)]
        key: String,

        /// Raw string value
        #[arg(required = true)]
        value: String,
    },

    /// Delete a key
    Rm {
        /// Key to delete
        #[arg(required = true)]
        key: String,
    },

    /// List all keys
    Keys,

    /// Print change notifications from other writers until interrupted
    Watch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_set() {
        let cli = Cli::parse_from(["ks", "set", "intercom_lock", "123"]);
        assert!(cli.db.is_none());
        match cli.command {
            Command::Set { key, value } => {
                assert_eq!(key, "intercom_lock");
                assert_eq!(value, "123");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_get_requires_key() {
        assert!(Cli::try_parse_from(["ks", "get"]).is_err());
    }
}
