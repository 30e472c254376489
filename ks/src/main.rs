use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::info;

use kvstore::cli::{Cli, Command};
use kvstore::{KvBackend, SqliteBackend, default_db_path};

fn setup_logging(level: Option<&str>) -> Result<()> {
    let level = level.unwrap_or("warn");
    let filter = tracing_subscriber::EnvFilter::try_new(level).context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let db = cli.db.clone().unwrap_or_else(default_db_path);
    let store = SqliteBackend::open(&db).context(format!("Failed to open store at {}", db.display()))?;
    info!(?db, "kvstore starting");

    match cli.command {
        Command::Get { key } => match store.get(&key)? {
            Some(value) => println!("{}", value),
            None => println!("{} {}", "missing:".dimmed(), key),
        },
        Command::Set { key, value } => {
            store.set(&key, &value)?;
            println!("{} {}", "✓".green(), key.cyan());
        }
        Command::Rm { key } => {
            store.remove(&key)?;
            println!("{} Removed {}", "✓".green(), key.cyan());
        }
        Command::Keys => {
            let keys = store.keys()?;
            if keys.is_empty() {
                println!("No keys found");
            } else {
                for key in keys {
                    println!("{}", key);
                }
            }
        }
        Command::Watch => {
            let mut rx = store.subscribe();
            println!("{} {}", "watching".yellow(), db.display());
            loop {
                tokio::select! {
                    change = rx.recv() => match change {
                        Ok(change) => println!(
                            "{} {}",
                            "changed".green(),
                            change.key.as_deref().unwrap_or("<unknown key>")
                        ),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            println!("{} {} notifications", "skipped".yellow(), n)
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    Ok(())
}
