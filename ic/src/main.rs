//! ic - command-line peer on an intercom bus
//!
//! Every invocation is one peer on the SQLite-backed store, so several `ic`
//! processes (or any other peers on the same file) can talk to each other.

use std::fs;

use chrono::{Local, TimeZone};
use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info};

use intercom::cli::{Cli, Command, OutputFormat, get_log_path};
use intercom::{BindingRegistry, Config, Intercom, MessageLog, OnceTable};
use kvstore::{KvStore, SqliteBackend};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(db) = cli.db.clone() {
        config.store.path = db;
    }

    let backend = SqliteBackend::open_with_poll(&config.store.path, config.store.poll_interval())
        .context(format!("Failed to open store at {}", config.store.path.display()))?;
    let store = KvStore::new(backend);
    info!(path = %config.store.path.display(), "ic: store opened");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Listen { names } => cmd_listen(&config, store, names).await,
        Command::Emit { name, payload, id } => cmd_emit(&config, store, &name, payload, id).await,
        Command::Once { key, message } => cmd_once(&config, store, &key, message).await,
        Command::Dump { format } => cmd_dump(&config, &store, format),
        Command::Destroy => {
            Intercom::destroy(&store, &config.bus);
            println!("{} Removed bus keys from {}", "✓".green(), config.store.path.display());
            Ok(())
        }
    }
}

fn bus(config: &Config, store: KvStore) -> Intercom {
    Intercom::with_config(store, config.bus.clone(), BindingRegistry::with_defaults())
}

/// Print events from other peers until Ctrl-C
async fn cmd_listen(config: &Config, store: KvStore, names: Vec<String>) -> Result<()> {
    debug!(?names, "cmd_listen: called");
    let bus = bus(config, store);

    for name in &names {
        let label = name.clone();
        bus.on(name, move |payload| {
            let at = Local::now().format("%H:%M:%S%.3f").to_string();
            println!("{} {} {}", at.dimmed(), label.cyan(), payload);
        });
    }

    println!("{} {} ({})", "listening".yellow(), names.join(", "), "Ctrl-C to stop".dimmed());
    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    Ok(())
}

async fn cmd_emit(
    config: &Config,
    store: KvStore,
    name: &str,
    payload: Option<String>,
    id: Option<String>,
) -> Result<()> {
    debug!(%name, ?id, "cmd_emit: called");
    let payload = parse_payload(payload);
    let bus = bus(config, store);

    let sent = match id.as_deref() {
        Some(id) => bus.emit_with_id(name, payload, id).await,
        None => bus.emit(name, payload).await,
    };

    if sent {
        println!("{} {}", "✓ emitted".green(), name.cyan());
    } else {
        println!("{} {} (duplicate id)", "skipped".yellow(), name.cyan());
    }
    Ok(())
}

async fn cmd_once(config: &Config, store: KvStore, key: &str, message: Option<String>) -> Result<()> {
    debug!(%key, "cmd_once: called");
    let bus = bus(config, store);

    let claimed = bus
        .once(key, || {
            if let Some(message) = &message {
                println!("{}", message);
            }
        })
        .await;

    if claimed {
        println!("{} {}", "✓ claimed".green(), key.cyan());
    } else {
        println!("{} {}", "already claimed".yellow(), key.cyan());
    }
    Ok(())
}

fn cmd_dump(config: &Config, store: &KvStore, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_dump: called");
    let bus = &config.bus;
    let log = MessageLog::parse(store.get(&bus.log_key).as_deref());
    let once = OnceTable::parse(store.get(&bus.once_key).as_deref());
    let lock = store.get(&bus.lock_key);

    match format {
        OutputFormat::Json => {
            let claims: serde_json::Map<String, Value> =
                once.iter().map(|(key, at)| (key.to_string(), json!(at))).collect();
            let dump = json!({
                "log": log.packets(),
                "once": claims,
                "lock": lock,
            });
            println!("{}", serde_json::to_string_pretty(&dump).context("Failed to encode dump")?);
        }
        OutputFormat::Text => {
            println!("{} ({} packets)", bus.log_key.bold(), log.len());
            for packet in log.packets() {
                println!(
                    "  {} {} {} {} {}",
                    format_millis(packet.timestamp).dimmed(),
                    short_origin(&packet.origin),
                    packet.name.cyan(),
                    packet.dedup_id().map(|id| format!("[{}]", id)).unwrap_or_default().yellow(),
                    packet.payload
                );
            }

            println!("{} ({} claims)", bus.once_key.bold(), once.len());
            for (key, at) in once.iter() {
                println!("  {} {}", format_millis(at).dimmed(), key.cyan());
            }

            let lock = match lock {
                Some(raw) => match raw.parse::<i64>() {
                    Ok(millis) => format!("held since {}", format_millis(millis)).red().to_string(),
                    Err(_) => format!("unparseable: {}", raw).yellow().to_string(),
                },
                None => "free".green().to_string(),
            };
            println!("{} {}", bus.lock_key.bold(), lock);
        }
    }
    Ok(())
}

/// JSON if it parses, otherwise the raw text as a string
fn parse_payload(raw: Option<String>) -> Value {
    match raw {
        Some(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        None => Value::Null,
    }
}

fn format_millis(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => millis.to_string(),
    }
}

fn short_origin(origin: &str) -> &str {
    origin.get(origin.len().saturating_sub(8)..).unwrap_or(origin)
}
