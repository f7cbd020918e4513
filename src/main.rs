//! Chatstore CLI
//!
//! Command-line interface over a chatstore data directory:
//! - Append to and query the message / audit streams
//! - Manage accounts
//! - Inspect storage statistics

use anyhow::{bail, Context};
use chatstore::accounts::AccountRecord;
use chatstore::config::{generate_default_config, Config};
use chatstore::storage::{Entry, EventLog, StorageConfig, StorageEngine};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "chatstore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "File-based storage engine for chat messages, logs and accounts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the usual locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory, overriding the config
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Stream {
    Messages,
    Logs,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate default config file
    InitConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show storage statistics
    Stats,

    /// Append an entry to a stream
    Append {
        stream: Stream,
        /// Timestamp: "now", ISO 8601, or Unix milliseconds
        time: String,
        payload: String,
    },

    /// Entries with timestamps in [start, end]
    Range {
        stream: Stream,
        start: String,
        end: String,
    },

    /// Entries next to a timestamp
    Near {
        stream: Stream,
        time: String,
        /// Number of entries
        #[arg(default_value = "20")]
        count: usize,
        /// Entries at or after the timestamp instead of before it
        #[arg(long)]
        following: bool,
    },

    /// Erase entries with timestamps in [start, end]
    Wipe {
        stream: Stream,
        start: String,
        end: String,
    },

    /// Manage accounts
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create an account
    Add {
        username: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
        /// Pre-computed password hash (e.g. bcrypt)
        #[arg(long)]
        password_hash: String,
    },
    /// Show an account
    Get { username: String },
    /// Delete an account and its profile picture
    Delete { username: String },
    /// List usernames
    List,
    /// Set a profile picture from a file
    Picture { username: String, path: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.to_string_lossy().to_string();
    }

    init_logging(&config);

    if let Commands::InitConfig { output } = &cli.command {
        return write_default_config(output.as_ref());
    }

    let storage_config = StorageConfig::from(&config.storage);
    tracing::debug!("Data directory: {:?}", storage_config.data_dir);
    let engine = StorageEngine::open(storage_config)
        .await
        .context("opening storage engine")?;
    let json = cli.format == "json";

    match cli.command {
        Commands::InitConfig { .. } => {}

        Commands::Stats => {
            let stats = engine.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", stats);
            }
        }

        Commands::Append {
            stream,
            time,
            payload,
        } => {
            let timestamp = parse_timestamp(&time)?;
            select(&engine, stream)
                .append(timestamp, payload.into_bytes())
                .await?;
            println!("Appended at {}", format_timestamp(timestamp));
        }

        Commands::Range { stream, start, end } => {
            let entries = select(&engine, stream)
                .range_query(parse_timestamp(&start)?, parse_timestamp(&end)?)
                .await?;
            print_entries(&entries, json)?;
        }

        Commands::Near {
            stream,
            time,
            count,
            following,
        } => {
            let entries = select(&engine, stream)
                .near_query(parse_timestamp(&time)?, count, !following)
                .await?;
            print_entries(&entries, json)?;
        }

        Commands::Wipe { stream, start, end } => {
            let wiped = select(&engine, stream)
                .wipe(parse_timestamp(&start)?, parse_timestamp(&end)?)
                .await?;
            println!("Wiped {} entries", wiped);
        }

        Commands::User { command } => run_user(&engine, command, json).await?,
    }

    Ok(())
}

fn write_default_config(output: Option<&PathBuf>) -> anyhow::Result<()> {
    let content = generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, content).with_context(|| format!("writing config to {:?}", path))?;
            println!("Config written to {:?}", path);
        }
        None => print!("{}", content),
    }
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chatstore={}", config.logging.level)));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so command output stays pipeable
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn select(engine: &StorageEngine, stream: Stream) -> &EventLog {
    match stream {
        Stream::Messages => engine.messages(),
        Stream::Logs => engine.logs(),
    }
}

async fn run_user(engine: &StorageEngine, command: UserCommands, json: bool) -> anyhow::Result<()> {
    let accounts = engine.accounts();
    match command {
        UserCommands::Add {
            username,
            first_name,
            last_name,
            password_hash,
        } => {
            let record = AccountRecord::new(first_name, last_name, password_hash);
            accounts.insert(&username, &record).await?;
            println!("Created account '{}'", username);
        }

        UserCommands::Get { username } => {
            let record = accounts.get(&username).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("Username:   {}", username);
                println!("Name:       {} {}", record.first_name, record.last_name);
                println!(
                    "Picture:    {}",
                    match record.blob_pointer {
                        0 => "none".to_string(),
                        offset => format!("blob@{}", offset),
                    }
                );
            }
        }

        UserCommands::Delete { username } => {
            engine.remove_account(&username).await?;
            println!("Deleted account '{}'", username);
        }

        UserCommands::List => {
            let names = accounts.usernames().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else {
                for name in &names {
                    println!("{}", name);
                }
                println!("({} accounts)", names.len());
            }
        }

        UserCommands::Picture { username, path } => {
            let picture = std::fs::read(&path).with_context(|| format!("reading {:?}", path))?;
            let handle = engine.set_profile_picture(&username, &picture).await?;
            println!("Stored {} bytes for '{}' at {}", picture.len(), username, handle);
        }
    }
    Ok(())
}

/// Parse "now", an RFC 3339 date, or Unix milliseconds
fn parse_timestamp(s: &str) -> anyhow::Result<i64> {
    if s == "now" {
        return Ok(Utc::now().timestamp_millis());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    match s.parse::<i64>() {
        Ok(ts) => Ok(ts),
        Err(_) => bail!("Invalid timestamp format: {}", s),
    }
}

fn format_timestamp(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

fn print_entries(entries: &[Entry], json: bool) -> anyhow::Result<()> {
    if json {
        let rows: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "timestamp": e.timestamp,
                    "time": format_timestamp(e.timestamp),
                    "payload": e.payload_str(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for entry in entries {
        println!("{}  {}", format_timestamp(entry.timestamp), entry.payload_str());
    }
    println!("({} entries)", entries.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("1500").unwrap(), 1500);
        assert_eq!(
            parse_timestamp("1970-01-01T00:00:01Z").unwrap(),
            1000
        );
        assert!(parse_timestamp("now").unwrap() > 0);
        assert!(parse_timestamp("yesterday-ish").is_err());
    }

    #[test]
    fn test_cli_parses_near() {
        let cli = Cli::parse_from(["chatstore", "near", "messages", "now", "5", "--following"]);
        match cli.command {
            Commands::Near {
                count, following, ..
            } => {
                assert_eq!(count, 5);
                assert!(following);
            }
            _ => panic!("expected near"),
        }
    }
}
