//! Threadlink Node -- operator tooling for the local threadlink database.
//!
//! Usage:
//!   threadlink-node config                        # Print effective config
//!   threadlink-node poll-interval --idle-secs 600 # Interval for an idle group
//!   threadlink-node links <identity>              # Persisted destinations
//!   threadlink-node handshakes                    # Outstanding handshakes

use std::time::Duration;

use clap::{Parser, Subcommand};
use threadlink_node::config::NodeConfig;
use threadlink_node::device_links::offline_destinations;
use threadlink_node::group_poll_task::next_poll_interval;
use threadlink_node::{expand_tilde, open_storage};
use threadlink_protocol::HandshakeState;
use threadlink_storage::Storage;

#[derive(Parser)]
#[command(name = "threadlink-node", about = "Threadlink multi-device routing node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.threadlink/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,
    /// Show the polling interval for a group idle for the given time
    PollInterval {
        /// Seconds since the group's last message (omit for never)
        #[arg(long)]
        idle_secs: Option<u64>,
    },
    /// Show the devices a message to this identity would reach
    Links {
        identity: String,
    },
    /// List conversations with a handshake in progress or expired
    Handshakes,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threadlink_node=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
        Commands::PollInterval { idle_secs } => {
            let interval = next_poll_interval(idle_secs.map(Duration::from_secs), &cfg.polling.timing());
            println!("{:.1}s", interval.as_secs_f64());
        }
        Commands::Links { identity } => {
            let storage = open_storage(&cfg)?;
            let links = storage.read_all_device_links()?;
            for dest in offline_destinations(&identity, &links) {
                let role = if dest.is_master { "master" } else { "slave" };
                println!("{:<8} {}", role, dest.identity);
            }
        }
        Commands::Handshakes => {
            let storage = open_storage(&cfg)?;
            for state in [
                HandshakeState::PendingSend,
                HandshakeState::RequestSent,
                HandshakeState::RequestReceived,
                HandshakeState::Expired,
            ] {
                for thread in storage.list_handshakes(state)? {
                    let expires = thread
                        .handshake_expires_at
                        .and_then(chrono::DateTime::from_timestamp_millis)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".into());
                    println!("{:<17} {:<25} {}", state.as_str(), expires, thread.peer);
                }
            }
        }
    }

    Ok(())
}
