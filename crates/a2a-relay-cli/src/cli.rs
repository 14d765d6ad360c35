//! Clap CLI definitions for a2a-relay.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  a2a-relay id                                 Print this agent's identity
  a2a-relay listen                             Answer requests with an echo reply
  a2a-relay send --to <identity> \"hello\"       Send a message and print the reply
  a2a-relay --relay ws://127.0.0.1:7777 listen Use a specific relay";

/// Encrypted agent-to-agent messaging over public relays.
#[derive(Parser)]
#[command(name = "a2a-relay", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.a2a-relay/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Relay URL to use instead of the configured list. Repeatable.
    #[arg(long = "relay", global = true, value_name = "URL")]
    pub relays: Vec<String>,

    /// Path to the keypair file.
    #[arg(long, global = true)]
    pub keypair: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print this agent's identity, generating a keypair if needed.
    Id,
    /// Connect and answer every request with an echo reply until Ctrl+C.
    Listen,
    /// Send one message and print the reply.
    Send {
        /// Recipient identity (64 hex characters).
        #[arg(long)]
        to: String,
        /// Seconds to wait for the reply (default: request_timeout_secs).
        #[arg(long)]
        timeout: Option<u64>,
        /// Message text.
        text: String,
    },
}
