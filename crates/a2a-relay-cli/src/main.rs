//! a2a-relay CLI: a minimal agent on top of the relay transport.

mod cli;

use a2a_relay_types::config::load_config;
use a2a_relay_types::TransportConfig;
use a2a_relay_wire::{AgentMessage, Keypair, MessageHandler, RelayTransport};
use async_trait::async_trait;
use clap::Parser;
use cli::{Cli, Commands};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Answers every request with the text it received.
struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle_message(
        &self,
        sender: &str,
        message: AgentMessage,
    ) -> Result<AgentMessage, String> {
        let text = message.text();
        info!(sender = %sender, chars = text.len(), "Request received");
        let mut reply = AgentMessage::agent_text(format!("echo: {text}"));
        reply.context_id = message.context_id;
        Ok(reply)
    }
}

fn init_tracing(default_level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref());
    if !cli.relays.is_empty() {
        config.relays = cli.relays.clone();
    }
    if let Some(path) = &cli.keypair {
        config.keypair_path = path.clone();
    }

    init_tracing(&config.log_level, cli.json_logs);
    debug!(
        relays = config.relays.len(),
        keypair = %config.keypair_path.display(),
        "Configuration resolved"
    );

    if let Err(e) = run(cli.command, config) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(command: Commands, config: TransportConfig) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Id => {
            let keypair = Keypair::load_or_generate(&config.keypair_path)?;
            println!("{}", keypair.identity());
            Ok(())
        }
        Commands::Listen => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cmd_listen(config))
        }
        Commands::Send { to, timeout, text } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cmd_send(config, &to, timeout.map(Duration::from_secs), &text))
        }
    }
}

async fn cmd_listen(config: TransportConfig) -> Result<(), Box<dyn std::error::Error>> {
    let relays = config.relays.clone();
    let transport = RelayTransport::from_config(config)?;
    transport.on_message(Arc::new(EchoHandler));
    transport.connect(&relays).await?;

    println!("Listening as {}", transport.identity());
    println!("Connected relays: {}", transport.connected_relays().join(", "));
    println!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    transport.disconnect().await;
    Ok(())
}

async fn cmd_send(
    config: TransportConfig,
    to: &str,
    timeout: Option<Duration>,
    text: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let relays = config.relays.clone();
    let transport = RelayTransport::from_config(config)?;
    transport.connect(&relays).await?;

    let result = transport
        .send(to, AgentMessage::user_text(text), timeout)
        .await;
    transport.disconnect().await;

    println!("{}", result?.text());
    Ok(())
}
