//! Transport configuration, loaded from `~/.a2a-relay/config.toml` with defaults.
//!
//! Every knob the transport needs is carried explicitly in [`TransportConfig`]
//! and handed to the transport at construction; nothing is read from
//! process-wide state after startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Event kind used for agent request/response events.
pub const DEFAULT_EVENT_KIND: u32 = 4339;

/// Relays used when the config does not list any.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
];

/// Configuration for the relay transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Relay WebSocket URLs to connect to.
    pub relays: Vec<String>,
    /// Where the agent keypair is persisted.
    pub keypair_path: PathBuf,
    /// Event kind used for requests and responses.
    pub event_kind: u32,
    /// Default deadline for `send()`.
    pub request_timeout_secs: u64,
    /// How long a relay has to acknowledge a published event.
    pub publish_timeout_secs: u64,
    /// How long a single connection attempt may take.
    pub connect_timeout_secs: u64,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay_secs: u64,
    /// Whether relay links reconnect after an unexpected close.
    pub auto_reconnect: bool,
    /// How far back the inbox subscription reaches (`since = now - window`).
    pub since_window_secs: u64,
    /// Default log filter when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
            keypair_path: a2a_relay_home().join("keypair.json"),
            event_kind: DEFAULT_EVENT_KIND,
            request_timeout_secs: 30,
            publish_timeout_secs: 10,
            connect_timeout_secs: 10,
            reconnect_delay_secs: 5,
            auto_reconnect: true,
            since_window_secs: 60,
            log_level: "info".to_string(),
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Load transport configuration from a TOML file, with defaults.
///
/// A missing, unreadable, or invalid file is logged and replaced by
/// [`TransportConfig::default`]; fields absent from the file take their
/// default values.
pub fn load_config(path: Option<&Path>) -> TransportConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return TransportConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<TransportConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                TransportConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            TransportConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    a2a_relay_home().join("config.toml")
}

/// Get the default a2a-relay home directory.
pub fn a2a_relay_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".a2a-relay")
}
