//! Settings schema.
//!
//! Every struct uses `#[serde(default)]`, so a settings file only needs to
//! name the keys it changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetahubSettings {
    pub server: ServerSettings,
    pub routing: RoutingSettings,
    pub logging: LoggingSettings,
}

impl MetahubSettings {
    /// Reject values that deserialize fine but would wedge the server.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.max_connections must be greater than zero".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.send_queue_capacity must be greater than zero".into(),
            ));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeat_interval_secs must be greater than zero".into(),
            ));
        }
        if self.server.heartbeat_timeout_secs <=self.server.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeat_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.server.heartbeat_timeout_secs, self.server.heartbeat_interval_secs
            )));
        }
        if self.routing.send_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "routing.send_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Listener and per-connection limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port. `0` picks an ephemeral port.
    pub port: u16,
    /// Concurrent WebSocket connections accepted before new upgrades are refused.
    pub max_connections: usize,
    /// Largest inbound text frame, in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Interval between transport-level ping frames.
    pub heartbeat_interval_secs: u64,
    /// Silence after which a client is considered gone.
    pub heartbeat_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_connections: 256,
            max_message_size: 1024 * 1024,
            send_queue_capacity: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
        }
    }
}

/// Routing behaviour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// A send that cannot be queued within this window counts as a dead connection.
    pub send_timeout_ms: u64,
    /// Attach the full error chain to `error` replies as `debug_info`.
    pub include_debug_info: bool,
    /// Copy member-to-member direct messages to the sender's bound env.
    pub carbon_copy_env: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5_000,
            include_debug_info: false,
            carbon_copy_env: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level for every target (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-target level overrides, e.g. `{"metahub_server::router": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            module_levels: BTreeMap::new(),
        }
    }
}
