//! Server configuration.

use std::time::Duration;

use metahub_settings::MetahubSettings;

/// Runtime configuration for [`HubServer`](crate::server::HubServer).
///
/// Built from [`MetahubSettings`] by the binary; tests construct it directly.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound queue depth per connection.
    pub send_queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub routing: RoutingConfig,
}

/// Knobs the hub consults while routing.
#[derive(Clone, Debug)]
pub struct RoutingConfig {
    /// A send that cannot be enqueued within this window is a dead connection.
    pub send_timeout: Duration,
    pub include_debug_info: bool,
    pub carbon_copy_env: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            include_debug_info: false,
            carbon_copy_env: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 256,
            max_message_size: 1024 * 1024,
            send_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            routing: RoutingConfig::default(),
        }
    }
}

impl From<&MetahubSettings> for ServerConfig {
    fn from(settings: &MetahubSettings) -> Self {
        let server = &settings.server;
        let routing = &settings.routing;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            max_message_size: server.max_message_size,
            send_queue_capacity: server.send_queue_capacity,
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(server.heartbeat_timeout_secs),
            routing: RoutingConfig {
                send_timeout: Duration::from_millis(routing.send_timeout_ms),
                include_debug_info: routing.include_debug_info,
                carbon_copy_env: routing.carbon_copy_env,
            },
        }
    }
}
