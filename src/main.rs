//! # metahub
//!
//! Hub binary: loads settings, installs logging and serves the WebSocket
//! hub until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metahub_server::{HubServer, ServerConfig};
use metahub_settings::MetahubSettings;
use metahub_telemetry::{init_telemetry, TelemetryConfig};

/// Real-time message hub for environment, agent and human clients.
#[derive(Parser, Debug)]
#[command(name = "metahub", version, about)]
struct Cli {
    /// Settings file (defaults to `~/.metahub/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Include diagnostic traces in error replies.
    #[arg(long)]
    debug_info: bool,

    /// Seconds to wait for sessions to close on shutdown.
    #[arg(long, default_value = "10")]
    shutdown_timeout: u64,
}

impl Cli {
    fn load_settings(&self) -> Result<MetahubSettings> {
        let mut settings = match &self.config {
            Some(path) => metahub_settings::load_settings_from_path(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => metahub_settings::load_settings().context("failed to load settings")?,
        };
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if self.debug_info {
            settings.routing.include_debug_info = true;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    let logging = &settings.logging;
    let telemetry = TelemetryConfig::from_levels(&logging.level, &logging.module_levels, logging.json)
        .context("invalid logging settings")?;
    init_telemetry(&telemetry).context("failed to initialise logging")?;

    let server = HubServer::new(ServerConfig::from(&settings));
    let (addr, handle) = server.listen().await.context("failed to bind server")?;
    tracing::info!(
        %addr,
        debug_info = settings.routing.include_debug_info,
        "metahub listening on ws://{addr}/ws"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    let clean = server
        .shutdown()
        .graceful_shutdown(Some(Duration::from_secs(cli.shutdown_timeout)))
        .await;
    let _ = handle.await;
    tracing::info!(clean, "shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["metahub"]);
        assert!(cli.config.is_none());
        assert!(cli.port.is_none());
        assert!(!cli.debug_info);
        assert_eq!(cli.shutdown_timeout, 10);
    }

    #[test]
    fn cli_overrides_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"host": "0.0.0.0", "port": 9000}}"#).unwrap();

        let cli = Cli::parse_from([
            "metahub",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "9100",
            "--debug-info",
        ]);
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 9100);
        assert!(settings.routing.include_debug_info);
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "metahub",
            "--config",
            dir.path().join("absent.json").to_str().unwrap(),
        ]);
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.server.port, MetahubSettings::default().server.port);
    }
}
