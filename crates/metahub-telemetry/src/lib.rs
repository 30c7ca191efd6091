//! Logging and metrics for the hub.
//!
//! [`init_telemetry`] installs the global `tracing` subscriber once at startup;
//! [`MetricsRecorder`] is a plain value the server owns and shares by `Arc`.

#![deny(unsafe_code)]

mod metrics;

pub use metrics::{HistogramSummary, MetricsRecorder, MetricsReport, Sample};

use std::collections::BTreeMap;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level '{level}' for '{target}'")]
    InvalidLevel { target: String, level: String },
    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. `RUST_LOG` wins when set.
    pub log_level: Level,
    /// Per-target overrides (e.g. `metahub_server::router` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from string levels as they appear in settings files.
    pub fn from_levels(
        level: &str,
        module_levels: &BTreeMap<String, String>,
        json: bool,
    ) -> Result<Self, TelemetryError> {
        let parse = |target: &str, raw: &str| {
            Level::from_str(raw).map_err(|_| TelemetryError::InvalidLevel {
                target: target.to_string(),
                level: raw.to_string(),
            })
        };
        let log_level = parse("default", level)?;
        let module_levels = module_levels
            .iter()
            .map(|(target, raw)| Ok((target.clone(), parse(target, raw)?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;
        Ok(Self {
            log_level,
            module_levels,
            json,
        })
    }

    /// `EnvFilter` directive string, e.g. `info,metahub_server::router=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()?;
    Ok(())
}
