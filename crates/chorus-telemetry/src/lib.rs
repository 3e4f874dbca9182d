//! # chorus-telemetry
//!
//! One-call setup of the global `tracing` subscriber.

#![deny(unsafe_code)]

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Emit JSON lines instead of the compact human format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build the `EnvFilter` directive string for this config.
    pub fn filter_directives(&self) -> String {
        self.log_level.to_string().to_lowercase()
    }
}

/// Parse a level name (`"debug"`, `"WARN"`, ...), falling back to `INFO`.
pub fn parse_level(name: &str) -> Level {
    name.parse().unwrap_or(Level::INFO)
}

/// Initialize the global subscriber. Call once at startup; later calls are no-ops.
pub fn init_telemetry(config: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_info() {
        let cfg = TelemetryConfig::default();
        assert_eq!(cfg.filter_directives(), "info");
    }

    #[test]
    fn configured_level_becomes_filter() {
        let cfg = TelemetryConfig {
            log_level: Level::WARN,
            json: false,
        };
        assert_eq!(cfg.filter_directives(), "warn");
    }

    #[test]
    fn parse_level_accepts_any_case() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_telemetry(&TelemetryConfig::default());
        init_telemetry(&TelemetryConfig {
            json: true,
            ..TelemetryConfig::default()
        });
    }
}
