//! Logging initialization and heartbeat telemetry
//!
//! Provides:
//! - JSON structured logging through `tracing-subscriber`
//! - The [`Telemetry`] collaborator the webhook, watch loop, certificate
//!   manager and cleanup job report counters and notable errors to

mod heartbeat;

pub use heartbeat::{
    HeartbeatLog, HeartbeatMetric, HeartbeatSnapshot, HeartbeatTelemetry, Telemetry,
};

#[cfg(test)]
pub use heartbeat::MockTelemetry;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,
    /// Include span context in every log line
    pub with_spans: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: "info,appmon=debug,kube=info,tower=warn,hyper=warn".to_string(),
            with_spans: true,
        }
    }
}

/// Install the global JSON log subscriber
///
/// `RUST_LOG` overrides [`TelemetryConfig::default_filter`]. Fails if a
/// global subscriber is already installed.
pub fn init_tracing(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(config.with_spans)
        .with_span_list(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })
}
