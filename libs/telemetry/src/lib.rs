//! Logging and metric helpers shared by relay crates.
//!
//! Logs go through `tracing` with a JSON or text formatter picked from `LOG_FORMAT`.
//! Metrics go through the `metrics` facade and are dropped until a recorder is
//! installed.

mod config;
mod recorders;
mod tracing_init;

pub use config::TelemetryConfig;
pub use recorders::{record_counter, record_gauge, relay_span};
pub use tracing_init::init_telemetry;

/// Installs telemetry for `service_name` from the process environment.
pub fn install(service_name: &str, version: &str) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::from_env(service_name, version))
}
