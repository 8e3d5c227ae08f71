//! Host configuration loaded from environment variables.

use bus::BusConfig;

/// Host configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `METRICS_HOST`: Prometheus listener address (default: `"0.0.0.0"`)
/// - `METRICS_PORT`: Prometheus listener port (default: `9000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
///
/// plus everything [`BusConfig::from_env`] reads.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus: BusConfig,
    pub metrics_host: String,
    pub metrics_port: u16,
    pub log_level: String,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bus: BusConfig::from_env(),
            metrics_host: std::env::var("METRICS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            metrics_port: std::env::var("METRICS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(9000),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }

    /// Returns the `"host:port"` metrics listener address.
    pub fn metrics_addr(&self) -> String {
        format!("{}:{}", self.metrics_host, self.metrics_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            metrics_host: "0.0.0.0".to_string(),
            metrics_port: 9000,
            log_level: "info".to_string(),
        }
    }
}
