//! Bus configuration loaded from environment variables.

use std::time::Duration;

use common::Endpoint;

use crate::facade::Endpoints;

/// Bus configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `BUS_ENDPOINT`: local endpoint (default: `"memory://local"`)
/// - `BUS_ERROR_ENDPOINT`: error endpoint (default: `"memory://error"`)
/// - `BUS_LOG_ENDPOINT`: optional audit endpoint
/// - `BUS_WORKERS`: dispatch worker count (default: `4`)
/// - `BUS_TIMEOUT_POLL_MS`: timeout poller interval (default: `1000`)
/// - `BUS_MAX_RETRIES`: delivery attempts before forwarding to the error endpoint (default: `5`)
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub endpoint: Endpoint,
    pub error_endpoint: Endpoint,
    pub log_endpoint: Option<Endpoint>,
    pub workers: usize,
    pub timeout_poll_interval: Duration,
    pub max_retries: u32,
}

impl BusConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: std::env::var("BUS_ENDPOINT")
                .map(Endpoint::from)
                .unwrap_or(defaults.endpoint),
            error_endpoint: std::env::var("BUS_ERROR_ENDPOINT")
                .map(Endpoint::from)
                .unwrap_or(defaults.error_endpoint),
            log_endpoint: std::env::var("BUS_LOG_ENDPOINT")
                .ok()
                .filter(|address| !address.is_empty())
                .map(Endpoint::from),
            workers: std::env::var("BUS_WORKERS")
                .ok()
                .and_then(|w| w.parse().ok())
                .filter(|w| *w > 0)
                .unwrap_or(defaults.workers),
            timeout_poll_interval: std::env::var("BUS_TIMEOUT_POLL_MS")
                .ok()
                .and_then(|ms| ms.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout_poll_interval),
            max_retries: std::env::var("BUS_MAX_RETRIES")
                .ok()
                .and_then(|r| r.parse().ok())
                .unwrap_or(defaults.max_retries),
        }
    }

    /// Returns the configured endpoints.
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            local: self.endpoint.clone(),
            error: self.error_endpoint.clone(),
            log: self.log_endpoint.clone(),
        }
    }

    /// Uses `endpoint` as the local endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<Endpoint>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new("memory://local"),
            error_endpoint: Endpoint::new("memory://error"),
            log_endpoint: None,
            workers: 4,
            timeout_poll_interval: Duration::from_millis(1000),
            max_retries: 5,
        }
    }
}
