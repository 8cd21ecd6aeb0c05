// Logging setup for the orchestrator
//
// Stdout carries job results, so every log line goes to stderr.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter when neither RUST_LOG nor LOG_LEVEL is set
const DEFAULT_FILTER: &str = "awap=info";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "awap_pool=debug")
    pub log_filter: Option<String>,
    /// Whether to include module targets in log lines
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "awap-orchestrator".to_string(),
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "awap-orchestrator")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("SERVICE_NAME").unwrap_or(defaults.service_name),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            with_target: defaults.with_target,
        }
    }

    /// Filter directive that will be used
    ///
    /// A bare level such as `debug` from LOG_LEVEL applies to the awap crates
    /// only, so dependency noise stays out of the way.
    pub fn filter_directive(&self) -> String {
        match self.log_filter.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_FILTER.to_string(),
            Some(level) if is_bare_level(level) => {
                format!("awap_pool={level},awap_jail={level},awap_orchestrator={level}")
            }
            Some(filter) => filter.to_string(),
        }
    }
}

fn is_bare_level(filter: &str) -> bool {
    matches!(
        filter.to_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error" | "off"
    )
}

/// Install the global subscriber writing to stderr
pub fn init_telemetry(config: &TelemetryConfig) {
    let filter = EnvFilter::try_new(config.filter_directive())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.with_target)
        .with_filter(filter);

    tracing_subscriber::registry().with(console_layer).init();

    tracing::debug!(service = %config.service_name, "Telemetry initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "awap-orchestrator");
        assert_eq!(config.filter_directive(), DEFAULT_FILTER);
    }

    #[test]
    fn test_bare_level_is_scoped_to_awap_crates() {
        let config = TelemetryConfig {
            log_filter: Some("DEBUG".into()),
            ..Default::default()
        };
        let directive = config.filter_directive();
        assert!(directive.contains("awap_pool=DEBUG"));
        assert!(directive.contains("awap_orchestrator=DEBUG"));
    }

    #[test]
    fn test_full_filter_passes_through() {
        let config = TelemetryConfig {
            log_filter: Some("awap_pool=trace,tokio=warn".into()),
            ..Default::default()
        };
        assert_eq!(config.filter_directive(), "awap_pool=trace,tokio=warn");
    }
}
