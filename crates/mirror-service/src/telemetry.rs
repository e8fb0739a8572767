//! Logging initialisation
//!
//! Configures structured logging for processes embedding the mirroring
//! pipeline. Initialisation is idempotent: a second call leaves the first
//! subscriber in place.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log level
    pub log_level: String,

    /// Whether to use JSON formatting
    pub json_format: bool,

    /// Whether to include thread IDs
    pub include_thread_ids: bool,

    /// Whether to include target module
    pub include_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_format: false,
            include_thread_ids: false,
            include_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create a new telemetry config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Enable JSON formatting
    pub fn with_json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }

    /// Configure thread ID inclusion
    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.include_thread_ids = enabled;
        self
    }

    /// Configure target module inclusion
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.include_target = enabled;
        self
    }
}

/// Initialize logging with default configuration
pub fn init() -> bool {
    init_with_config(TelemetryConfig::default())
}

/// Initialize logging with custom configuration
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false`
/// when a global subscriber was already installed.
///
/// # Example
///
/// ```rust,no_run
/// use mirror_service::telemetry::{init_with_config, TelemetryConfig};
///
/// let config = TelemetryConfig::new()
///     .with_log_level("debug")
///     .with_json_format(true);
///
/// init_with_config(config);
/// ```
pub fn init_with_config(config: TelemetryConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = if config.json_format {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_timer(fmt::time::SystemTime)
                    .with_target(config.include_target)
                    .with_thread_ids(config.include_thread_ids),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_timer(fmt::time::SystemTime)
                    .with_target(config.include_target)
                    .with_thread_ids(config.include_thread_ids),
            )
            .try_init()
    };

    result.is_ok()
}

/// Initialize logging from environment variables
///
/// This reads configuration from:
/// - `RUST_LOG` - Log level filter
/// - `LOG_FORMAT` - "json" for JSON formatting, anything else for pretty
/// - `LOG_THREAD_IDS` - "true" or "false"
/// - `LOG_TARGET` - "true" or "false"
pub fn init_from_env() -> bool {
    init_with_config(config_from_env())
}

fn config_from_env() -> TelemetryConfig {
    let flag = |name: &str, default: bool| {
        std::env::var(name)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    };

    TelemetryConfig {
        log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        json_format: std::env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false),
        include_thread_ids: flag("LOG_THREAD_IDS", false),
        include_target: flag("LOG_TARGET", true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_builder() {
        let config = TelemetryConfig::new()
            .with_log_level("debug")
            .with_json_format(true)
            .with_thread_ids(true);

        assert_eq!(config.log_level, "debug");
        assert!(config.json_format);
        assert!(config.include_thread_ids);
        assert!(config.include_target);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_with_config(TelemetryConfig::new().with_log_level("warn"));
        assert!(!init_with_config(TelemetryConfig::new()));
    }
}
