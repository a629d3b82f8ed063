//! Logging setup for Tether
//!
//! Structured logging goes through `tracing`; this module only installs the
//! subscriber.

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Format named by `TETHER_LOG_FORMAT`. Unset or unknown means JSON.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value {
            Some("pretty") => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Initialize the tracing/logging subsystem
///
/// `TETHER_LOG_FORMAT` selects `json` (default) or `pretty`. The level comes
/// from `RUST_LOG`, falling back to `default_level`.
pub fn init_tracing(default_level: &str) -> Result<()> {
    let setting = std::env::var("TETHER_LOG_FORMAT").ok();
    let format = LogFormat::from_setting(setting.as_deref());

    // Use JSON format for structured logging in production
    let json_layer = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    // Pretty format for development
    let pretty_layer = (format == LogFormat::Pretty)
        .then(|| fmt::layer().pretty().with_target(true).with_thread_ids(true));

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()?;

    if let Some(value) = setting.as_deref() {
        if value != "json" && value != "pretty" {
            warn!(value = %value, "Unknown TETHER_LOG_FORMAT, using json");
        }
    }
    info!(format = ?format, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_selection() {
        assert_eq!(LogFormat::from_setting(None), LogFormat::Json);
        assert_eq!(LogFormat::from_setting(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::from_setting(Some("pretty")), LogFormat::Pretty);
    }

    #[test]
    fn test_unknown_log_format_still_logs() {
        assert_eq!(LogFormat::from_setting(Some("compact")), LogFormat::Json);
        assert_eq!(LogFormat::from_setting(Some("")), LogFormat::Json);
    }
}
