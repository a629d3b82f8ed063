//! Configuration module for Tether
//!
//! This module provides configuration parsing and validation for upstream
//! groups and their keepalive connection caches.
//!
//! # Module Organization
//!
//! - [`upstreams`]: Upstream group configuration
//! - `kdl`: KDL format parsing
//!
//! Configuration errors are fatal: a document either loads completely or not
//! at all.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};
use validator::Validate;

mod kdl;
pub mod upstreams;

pub use upstreams::{KeepaliveConfig, UpstreamConfig, UpstreamTarget};

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upstream groups keyed by id
    #[serde(default)]
    pub upstreams: HashMap<String, UpstreamConfig>,
}

impl Config {
    /// Load configuration from a file, choosing the format by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("kdl");

        debug!(path = %path.display(), format = extension, "Loading configuration");

        let config = match extension {
            "kdl" => Self::from_kdl(&content),
            "json" => Self::from_json(&content),
            _ => Err(anyhow::anyhow!("Unsupported config format: {}", extension)),
        }
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        info!(
            path = %path.display(),
            upstreams = config.upstreams.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse configuration from KDL format
    pub fn from_kdl(content: &str) -> Result<Self> {
        let doc: ::kdl::KdlDocument = content
            .parse()
            .map_err(|e: ::kdl::KdlError| anyhow::anyhow!("{}", render_kdl_error(content, &e)))?;

        let config = kdl::parse_kdl_document(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from JSON format
    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: Config =
            serde_json::from_str(content).context("Failed to parse JSON configuration")?;

        // Map keys are authoritative for ids in the JSON form
        for (id, upstream) in config.upstreams.iter_mut() {
            upstream.id = id.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every upstream group.
    pub fn validate(&self) -> Result<()> {
        for (id, upstream) in &self.upstreams {
            upstream
                .validate()
                .with_context(|| format!("Upstream '{}' failed validation", id))?;
        }
        Ok(())
    }

    /// Upstream ids in a stable order.
    pub fn upstream_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.upstreams.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Render a KDL syntax error with line/column context.
fn render_kdl_error(content: &str, e: &::kdl::KdlError) -> String {
    use miette::Diagnostic;

    let mut error_msg = String::from("KDL configuration parse error:\n\n");
    let mut found_details = false;

    if let Some(related) = e.related() {
        for diagnostic in related {
            error_msg.push_str(&format!("  {}\n", diagnostic));
            found_details = true;

            if let Some(labels) = diagnostic.labels() {
                for label in labels {
                    let (line, col) = kdl::offset_to_line_col(content, label.offset());
                    error_msg.push_str(&format!("\n  --> at line {}, column {}\n", line, col));

                    if let Some(line_content) = content.lines().nth(line.saturating_sub(1)) {
                        error_msg.push_str(&format!("{:>4} | {}\n", line, line_content));
                        error_msg.push_str(&format!(
                            "     | {}^\n",
                            " ".repeat(col.saturating_sub(1))
                        ));
                    }
                }
            }

            if let Some(help) = diagnostic.help() {
                error_msg.push_str(&format!("\n  Help: {}\n", help));
            }
        }
    }

    if !found_details {
        error_msg.push_str(&format!("  {}\n", e));
    }

    error_msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
upstreams {
    upstream "api" {
        target "127.0.0.1:9001"
        target "127.0.0.1:9002" weight=2
        load-balancing "weighted"
        keepalive cached=4
    }
    upstream "static" {
        target "127.0.0.1:9100"
    }
}
"#;

    #[test]
    fn test_from_kdl() {
        let config = Config::from_kdl(SAMPLE).unwrap();
        assert_eq!(config.upstream_ids(), vec!["api", "static"]);
        assert_eq!(
            config.upstreams["api"].keepalive,
            Some(KeepaliveConfig { cached: 4 })
        );
        assert!(config.upstreams["static"].keepalive.is_none());
    }

    #[test]
    fn test_unknown_top_level_block() {
        let err = Config::from_kdl("listeners {\n}\n").unwrap_err();
        assert!(err.to_string().contains("Unknown top-level configuration block"));
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let err = Config::from_kdl("upstreams {\n    upstream \"api\" {\n").unwrap_err();
        assert!(err.to_string().contains("KDL configuration parse error"));
    }

    #[test]
    fn test_from_file_kdl() {
        let mut file = tempfile::Builder::new().suffix(".kdl").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.upstreams.len(), 2);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(
            br#"{"upstreams": {"api": {"id": "", "targets": [{"address": "127.0.0.1:9001"}], "keepalive": {"cached": 3}}}}"#,
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        let api = &config.upstreams["api"];
        assert_eq!(api.id, "api");
        assert_eq!(api.keepalive, Some(KeepaliveConfig { cached: 3 }));
    }

    #[test]
    fn test_json_zero_capacity_rejected() {
        let err = Config::from_json(
            r#"{"upstreams": {"api": {"id": "api", "targets": [{"address": "127.0.0.1:9001"}], "keepalive": {"cached": 0}}}}"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("api"));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/tether.kdl").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
