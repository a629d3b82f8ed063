//! Upstream configuration types
//!
//! This module contains configuration types for upstream groups: their
//! targets, the balancing algorithm and the keepalive connection cache.

use serde::{Deserialize, Serialize};
use validator::Validate;

use tether_common::types::LoadBalancingAlgorithm;

/// Largest weight a single target may carry.
pub const MAX_TARGET_WEIGHT: u32 = 1000;

/// Upstream configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpstreamConfig {
    /// Unique upstream identifier
    pub id: String,

    /// Upstream targets
    #[validate(length(min = 1, message = "At least one target is required"), nested)]
    pub targets: Vec<UpstreamTarget>,

    /// Load balancing algorithm
    #[serde(default)]
    pub load_balancing: LoadBalancingAlgorithm,

    /// Connect timeout for fresh upstream connections
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 1, message = "connect-timeout-ms must be positive"))]
    pub connect_timeout_ms: u64,

    /// Idle connection cache; `None` disables connection reuse
    #[serde(default)]
    #[validate(nested)]
    pub keepalive: Option<KeepaliveConfig>,
}

impl UpstreamConfig {
    /// Create an upstream with default balancing and no keepalive.
    pub fn new(id: impl Into<String>, targets: Vec<UpstreamTarget>) -> Self {
        Self {
            id: id.into(),
            targets,
            load_balancing: LoadBalancingAlgorithm::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            keepalive: None,
        }
    }

    /// Enable the keepalive cache with the given capacity.
    pub fn with_keepalive(mut self, cached: usize) -> Self {
        self.keepalive = Some(KeepaliveConfig { cached });
        self
    }
}

/// Individual upstream target
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpstreamTarget {
    /// Target address (host:port)
    pub address: String,

    /// Weight for weighted load balancing
    #[serde(default = "default_weight")]
    #[validate(range(min = 1, max = 1000, message = "weight must be between 1 and 1000"))]
    pub weight: u32,
}

impl UpstreamTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            weight: default_weight(),
        }
    }
}

/// Keepalive (idle connection cache) settings for one upstream group.
///
/// Example KDL:
/// ```kdl
/// keepalive cached=32
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct KeepaliveConfig {
    /// Maximum number of idle connections retained by the group
    #[serde(default = "default_keepalive_cached")]
    #[validate(range(min = 1, message = "cached must be a positive integer"))]
    pub cached: usize,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            cached: default_keepalive_cached(),
        }
    }
}

pub(crate) fn default_weight() -> u32 {
    1
}

pub(crate) fn default_connect_timeout_ms() -> u64 {
    1000
}

pub(crate) fn default_keepalive_cached() -> usize {
    1
}
