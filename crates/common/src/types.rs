//! Common type definitions for Tether

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Load balancing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    IpHash,
    Weighted,
}

impl FromStr for LoadBalancingAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least_connections" | "leastconnections" => Ok(Self::LeastConnections),
            "ip_hash" | "iphash" => Ok(Self::IpHash),
            "weighted" => Ok(Self::Weighted),
            other => Err(format!(
                "unknown load balancing algorithm '{}', expected one of: \
                 round_robin, least_connections, ip_hash, weighted",
                other
            )),
        }
    }
}

impl fmt::Display for LoadBalancingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round_robin"),
            Self::LeastConnections => write!(f, "least_connections"),
            Self::IpHash => write!(f, "ip_hash"),
            Self::Weighted => write!(f, "weighted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_algorithm() {
        assert_eq!(
            "least_connections".parse::<LoadBalancingAlgorithm>(),
            Ok(LoadBalancingAlgorithm::LeastConnections)
        );
        assert_eq!(
            "RoundRobin".parse::<LoadBalancingAlgorithm>(),
            Ok(LoadBalancingAlgorithm::RoundRobin)
        );
        assert!("maglev".parse::<LoadBalancingAlgorithm>().is_err());
    }

    #[test]
    fn test_default_is_round_robin() {
        assert_eq!(
            LoadBalancingAlgorithm::default(),
            LoadBalancingAlgorithm::RoundRobin
        );
        assert_eq!(LoadBalancingAlgorithm::IpHash.to_string(), "ip_hash");
    }
}
