//! Upstream KDL parsing.

use anyhow::Result;
use std::collections::HashMap;
use tracing::trace;

use tether_common::types::LoadBalancingAlgorithm;

use crate::upstreams::*;

use super::helpers::{entry_token, get_first_arg_string, get_first_arg_int, get_property};

/// Parse upstreams configuration block
pub fn parse_upstreams(node: &kdl::KdlNode) -> Result<HashMap<String, UpstreamConfig>> {
    trace!("Parsing upstreams configuration block");
    let mut upstreams = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "upstream" {
                return Err(anyhow::anyhow!(
                    "Unknown node '{}' in upstreams block, expected 'upstream'",
                    child.name().value()
                ));
            }

            let upstream = parse_upstream(child)?;
            if upstreams.contains_key(&upstream.id) {
                return Err(anyhow::anyhow!(
                    "Duplicate upstream '{}'",
                    upstream.id
                ));
            }
            upstreams.insert(upstream.id.clone(), upstream);
        }
    }

    trace!(
        upstream_count = upstreams.len(),
        "Finished parsing upstreams"
    );
    Ok(upstreams)
}

/// Parse a single `upstream "id" { ... }` node
fn parse_upstream(child: &kdl::KdlNode) -> Result<UpstreamConfig> {
    let id = get_first_arg_string(child).ok_or_else(|| {
        anyhow::anyhow!("Upstream requires an ID argument, e.g., upstream \"backend\" {{ ... }}")
    })?;

    trace!(upstream_id = %id, "Parsing upstream");

    let mut targets = Vec::new();
    let mut load_balancing = LoadBalancingAlgorithm::default();
    let mut connect_timeout_ms = default_connect_timeout_ms();
    let mut keepalive = None;

    if let Some(upstream_children) = child.children() {
        for node in upstream_children.nodes() {
            match node.name().value() {
                "target" => {
                    let address = get_first_arg_string(node).ok_or_else(|| {
                        anyhow::anyhow!(
                            "Upstream '{}': target requires an address, e.g., target \"127.0.0.1:8081\"",
                            id
                        )
                    })?;
                    let weight = match get_property(node, "weight") {
                        Some(entry) => parse_weight(entry).ok_or_else(|| {
                            anyhow::anyhow!(
                                "Upstream '{}': invalid parameter \"{}\", weight must be 1..={}",
                                id,
                                entry_token(entry),
                                MAX_TARGET_WEIGHT
                            )
                        })?,
                        None => default_weight(),
                    };

                    trace!(
                        upstream_id = %id,
                        address = %address,
                        weight = weight,
                        "Parsed target"
                    );

                    targets.push(UpstreamTarget { address, weight });
                }
                "load-balancing" => {
                    let name = get_first_arg_string(node).ok_or_else(|| {
                        anyhow::anyhow!("Upstream '{}': load-balancing requires a value", id)
                    })?;
                    load_balancing = name
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!("Upstream '{}': {}", id, e))?;
                }
                "keepalive" => {
                    if keepalive.is_some() {
                        return Err(anyhow::anyhow!(
                            "Upstream '{}': \"keepalive\" directive is duplicate",
                            id
                        ));
                    }
                    keepalive = Some(parse_keepalive(node)?);
                }
                "connect-timeout-ms" => {
                    connect_timeout_ms = match get_first_arg_int(node) {
                        Some(v) if v > 0 => v as u64,
                        _ => {
                            return Err(anyhow::anyhow!(
                                "Upstream '{}': connect-timeout-ms requires a positive integer",
                                id
                            ))
                        }
                    };
                }
                other => {
                    return Err(anyhow::anyhow!(
                        "Upstream '{}': unknown directive '{}'",
                        id,
                        other
                    ));
                }
            }
        }
    }

    if targets.is_empty() {
        return Err(anyhow::anyhow!(
            "Upstream '{}' requires at least one target, e.g., target \"127.0.0.1:8081\"",
            id
        ));
    }

    trace!(
        upstream_id = %id,
        target_count = targets.len(),
        load_balancing = %load_balancing,
        keepalive = ?keepalive,
        "Parsed upstream"
    );

    Ok(UpstreamConfig {
        id,
        targets,
        load_balancing,
        connect_timeout_ms,
        keepalive,
    })
}

/// Parse the keepalive directive
///
/// The only recognized option is `cached=N`. It is accepted as a KDL property
/// (`keepalive cached=16`) or as a single string argument
/// (`keepalive "cached=16"`). Omitting it keeps the default of one cached
/// connection. Anything else is rejected with the offending token.
fn parse_keepalive(node: &kdl::KdlNode) -> Result<KeepaliveConfig> {
    let mut config = KeepaliveConfig::default();

    for entry in node.entries() {
        let token = entry_token(entry);

        let value = match entry.name().map(|n| n.value()) {
            Some("cached") => entry
                .value()
                .as_integer()
                .map(|n| n.to_string())
                .or_else(|| entry.value().as_string().map(|s| s.to_string())),
            Some(_) => None,
            None => entry
                .value()
                .as_string()
                .and_then(|s| s.strip_prefix("cached="))
                .map(|s| s.to_string()),
        };

        let cached = value
            .as_deref()
            .and_then(parse_positive)
            .ok_or_else(|| anyhow::anyhow!("invalid parameter \"{}\"", token))?;

        config.cached = cached;
    }

    if node.children().is_some() {
        return Err(anyhow::anyhow!(
            "\"keepalive\" directive does not take a block"
        ));
    }

    Ok(config)
}

fn parse_weight(entry: &kdl::KdlEntry) -> Option<u32> {
    let weight = u32::try_from(entry.value().as_integer()?).ok()?;
    (1..=MAX_TARGET_WEIGHT).contains(&weight).then_some(weight)
}

fn parse_positive(s: &str) -> Option<usize> {
    match s.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => None,
    }
}
