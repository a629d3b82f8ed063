//! KDL configuration parsing.
//!
//! This module contains the functions for parsing KDL configuration files
//! into Tether configuration structures. It is organized into submodules:
//!
//! - `helpers`: Common parsing utility functions
//! - `upstreams`: Upstream group, target and keepalive parsing

mod helpers;
mod upstreams;

pub use helpers::offset_to_line_col;
pub use upstreams::parse_upstreams;

use anyhow::Result;
use std::collections::HashMap;

use crate::Config;

/// Convert a parsed KDL document to Config
pub fn parse_kdl_document(doc: kdl::KdlDocument) -> Result<Config> {
    let mut upstreams = HashMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "upstreams" => {
                for (id, upstream) in parse_upstreams(node)? {
                    if upstreams.insert(id.clone(), upstream).is_some() {
                        return Err(anyhow::anyhow!("Duplicate upstream '{}'", id));
                    }
                }
            }
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown top-level configuration block: '{}'\n\
                     Valid blocks are: upstreams",
                    other
                ));
            }
        }
    }

    Ok(Config { upstreams })
}
