//! Tether Proxy Library
//!
//! Upstream selection with keepalive connection reuse.
//!
//! Each configured upstream group picks targets with a load balancer and opens
//! fresh TCP connections through a [`BalancedConnector`]. Groups with a
//! `keepalive` setting put a bounded idle connection cache in front of it, so
//! connections released by one request are handed to the next one instead of
//! being closed.
//!
//! # Example
//!
//! ```ignore
//! use tether_proxy::upstream::{PeerOutcome, RequestContext, UpstreamGroup};
//!
//! let group = UpstreamGroup::from_config(&upstream_config)?;
//! let mut state = group.init_peer(&RequestContext::new("GET", "/"))?;
//! let connection = group.select(&mut state).await?;
//! // ... proxy the request ...
//! group.release(&mut state, connection, PeerOutcome::Success).await;
//! ```

pub mod upstream;

pub use upstream::{
    BalancedConnector, KeepalivePeer, KeepalivePool, PeerConnection, PeerOutcome, PeerStrategy,
    PoolStats, UpstreamGroup,
};
