//! Upstream group management for Tether
//!
//! This module ties together target selection, connection establishment and
//! keepalive connection reuse for one configured upstream group.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use tether_common::errors::TetherResult;
use tether_common::ids::UpstreamId;
use tether_config::{Config, UpstreamConfig};

pub mod balancer;
pub mod connector;
pub mod keepalive;
pub mod peer;
pub mod transport;

pub use balancer::{
    create_load_balancer, LoadBalancer, RequestContext, SelectionLease, TargetSelection,
};
pub use connector::{BalancedConnector, ConnectorState};
pub use keepalive::{
    init_for_group, Admission, KeepalivePeer, KeepalivePeerState, KeepalivePool, PoolStats,
    RejectReason, UpstreamPeer, UpstreamPeerState,
};
pub use peer::{ConnectionState, PeerConnection, PeerOutcome, PeerStrategy};
pub use transport::{IdleEvent, TcpConnection, UpstreamTransport};

/// Per-request state of an [`UpstreamGroup`].
pub type GroupState = UpstreamPeerState<BalancedConnector>;

/// One configured upstream group, ready to serve requests.
pub struct UpstreamGroup {
    id: UpstreamId,
    balancer: Arc<dyn LoadBalancer>,
    peer: UpstreamPeer<BalancedConnector>,
}

impl UpstreamGroup {
    /// Build the group's balancer, connector and optional keepalive cache.
    pub fn from_config(config: &UpstreamConfig) -> TetherResult<Self> {
        let id = UpstreamId::new(&config.id);
        let balancer = create_load_balancer(config.load_balancing, &config.targets)?;

        let peer = init_for_group(config, |config| {
            Ok(BalancedConnector::new(
                UpstreamId::new(&config.id),
                Arc::clone(&balancer),
                Duration::from_millis(config.connect_timeout_ms),
            ))
        })?;

        debug!(
            upstream = %id,
            targets = config.targets.len(),
            algorithm = %config.load_balancing,
            keepalive = ?config.keepalive,
            "Upstream group initialized"
        );

        Ok(Self { id, balancer, peer })
    }

    pub fn id(&self) -> &UpstreamId {
        &self.id
    }

    /// Start a request against this group.
    pub fn init_peer(&self, request: &RequestContext) -> TetherResult<GroupState> {
        self.peer.init_peer(request)
    }

    /// Get a connection for the request, reusing an idle one when possible.
    pub async fn select(&self, state: &mut GroupState) -> TetherResult<PeerConnection<TcpConnection>> {
        self.peer.select(state).await
    }

    /// Hand the connection back once the request is done.
    pub async fn release(
        &self,
        state: &mut GroupState,
        connection: PeerConnection<TcpConnection>,
        outcome: PeerOutcome,
    ) {
        self.peer.release(state, connection, outcome).await
    }

    /// Keepalive counters, when the group caches connections.
    pub fn keepalive_stats(&self) -> Option<PoolStats> {
        self.peer.keepalive_pool().map(KeepalivePool::stats)
    }

    pub async fn healthy_targets(&self) -> Vec<String> {
        self.balancer.healthy_targets().await
    }

    /// Close all idle connections. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        let closed = self
            .peer
            .keepalive_pool()
            .map(KeepalivePool::drain)
            .unwrap_or(0);
        info!(upstream = %self.id, closed_idle = closed, "Upstream group shut down");
        closed
    }
}

/// Build every group in the configuration, in id order.
pub fn build_groups(config: &Config) -> TetherResult<Vec<UpstreamGroup>> {
    config
        .upstream_ids()
        .into_iter()
        .filter_map(|id| config.upstreams.get(id))
        .map(UpstreamGroup::from_config)
        .collect()
}
