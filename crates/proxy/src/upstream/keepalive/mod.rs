//! Keepalive connection reuse for upstream groups.
//!
//! [`KeepalivePeer`] wraps any [`PeerStrategy`] and puts an idle connection
//! cache in front of it:
//!
//! - `select` hands out the most recently cached connection when there is
//!   one and only asks the wrapped strategy on a miss.
//! - `release` offers successful connections to the cache and only passes
//!   the ones the cache turns away down to the wrapped strategy.
//!
//! Every cached connection carries an idle watcher that evicts and closes it
//! as soon as the peer closes it or sends anything.

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use tether_common::errors::{TetherError, TetherResult};
use tether_common::ids::UpstreamId;
use tether_config::UpstreamConfig;

use super::balancer::RequestContext;
use super::peer::{PeerConnection, PeerOutcome, PeerStrategy};

mod cache;
mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Admission, KeepalivePool, PoolStats, RejectReason};

/// A peer strategy with an idle connection cache in front of it.
pub struct KeepalivePeer<S: PeerStrategy> {
    strategy: S,
    pool: KeepalivePool<S::Transport>,
}

impl<S: PeerStrategy> KeepalivePeer<S> {
    /// Wrap `strategy` with a cache of at most `cached` idle connections.
    pub fn new(upstream: UpstreamId, cached: usize, strategy: S) -> TetherResult<Self> {
        let pool = KeepalivePool::new(upstream, cached)?;
        Ok(Self { strategy, pool })
    }

    pub fn pool(&self) -> &KeepalivePool<S::Transport> {
        &self.pool
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }
}

/// Per-request state of a [`KeepalivePeer`].
pub struct KeepalivePeerState<S: PeerStrategy> {
    pool: KeepalivePool<S::Transport>,
    delegate: S::State,
}

impl<S: PeerStrategy> KeepalivePeerState<S> {
    /// The wrapped strategy's own per-request state.
    pub fn delegate(&self) -> &S::State {
        &self.delegate
    }
}

#[async_trait]
impl<S: PeerStrategy> PeerStrategy for KeepalivePeer<S> {
    type Transport = S::Transport;
    type State = KeepalivePeerState<S>;

    fn init_peer(&self, request: &RequestContext) -> TetherResult<Self::State> {
        let delegate = self.strategy.init_peer(request)?;
        Ok(KeepalivePeerState {
            pool: self.pool.clone(),
            delegate,
        })
    }

    async fn select(
        &self,
        state: &mut Self::State,
    ) -> TetherResult<PeerConnection<Self::Transport>> {
        if let Some(connection) = state.pool.try_take() {
            debug!(
                upstream = %state.pool.upstream(),
                connection = %connection.id(),
                target = %connection.address(),
                "Selected cached upstream connection"
            );
            return Ok(connection);
        }

        trace!(upstream = %state.pool.upstream(), "Keepalive miss, delegating select");
        self.strategy.select(&mut state.delegate).await
    }

    async fn release(
        &self,
        state: &mut Self::State,
        connection: PeerConnection<Self::Transport>,
        outcome: PeerOutcome,
    ) {
        if outcome == PeerOutcome::Failed || !connection.has_transport() {
            self.strategy
                .release(&mut state.delegate, connection, outcome)
                .await;
            return;
        }

        match state.pool.offer(connection, false) {
            Admission::Accepted => {}
            Admission::Rejected { connection, reason } => {
                trace!(
                    upstream = %state.pool.upstream(),
                    connection = %connection.id(),
                    reason = ?reason,
                    "Keepalive cache declined connection, delegating release"
                );
                self.strategy
                    .release(&mut state.delegate, connection, outcome)
                    .await;
            }
        }
    }
}

/// Peer strategy of an upstream group, with or without keepalive.
pub enum UpstreamPeer<S: PeerStrategy> {
    Direct(S),
    Keepalive(KeepalivePeer<S>),
}

impl<S: PeerStrategy> UpstreamPeer<S> {
    /// The idle connection cache, when keepalive is enabled.
    pub fn keepalive_pool(&self) -> Option<&KeepalivePool<S::Transport>> {
        match self {
            UpstreamPeer::Direct(_) => None,
            UpstreamPeer::Keepalive(peer) => Some(peer.pool()),
        }
    }

    /// The underlying balancing strategy.
    pub fn strategy(&self) -> &S {
        match self {
            UpstreamPeer::Direct(strategy) => strategy,
            UpstreamPeer::Keepalive(peer) => peer.strategy(),
        }
    }
}

/// Per-request state of an [`UpstreamPeer`].
pub enum UpstreamPeerState<S: PeerStrategy> {
    Direct(S::State),
    Keepalive(KeepalivePeerState<S>),
}

#[async_trait]
impl<S: PeerStrategy> PeerStrategy for UpstreamPeer<S> {
    type Transport = S::Transport;
    type State = UpstreamPeerState<S>;

    fn init_peer(&self, request: &RequestContext) -> TetherResult<Self::State> {
        Ok(match self {
            UpstreamPeer::Direct(strategy) => UpstreamPeerState::Direct(strategy.init_peer(request)?),
            UpstreamPeer::Keepalive(peer) => UpstreamPeerState::Keepalive(peer.init_peer(request)?),
        })
    }

    async fn select(
        &self,
        state: &mut Self::State,
    ) -> TetherResult<PeerConnection<Self::Transport>> {
        match (self, state) {
            (UpstreamPeer::Direct(strategy), UpstreamPeerState::Direct(state)) => {
                strategy.select(state).await
            }
            (UpstreamPeer::Keepalive(peer), UpstreamPeerState::Keepalive(state)) => {
                peer.select(state).await
            }
            _ => {
                warn!("Peer state was created by a different upstream peer");
                Err(TetherError::config(
                    "peer state does not match the upstream's keepalive setting",
                ))
            }
        }
    }

    async fn release(
        &self,
        state: &mut Self::State,
        connection: PeerConnection<Self::Transport>,
        outcome: PeerOutcome,
    ) {
        match (self, state) {
            (UpstreamPeer::Direct(strategy), UpstreamPeerState::Direct(state)) => {
                strategy.release(state, connection, outcome).await
            }
            (UpstreamPeer::Keepalive(peer), UpstreamPeerState::Keepalive(state)) => {
                peer.release(state, connection, outcome).await
            }
            _ => {
                warn!(
                    connection = %connection.id(),
                    "Peer state was created by a different upstream peer, closing connection"
                );
                connection.close();
            }
        }
    }
}

/// Initialize the peer strategy for an upstream group.
///
/// `init` builds the group's balancing strategy and runs exactly once. The
/// keepalive layer is added on top only after it succeeded, and only when the
/// group has a `keepalive` setting.
pub fn init_for_group<S, F>(config: &UpstreamConfig, init: F) -> TetherResult<UpstreamPeer<S>>
where
    S: PeerStrategy,
    F: FnOnce(&UpstreamConfig) -> TetherResult<S>,
{
    let strategy = init(config)?;

    let Some(keepalive) = config.keepalive else {
        return Ok(UpstreamPeer::Direct(strategy));
    };

    let peer = KeepalivePeer::new(UpstreamId::new(&config.id), keepalive.cached, strategy)?;
    info!(
        upstream = %config.id,
        cached = keepalive.cached,
        "Keepalive connection cache enabled"
    );
    Ok(UpstreamPeer::Keepalive(peer))
}
