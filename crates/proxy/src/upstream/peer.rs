//! Peer selection contract.
//!
//! A [`PeerStrategy`] turns a request into a live upstream connection and
//! takes it back when the request is done. Balancing algorithms plug in
//! underneath through it, and the keepalive layer wraps it without the
//! proxying pipeline being able to tell the difference.

use async_trait::async_trait;
use tracing::trace;

use tether_common::errors::TetherResult;
use tether_common::ids::ConnectionId;

use super::transport::UpstreamTransport;
use super::RequestContext;

/// Whether a connection is in use by a request or parked in an idle cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Idle,
}

/// How the request that held a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    Success,
    Failed,
}

/// One live connection to one upstream endpoint.
///
/// The transport is owned by exactly one holder at a time: the request that
/// selected it, the idle cache, or nobody once it has been closed.
#[derive(Debug)]
pub struct PeerConnection<T> {
    pub(crate) id: ConnectionId,
    pub(crate) address: String,
    pub(crate) transport: Option<T>,
    pub(crate) state: ConnectionState,
    pub(crate) cached: bool,
}

impl<T> PeerConnection<T> {
    /// A freshly established connection.
    pub fn new(address: impl Into<String>, transport: T) -> Self {
        Self {
            id: ConnectionId::next(),
            address: address.into(),
            transport: Some(transport),
            state: ConnectionState::Active,
            cached: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the upstream target this connection goes to.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True when this connection was handed out from an idle cache rather
    /// than freshly established.
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// True while the transport has not been torn down.
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_mut()
    }

    /// Detach the transport, e.g. when the request tore it down itself.
    pub fn take_transport(&mut self) -> Option<T> {
        self.transport.take()
    }
}

impl<T: UpstreamTransport> PeerConnection<T> {
    /// Close the transport if there still is one.
    pub fn close(mut self) {
        if let Some(transport) = self.transport.take() {
            trace!(connection = %self.id, address = %self.address, "Closing peer connection");
            transport.close();
        }
    }
}

/// Pluggable upstream peer selection.
///
/// Implementations must treat `select` and `release` as independent calls:
/// a layer above may satisfy a `select` without asking the strategy, so
/// selects and releases seen by the strategy do not pair up one to one.
#[async_trait]
pub trait PeerStrategy: Send + Sync + 'static {
    /// Transport the strategy produces
    type Transport: UpstreamTransport;

    /// Per-request state, owned by the strategy
    type State: Send;

    /// Create the per-request state for a new request.
    fn init_peer(&self, request: &RequestContext) -> TetherResult<Self::State>;

    /// Produce a connection for the request.
    async fn select(
        &self,
        state: &mut Self::State,
    ) -> TetherResult<PeerConnection<Self::Transport>>;

    /// Take a connection back once the request is done with it.
    async fn release(
        &self,
        state: &mut Self::State,
        connection: PeerConnection<Self::Transport>,
        outcome: PeerOutcome,
    );
}
