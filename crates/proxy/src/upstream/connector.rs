//! Fresh connection establishment behind a load balancer.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use tether_common::errors::TetherResult;
use tether_common::ids::UpstreamId;

use super::balancer::{LoadBalancer, RequestContext, SelectionLease, TargetSelection};
use super::peer::{PeerConnection, PeerOutcome, PeerStrategy};
use super::transport::TcpConnection;

/// Per-request state of a [`BalancedConnector`].
#[derive(Debug, Default)]
pub struct ConnectorState {
    context: Option<RequestContext>,
    selection: Option<TargetSelection>,
}

impl ConnectorState {
    /// Target picked by the last select, if any.
    pub fn selection(&self) -> Option<&TargetSelection> {
        self.selection.as_ref()
    }
}

/// Picks a target with the group's balancer and opens a new TCP connection.
///
/// This is the strategy that runs when no idle connection can be reused.
pub struct BalancedConnector {
    upstream: UpstreamId,
    balancer: Arc<dyn LoadBalancer>,
    connect_timeout: Duration,
}

impl BalancedConnector {
    pub fn new(
        upstream: UpstreamId,
        balancer: Arc<dyn LoadBalancer>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            upstream,
            balancer,
            connect_timeout,
        }
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }
}

#[async_trait]
impl PeerStrategy for BalancedConnector {
    type Transport = TcpConnection;
    type State = ConnectorState;

    fn init_peer(&self, request: &RequestContext) -> TetherResult<ConnectorState> {
        Ok(ConnectorState {
            context: Some(request.clone()),
            selection: None,
        })
    }

    async fn select(&self, state: &mut ConnectorState) -> TetherResult<PeerConnection<TcpConnection>> {
        let selection = self.balancer.select(state.context.as_ref()).await?;

        match TcpConnection::connect(&selection.address, self.connect_timeout).await {
            Ok(transport) => {
                // The balancer slot stays taken until the socket is closed,
                // wherever that happens
                let lease = SelectionLease::new(self.balancer.clone(), selection.clone());
                let connection =
                    PeerConnection::new(selection.address.clone(), transport.with_lease(lease));
                debug!(
                    upstream = %self.upstream,
                    target = %selection.address,
                    connection = %connection.id(),
                    "Opened fresh upstream connection"
                );
                state.selection = Some(selection);
                Ok(connection)
            }
            Err(e) => {
                warn!(
                    upstream = %self.upstream,
                    target = %selection.address,
                    error = %e,
                    "Failed to connect to upstream target"
                );
                self.balancer.release(&selection);
                self.balancer.report_health(&selection.address, false).await;
                Err(e)
            }
        }
    }

    async fn release(
        &self,
        state: &mut ConnectorState,
        connection: PeerConnection<TcpConnection>,
        outcome: PeerOutcome,
    ) {
        state.selection = None;

        debug!(
            upstream = %self.upstream,
            target = %connection.address(),
            connection = %connection.id(),
            outcome = ?outcome,
            "Closing upstream connection"
        );
        // Closing drops the transport's lease, which releases the balancer slot
        connection.close();
    }
}
