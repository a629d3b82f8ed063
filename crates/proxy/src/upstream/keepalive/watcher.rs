//! Per-connection idle watcher.
//!
//! A cached connection should see no traffic at all. If the peer closes it,
//! sends bytes nobody asked for, or the socket errors, the connection can no
//! longer be reused and is evicted and closed right away instead of being
//! discovered broken by the next request.

use std::future::poll_fn;
use std::sync::Weak;
use std::task::Poll;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use tether_common::ids::ConnectionId;

use super::cache::{PoolShared, TransportSlot};
use crate::upstream::transport::{IdleEvent, UpstreamTransport};

/// Watch task attached to one idle connection.
///
/// Dropping the watcher without [`detach`](IdleWatcher::detach) tells the
/// task its pool is gone, and the task closes the connection itself.
pub(crate) struct IdleWatcher {
    detach: oneshot::Sender<()>,
}

impl IdleWatcher {
    pub(crate) fn spawn<T: UpstreamTransport>(
        runtime: &Handle,
        pool: Weak<PoolShared<T>>,
        id: ConnectionId,
        slot: TransportSlot<T>,
    ) -> Self {
        let (detach, detach_rx) = oneshot::channel();
        runtime.spawn(watch(pool, id, slot, detach_rx));
        Self { detach }
    }

    /// Stop watching. The transport stays with whoever took it.
    pub(crate) fn detach(self) {
        // The task may already have finished; nothing to stop then
        let _ = self.detach.send(());
    }
}

async fn watch<T: UpstreamTransport>(
    pool: Weak<PoolShared<T>>,
    id: ConnectionId,
    slot: TransportSlot<T>,
    detach_rx: oneshot::Receiver<()>,
) {
    let idle_event = poll_fn(|cx| match slot.lock().as_ref() {
        Some(transport) => transport.poll_idle_event(cx).map(Some),
        None => Poll::Ready(None),
    });

    let event = tokio::select! {
        biased;

        detached = detach_rx => {
            if detached.is_err() {
                // Pool dropped with this connection still idle
                if let Some(transport) = slot.lock().take() {
                    trace!(connection = %id, "Closing idle connection of dropped pool");
                    transport.close();
                }
            }
            return;
        }
        event = idle_event => event,
    };

    let Some(event) = event else {
        return;
    };

    let transport = match pool.upgrade() {
        Some(shared) => {
            debug!(
                upstream = %shared.upstream(),
                connection = %id,
                event = ?event,
                "Idle upstream connection became unusable"
            );
            shared.evict(id)
        }
        None => slot.lock().take(),
    };

    // None means a select took the connection first; it is no longer ours
    if let Some(transport) = transport {
        if let IdleEvent::Error(kind) = event {
            trace!(connection = %id, error_kind = ?kind, "Closing errored idle connection");
        }
        transport.close();
    }
}
