//! In-memory transport for exercising the keepalive layer without sockets.

use parking_lot::Mutex;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::upstream::transport::{IdleEvent, UpstreamTransport};

#[derive(Debug, Default)]
struct MockState {
    event: Option<IdleEvent>,
    waker: Option<Waker>,
    closes: usize,
    deadlines_cleared: usize,
}

/// Test-side handle onto a [`MockTransport`], kept after the transport
/// itself has moved into the pool.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockControl {
    state: Arc<Mutex<MockState>>,
}

impl MockControl {
    pub(crate) fn transport(&self) -> MockTransport {
        MockTransport {
            control: self.clone(),
        }
    }

    /// Make the peer "do something" on the idle connection.
    pub(crate) fn fire(&self, event: IdleEvent) {
        let waker = {
            let mut state = self.state.lock();
            state.event = Some(event);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn closes(&self) -> usize {
        self.state.lock().closes
    }

    pub(crate) fn deadlines_cleared(&self) -> usize {
        self.state.lock().deadlines_cleared
    }
}

#[derive(Debug)]
pub(crate) struct MockTransport {
    control: MockControl,
}

impl UpstreamTransport for MockTransport {
    fn poll_idle_event(&self, cx: &mut Context<'_>) -> Poll<IdleEvent> {
        let mut state = self.control.state.lock();
        match state.event {
            Some(event) => Poll::Ready(event),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn clear_deadlines(&mut self) {
        self.control.state.lock().deadlines_cleared += 1;
    }

    fn close(self) {
        self.control.state.lock().closes += 1;
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
