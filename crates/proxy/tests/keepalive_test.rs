//! Integration tests for keepalive connection reuse.
//!
//! These tests drive an `UpstreamGroup` against real loopback TCP servers and
//! watch both sides: which connections the group hands out, and what the
//! upstream server sees (accepts, closes).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tether_config::{UpstreamConfig, UpstreamTarget};
use tether_proxy::upstream::{PeerOutcome, RequestContext, UpstreamGroup};

// ============================================================================
// Test Upstream
// ============================================================================

/// Loopback server that hands every accepted socket to the test.
struct TestUpstream {
    address: String,
    accepts: Arc<AtomicUsize>,
    accepted: mpsc::UnboundedReceiver<TcpStream>,
}

impl TestUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepts = Arc::new(AtomicUsize::new(0));
        let (tx, accepted) = mpsc::unbounded_channel();

        let counter = accepts.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if tx.send(stream).is_err() {
                    break;
                }
            }
        });

        Self {
            address,
            accepts,
            accepted,
        }
    }

    fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    /// Server side of the next accepted connection.
    async fn next_stream(&mut self) -> TcpStream {
        tokio::time::timeout(Duration::from_secs(2), self.accepted.recv())
            .await
            .expect("upstream accepted nothing")
            .expect("accept loop ended")
    }

    fn group(&self, cached: Option<usize>) -> UpstreamGroup {
        let mut config =
            UpstreamConfig::new("backend", vec![UpstreamTarget::new(self.address.clone())]);
        if let Some(cached) = cached {
            config = config.with_keepalive(cached);
        }
        UpstreamGroup::from_config(&config).unwrap()
    }
}

/// True once the proxy side of `stream` is gone.
async fn closed_by_proxy(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn request() -> RequestContext {
    RequestContext::new("GET", "/")
}

// ============================================================================
// End-to-end Scenarios
// ============================================================================

#[tokio::test]
async fn test_reuse_then_peer_close_then_fresh_connection() {
    let mut upstream = TestUpstream::start().await;
    let group = upstream.group(Some(1));

    // R1: miss, fresh connection, cached on release
    let mut state = group.init_peer(&request()).unwrap();
    let first = group.select(&mut state).await.unwrap();
    assert!(!first.is_cached());
    let first_id = first.id();
    let server_side = upstream.next_stream().await;
    group.release(&mut state, first, PeerOutcome::Success).await;
    assert_eq!(group.keepalive_stats().unwrap().idle, 1);

    // R2: hit, no new connection reaches the upstream
    let mut state = group.init_peer(&request()).unwrap();
    let second = group.select(&mut state).await.unwrap();
    assert!(second.is_cached());
    assert_eq!(second.id(), first_id);
    assert_eq!(group.keepalive_stats().unwrap().idle, 0);
    group.release(&mut state, second, PeerOutcome::Success).await;
    assert_eq!(upstream.accepts(), 1);

    // The upstream closes the idle connection; the watcher reclaims it
    drop(server_side);
    wait_until(|| group.keepalive_stats().unwrap().evicted == 1).await;
    assert_eq!(group.keepalive_stats().unwrap().idle, 0);

    // R3: miss again, fresh connection
    let mut state = group.init_peer(&request()).unwrap();
    let third = group.select(&mut state).await.unwrap();
    assert!(!third.is_cached());
    assert_ne!(third.id(), first_id);
    let _server_side = upstream.next_stream().await;
    assert_eq!(upstream.accepts(), 2);
    group.release(&mut state, third, PeerOutcome::Success).await;
}

#[tokio::test]
async fn test_full_cache_disposes_through_strategy() {
    let mut upstream = TestUpstream::start().await;
    let group = upstream.group(Some(1));

    let mut first_state = group.init_peer(&request()).unwrap();
    let mut second_state = group.init_peer(&request()).unwrap();
    let first = group.select(&mut first_state).await.unwrap();
    let _first_server = upstream.next_stream().await;
    let second = group.select(&mut second_state).await.unwrap();
    let mut second_server = upstream.next_stream().await;
    let first_id = first.id();

    group.release(&mut first_state, first, PeerOutcome::Success).await;
    group.release(&mut second_state, second, PeerOutcome::Success).await;

    let stats = group.keepalive_stats().unwrap();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.rejected, 1);

    // The rejected connection was closed by the connector
    assert!(closed_by_proxy(&mut second_server).await);

    let mut state = group.init_peer(&request()).unwrap();
    let reused = group.select(&mut state).await.unwrap();
    assert_eq!(reused.id(), first_id);
    group.release(&mut state, reused, PeerOutcome::Success).await;
}

// ============================================================================
// Idle Watcher
// ============================================================================

#[tokio::test]
async fn test_unsolicited_data_evicts_idle_connection() {
    let mut upstream = TestUpstream::start().await;
    let group = upstream.group(Some(2));

    let mut state = group.init_peer(&request()).unwrap();
    let conn = group.select(&mut state).await.unwrap();
    let mut server_side = upstream.next_stream().await;
    group.release(&mut state, conn, PeerOutcome::Success).await;

    server_side
        .write_all(b"HTTP/1.1 408 Request Timeout\r\n\r\n")
        .await
        .unwrap();

    wait_until(|| group.keepalive_stats().unwrap().evicted == 1).await;
    assert_eq!(group.keepalive_stats().unwrap().idle, 0);
    assert!(closed_by_proxy(&mut server_side).await);

    // The next request must not get the desynchronized connection
    let mut state = group.init_peer(&request()).unwrap();
    let fresh = group.select(&mut state).await.unwrap();
    assert!(!fresh.is_cached());
    let _server_side = upstream.next_stream().await;
    group.release(&mut state, fresh, PeerOutcome::Success).await;
}

#[tokio::test]
async fn test_quiet_idle_connection_stays_cached() {
    let mut upstream = TestUpstream::start().await;
    let group = upstream.group(Some(1));

    let mut state = group.init_peer(&request()).unwrap();
    let conn = group.select(&mut state).await.unwrap();
    let _server_side = upstream.next_stream().await;
    group.release(&mut state, conn, PeerOutcome::Success).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = group.keepalive_stats().unwrap();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.evicted, 0);
}

// ============================================================================
// Release Paths
// ============================================================================

#[tokio::test]
async fn test_failed_request_is_never_cached() {
    let mut upstream = TestUpstream::start().await;
    let group = upstream.group(Some(4));

    let mut state = group.init_peer(&request()).unwrap();
    let conn = group.select(&mut state).await.unwrap();
    let mut server_side = upstream.next_stream().await;
    group.release(&mut state, conn, PeerOutcome::Failed).await;

    assert_eq!(group.keepalive_stats().unwrap().idle, 0);
    assert!(closed_by_proxy(&mut server_side).await);
}

#[tokio::test]
async fn test_without_keepalive_every_request_connects() {
    let mut upstream = TestUpstream::start().await;
    let group = upstream.group(None);
    assert!(group.keepalive_stats().is_none());

    for _ in 0..3 {
        let mut state = group.init_peer(&request()).unwrap();
        let conn = group.select(&mut state).await.unwrap();
        assert!(!conn.is_cached());
        let mut server_side = upstream.next_stream().await;
        group.release(&mut state, conn, PeerOutcome::Success).await;
        assert!(closed_by_proxy(&mut server_side).await);
    }
    assert_eq!(upstream.accepts(), 3);
}

#[tokio::test]
async fn test_capacity_never_exceeded_under_churn() {
    let mut upstream = TestUpstream::start().await;
    let group = upstream.group(Some(2));

    let mut held = Vec::new();
    for _ in 0..5 {
        let mut state = group.init_peer(&request()).unwrap();
        let conn = group.select(&mut state).await.unwrap();
        held.push((state, conn, upstream.next_stream().await));
    }

    let mut servers = Vec::new();
    for (mut state, conn, server) in held {
        group.release(&mut state, conn, PeerOutcome::Success).await;
        assert!(group.keepalive_stats().unwrap().idle <= 2);
        servers.push(server);
    }

    let stats = group.keepalive_stats().unwrap();
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.admitted, 2);
    assert_eq!(stats.rejected, 3);
}

#[tokio::test]
async fn test_shutdown_closes_idle_connections() {
    let mut upstream = TestUpstream::start().await;
    let group = upstream.group(Some(2));

    let mut first_state = group.init_peer(&request()).unwrap();
    let mut second_state = group.init_peer(&request()).unwrap();
    let first = group.select(&mut first_state).await.unwrap();
    let mut first_server = upstream.next_stream().await;
    let second = group.select(&mut second_state).await.unwrap();
    let mut second_server = upstream.next_stream().await;
    group.release(&mut first_state, first, PeerOutcome::Success).await;
    group.release(&mut second_state, second, PeerOutcome::Success).await;

    assert_eq!(group.shutdown(), 2);
    assert!(closed_by_proxy(&mut first_server).await);
    assert!(closed_by_proxy(&mut second_server).await);
    assert_eq!(group.keepalive_stats().unwrap().idle, 0);
}

#[tokio::test]
async fn test_unreachable_target_error_passes_through() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let config = UpstreamConfig::new("backend", vec![UpstreamTarget::new(address)])
        .with_keepalive(1);
    let group = UpstreamGroup::from_config(&config).unwrap();

    let mut state = group.init_peer(&request()).unwrap();
    let err = group.select(&mut state).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(group.keepalive_stats().unwrap().misses, 1);
}
