//! Upstream transports.
//!
//! The keepalive layer never reads or writes request bytes. It needs exactly
//! three things from a transport: a way to wait for the peer to close or speak
//! while the connection sits idle, a way to drop per-request deadlines before
//! caching, and a way to close it.

use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::ReadBuf;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use tether_common::errors::{TetherError, TetherResult};

use super::balancer::SelectionLease;

/// What woke an idle connection.
///
/// All variants are handled the same way (evict and close); they are kept
/// apart for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// Peer closed its side of the connection
    Closed,
    /// Peer sent bytes while nothing was asked of it
    UnsolicitedData,
    /// Transport-level error
    Error(io::ErrorKind),
}

/// A connection to an upstream server as seen by the keepalive layer.
pub trait UpstreamTransport: Send + 'static {
    /// Poll for the single event an idle connection waits on.
    ///
    /// Must register `cx`'s waker when returning `Pending` and must not
    /// consume any bytes from the connection.
    fn poll_idle_event(&self, cx: &mut Context<'_>) -> Poll<IdleEvent>;

    /// Cancel read/write deadlines armed for the previous request.
    fn clear_deadlines(&mut self);

    /// Forcibly close the connection.
    fn close(self);
}

/// Plain TCP upstream connection.
///
/// The read/write deadlines are armed and enforced by whoever drives request
/// bytes over the stream; this layer only clears them before caching.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    lease: Option<SelectionLease>,
}

impl TcpConnection {
    /// Connect to `address`, failing after `timeout`.
    pub async fn connect(address: &str, timeout: Duration) -> TetherResult<Self> {
        trace!(address = %address, timeout_ms = timeout.as_millis() as u64, "Connecting to upstream");

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TetherError::Upstream {
                    upstream: address.to_string(),
                    message: format!("connect failed: {}", e),
                    retryable: true,
                    source: Some(Box::new(e)),
                })
            }
            Err(_) => {
                return Err(TetherError::timeout(
                    format!("connect to {}", address),
                    timeout.as_millis() as u64,
                ))
            }
        };

        let connection = Self::from_stream(stream)?;
        debug!(address = %address, peer = %connection.peer_addr, "Upstream connection established");
        Ok(connection)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer_addr,
            read_deadline: None,
            write_deadline: None,
            lease: None,
        })
    }

    /// Hold `lease` until this connection is closed or dropped.
    pub fn with_lease(mut self, lease: SelectionLease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn lease(&self) -> Option<&SelectionLease> {
        self.lease.as_ref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Arm the read deadline for the current request.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    /// Arm the write deadline for the current request.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline
    }
}

impl UpstreamTransport for TcpConnection {
    fn poll_idle_event(&self, cx: &mut Context<'_>) -> Poll<IdleEvent> {
        // Peek so that whatever the peer sent stays in the socket buffer
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        match self.stream.poll_peek(cx, &mut buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(0)) => Poll::Ready(IdleEvent::Closed),
            Poll::Ready(Ok(_)) => Poll::Ready(IdleEvent::UnsolicitedData),
            Poll::Ready(Err(e)) => Poll::Ready(IdleEvent::Error(e.kind())),
        }
    }

    fn clear_deadlines(&mut self) {
        self.read_deadline = None;
        self.write_deadline = None;
    }

    fn close(self) {
        trace!(peer = %self.peer_addr, "Closing upstream connection");
        // Dropping releases the balancer lease, if any
        drop(self);
    }
}
