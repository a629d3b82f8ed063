//! Bounded idle connection cache for one upstream group.
//!
//! The cache is a stack: the most recently released connection is the first
//! one handed out again, which keeps a small set of connections warm and lets
//! the rest age out when the peer closes them.
//!
//! # Ownership
//!
//! While a connection sits in the cache its transport lives in a shared slot
//! that both the cache and the connection's [`IdleWatcher`] can reach. Only
//! the cache moves a transport out of its slot while the pool is alive, and it
//! only does so with the idle list locked, so a transport is handed out or
//! closed exactly once.
//!
//! Lock order is idle list, then slot.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use tether_common::errors::{TetherError, TetherResult};
use tether_common::ids::{ConnectionId, UpstreamId};

use super::watcher::IdleWatcher;
use crate::upstream::peer::{ConnectionState, PeerConnection};
use crate::upstream::transport::UpstreamTransport;

/// Transport storage shared between the cache and a watcher.
pub(crate) type TransportSlot<T> = Arc<Mutex<Option<T>>>;

/// Why a connection was not admitted to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The request that used the connection failed
    Failed,
    /// The transport was already torn down
    NoTransport,
    /// The cache already holds `capacity` connections
    Full,
    /// No tokio runtime to run the idle watcher on
    NoRuntime,
}

/// Result of [`KeepalivePool::offer`].
#[must_use]
#[derive(Debug)]
pub enum Admission<T> {
    /// The cache took the connection over
    Accepted,
    /// The caller still owns the connection and must dispose of it
    Rejected {
        connection: PeerConnection<T>,
        reason: RejectReason,
    },
}

impl<T> Admission<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

struct IdleEntry<T> {
    /// Bookkeeping half of the connection; its transport lives in `slot`
    connection: PeerConnection<T>,
    slot: TransportSlot<T>,
    watcher: IdleWatcher,
}

pub(crate) struct PoolShared<T> {
    upstream: UpstreamId,
    capacity: usize,
    idle: Mutex<Vec<IdleEntry<T>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    eviction_misses: AtomicU64,
}

impl<T: UpstreamTransport> PoolShared<T> {
    pub(crate) fn upstream(&self) -> &UpstreamId {
        &self.upstream
    }

    /// Remove the entry for `id` and hand its transport to the caller.
    ///
    /// Only an idle watcher calls this, for its own connection. The entry may
    /// already be gone if the connection was taken or drained in the
    /// meantime; that is not an error.
    pub(crate) fn evict(&self, id: ConnectionId) -> Option<T> {
        let mut idle = self.idle.lock();

        let Some(position) = idle.iter().position(|entry| entry.connection.id == id) else {
            self.eviction_misses.fetch_add(1, Ordering::Relaxed);
            debug!(
                upstream = %self.upstream,
                connection = %id,
                "Idle connection already left the cache, nothing to evict"
            );
            return None;
        };

        // Vec::remove keeps the remaining entries in stack order
        let entry = idle.remove(position);
        let transport = entry.slot.lock().take();
        self.evicted.fetch_add(1, Ordering::Relaxed);

        trace!(
            upstream = %self.upstream,
            connection = %id,
            idle = idle.len(),
            "Evicted idle connection"
        );
        transport
    }
}

/// Idle connection cache for one upstream group.
///
/// Cloning is cheap and yields another handle onto the same cache.
pub struct KeepalivePool<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> Clone for KeepalivePool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: UpstreamTransport> KeepalivePool<T> {
    /// Create an empty cache holding at most `capacity` idle connections.
    pub fn new(upstream: UpstreamId, capacity: usize) -> TetherResult<Self> {
        if capacity == 0 {
            return Err(TetherError::config(format!(
                "keepalive cache for upstream '{}' needs a capacity of at least 1",
                upstream
            )));
        }

        debug!(upstream = %upstream, capacity = capacity, "Keepalive pool created");

        Ok(Self {
            shared: Arc::new(PoolShared {
                upstream,
                capacity,
                idle: Mutex::new(Vec::with_capacity(capacity)),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                admitted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                eviction_misses: AtomicU64::new(0),
            }),
        })
    }

    pub fn upstream(&self) -> &UpstreamId {
        &self.shared.upstream
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of idle connections right now.
    pub fn len(&self) -> usize {
        self.shared.idle.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the most recently cached connection, if any.
    ///
    /// The connection's watcher is detached before it is returned. Never
    /// blocks beyond the idle list lock.
    pub fn try_take(&self) -> Option<PeerConnection<T>> {
        let mut idle = self.shared.idle.lock();

        while let Some(entry) = idle.pop() {
            let IdleEntry {
                mut connection,
                slot,
                watcher,
            } = entry;
            watcher.detach();

            let Some(transport) = slot.lock().take() else {
                // Emptied without going through the cache; skip it
                continue;
            };

            connection.transport = Some(transport);
            connection.state = ConnectionState::Active;
            connection.cached = true;
            self.shared.hits.fetch_add(1, Ordering::Relaxed);

            trace!(
                upstream = %self.shared.upstream,
                connection = %connection.id,
                idle = idle.len(),
                "Reusing idle connection"
            );
            return Some(connection);
        }

        self.shared.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Offer a released connection to the cache.
    ///
    /// A rejected connection is handed back unchanged for the caller to
    /// dispose of.
    pub fn offer(&self, mut connection: PeerConnection<T>, failed: bool) -> Admission<T> {
        if failed {
            return self.reject(connection, RejectReason::Failed);
        }
        if !connection.has_transport() {
            return self.reject(connection, RejectReason::NoTransport);
        }
        let Ok(runtime) = Handle::try_current() else {
            return self.reject(connection, RejectReason::NoRuntime);
        };

        let mut idle = self.shared.idle.lock();
        if idle.len() >= self.shared.capacity {
            drop(idle);
            return self.reject(connection, RejectReason::Full);
        }

        let Some(mut transport) = connection.transport.take() else {
            drop(idle);
            return self.reject(connection, RejectReason::NoTransport);
        };

        transport.clear_deadlines();
        connection.state = ConnectionState::Idle;

        let id = connection.id;
        let slot: TransportSlot<T> = Arc::new(Mutex::new(Some(transport)));
        let watcher = IdleWatcher::spawn(
            &runtime,
            Arc::downgrade(&self.shared),
            id,
            Arc::clone(&slot),
        );

        idle.push(IdleEntry {
            connection,
            slot,
            watcher,
        });
        self.shared.admitted.fetch_add(1, Ordering::Relaxed);

        trace!(
            upstream = %self.shared.upstream,
            connection = %id,
            idle = idle.len(),
            "Cached idle connection"
        );
        Admission::Accepted
    }

    /// Close every idle connection and empty the cache.
    ///
    /// Returns how many connections were closed.
    pub fn drain(&self) -> usize {
        let entries = std::mem::take(&mut *self.shared.idle.lock());
        let count = entries.len();

        for entry in entries {
            entry.watcher.detach();
            if let Some(transport) = entry.slot.lock().take() {
                transport.close();
            }
        }

        debug!(
            upstream = %self.shared.upstream,
            closed = count,
            "Drained keepalive pool"
        );
        count
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.shared.capacity,
            idle: self.len(),
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            admitted: self.shared.admitted.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            evicted: self.shared.evicted.load(Ordering::Relaxed),
            eviction_misses: self.shared.eviction_misses.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, connection: PeerConnection<T>, reason: RejectReason) -> Admission<T> {
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
        trace!(
            upstream = %self.shared.upstream,
            connection = %connection.id,
            reason = ?reason,
            "Connection not cached"
        );
        Admission::Rejected { connection, reason }
    }
}

/// Keepalive cache statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum idle connections
    pub capacity: usize,
    /// Currently idle connections
    pub idle: usize,
    /// Selects served from the cache
    pub hits: u64,
    /// Selects that found the cache empty
    pub misses: u64,
    /// Released connections taken into the cache
    pub admitted: u64,
    /// Released connections turned away
    pub rejected: u64,
    /// Idle connections evicted by their watcher
    pub evicted: u64,
    /// Watcher evictions that found the connection already gone
    pub eviction_misses: u64,
}

impl PoolStats {
    /// Fraction of selects served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}
