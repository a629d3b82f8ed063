//! Target selection within an upstream group.
//!
//! Balancers pick which target address a fresh connection goes to. They know
//! nothing about connection reuse; a select that is satisfied from the idle
//! cache never reaches them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::fmt;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::trace;

use tether_common::errors::{TetherError, TetherResult};
use tether_common::types::LoadBalancingAlgorithm;
use tether_config::UpstreamTarget;

/// Request context for load balancer decisions
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_ip: Option<SocketAddr>,
    pub headers: HashMap<String, String>,
    pub path: String,
    pub method: String,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_client_ip(mut self, client_ip: SocketAddr) -> Self {
        self.client_ip = Some(client_ip);
        self
    }
}

/// Selected upstream target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSelection {
    /// Target address
    pub address: String,
    /// Target weight
    pub weight: u32,
}

impl TargetSelection {
    fn from_target(target: &UpstreamTarget) -> Self {
        Self {
            address: target.address.clone(),
            weight: target.weight,
        }
    }
}

/// Load balancer trait for different algorithms
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Select next upstream target
    async fn select(&self, context: Option<&RequestContext>) -> TetherResult<TargetSelection>;

    /// Report target health status
    async fn report_health(&self, address: &str, healthy: bool);

    /// Get all healthy targets
    async fn healthy_targets(&self) -> Vec<String>;

    /// Release a connection previously selected (for connection tracking)
    fn release(&self, _selection: &TargetSelection) {}
}

/// Ties a selection to the connection opened for it.
///
/// The balancer's `release` runs when the lease is dropped, so a connection
/// closed from anywhere (request path, idle watcher, shutdown drain) gives
/// its slot back exactly once.
pub struct SelectionLease {
    balancer: Arc<dyn LoadBalancer>,
    selection: TargetSelection,
}

impl SelectionLease {
    pub fn new(balancer: Arc<dyn LoadBalancer>, selection: TargetSelection) -> Self {
        Self {
            balancer,
            selection,
        }
    }

    pub fn selection(&self) -> &TargetSelection {
        &self.selection
    }
}

impl fmt::Debug for SelectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionLease")
            .field("selection", &self.selection)
            .finish()
    }
}

impl Drop for SelectionLease {
    fn drop(&mut self) {
        self.balancer.release(&self.selection);
    }
}

/// Build the balancer for an algorithm.
pub fn create_load_balancer(
    algorithm: LoadBalancingAlgorithm,
    targets: &[UpstreamTarget],
) -> TetherResult<Arc<dyn LoadBalancer>> {
    if targets.is_empty() {
        return Err(TetherError::config("No upstream targets configured"));
    }

    let balancer: Arc<dyn LoadBalancer> = match algorithm {
        LoadBalancingAlgorithm::RoundRobin => Arc::new(RoundRobinBalancer::new(targets.to_vec())),
        LoadBalancingAlgorithm::LeastConnections => {
            Arc::new(LeastConnectionsBalancer::new(targets.to_vec()))
        }
        LoadBalancingAlgorithm::Weighted => Arc::new(WeightedBalancer::new(targets.to_vec())),
        LoadBalancingAlgorithm::IpHash => Arc::new(IpHashBalancer::new(targets.to_vec())),
    };
    Ok(balancer)
}

fn initial_health(targets: &[UpstreamTarget]) -> Arc<RwLock<HashMap<String, bool>>> {
    let health = targets
        .iter()
        .map(|target| (target.address.clone(), true))
        .collect();
    Arc::new(RwLock::new(health))
}

async fn set_health(health: &RwLock<HashMap<String, bool>>, address: &str, healthy: bool) {
    trace!(target_address = %address, healthy = healthy, "Target health reported");
    health.write().await.insert(address.to_string(), healthy);
}

async fn collect_healthy(health: &RwLock<HashMap<String, bool>>) -> Vec<String> {
    let mut healthy: Vec<String> = health
        .read()
        .await
        .iter()
        .filter_map(|(addr, &healthy)| healthy.then(|| addr.clone()))
        .collect();
    healthy.sort_unstable();
    healthy
}

/// Round-robin load balancer
pub struct RoundRobinBalancer {
    targets: Vec<UpstreamTarget>,
    current: AtomicUsize,
    health_status: Arc<RwLock<HashMap<String, bool>>>,
}

impl RoundRobinBalancer {
    pub fn new(targets: Vec<UpstreamTarget>) -> Self {
        Self {
            health_status: initial_health(&targets),
            targets,
            current: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LoadBalancer for RoundRobinBalancer {
    async fn select(&self, _context: Option<&RequestContext>) -> TetherResult<TargetSelection> {
        let health = self.health_status.read().await;
        let healthy_targets: Vec<_> = self
            .targets
            .iter()
            .filter(|t| *health.get(&t.address).unwrap_or(&true))
            .collect();

        if healthy_targets.is_empty() {
            return Err(TetherError::NoHealthyUpstream);
        }

        let index = self.current.fetch_add(1, Ordering::Relaxed) % healthy_targets.len();
        Ok(TargetSelection::from_target(healthy_targets[index]))
    }

    async fn report_health(&self, address: &str, healthy: bool) {
        set_health(&self.health_status, address, healthy).await;
    }

    async fn healthy_targets(&self) -> Vec<String> {
        collect_healthy(&self.health_status).await
    }
}

/// Least connections load balancer.
///
/// Counts connections handed out by `select` until their `release`.
pub struct LeastConnectionsBalancer {
    targets: Vec<UpstreamTarget>,
    connections: Mutex<HashMap<String, usize>>,
    health_status: Arc<RwLock<HashMap<String, bool>>>,
}

impl LeastConnectionsBalancer {
    pub fn new(targets: Vec<UpstreamTarget>) -> Self {
        let connections = targets
            .iter()
            .map(|target| (target.address.clone(), 0))
            .collect();

        Self {
            health_status: initial_health(&targets),
            connections: Mutex::new(connections),
            targets,
        }
    }

    /// Connections currently attributed to `address`.
    pub fn active_connections(&self, address: &str) -> usize {
        self.connections
            .lock()
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl LoadBalancer for LeastConnectionsBalancer {
    async fn select(&self, _context: Option<&RequestContext>) -> TetherResult<TargetSelection> {
        let health = self.health_status.read().await;
        let mut conns = self.connections.lock();

        let mut best_target = None;
        let mut min_connections = usize::MAX;

        for target in &self.targets {
            if !*health.get(&target.address).unwrap_or(&true) {
                continue;
            }

            let conn_count = *conns.get(&target.address).unwrap_or(&0);
            if conn_count < min_connections {
                min_connections = conn_count;
                best_target = Some(target);
            }
        }

        let target = best_target.ok_or(TetherError::NoHealthyUpstream)?;
        *conns.entry(target.address.clone()).or_insert(0) += 1;
        Ok(TargetSelection::from_target(target))
    }

    async fn report_health(&self, address: &str, healthy: bool) {
        set_health(&self.health_status, address, healthy).await;
    }

    async fn healthy_targets(&self) -> Vec<String> {
        collect_healthy(&self.health_status).await
    }

    fn release(&self, selection: &TargetSelection) {
        let mut conns = self.connections.lock();
        if let Some(count) = conns.get_mut(&selection.address) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Weighted round-robin load balancer.
///
/// Over any run of `sum(weights)` selections each healthy target is picked
/// as many times as its weight.
pub struct WeightedBalancer {
    targets: Vec<UpstreamTarget>,
    current_index: AtomicUsize,
    health_status: Arc<RwLock<HashMap<String, bool>>>,
}

impl WeightedBalancer {
    pub fn new(targets: Vec<UpstreamTarget>) -> Self {
        Self {
            health_status: initial_health(&targets),
            targets,
            current_index: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LoadBalancer for WeightedBalancer {
    async fn select(&self, _context: Option<&RequestContext>) -> TetherResult<TargetSelection> {
        let health = self.health_status.read().await;
        let healthy_targets: Vec<_> = self
            .targets
            .iter()
            .filter(|t| *health.get(&t.address).unwrap_or(&true))
            .collect();

        let total: u64 = healthy_targets.iter().map(|t| u64::from(t.weight.max(1))).sum();
        if total == 0 {
            return Err(TetherError::NoHealthyUpstream);
        }

        // Walk cumulative weights to the slot the cursor lands on
        let mut slot = self.current_index.fetch_add(1, Ordering::Relaxed) as u64 % total;
        for target in &healthy_targets {
            let weight = u64::from(target.weight.max(1));
            if slot < weight {
                return Ok(TargetSelection::from_target(target));
            }
            slot -= weight;
        }
        Err(TetherError::NoHealthyUpstream)
    }

    async fn report_health(&self, address: &str, healthy: bool) {
        set_health(&self.health_status, address, healthy).await;
    }

    async fn healthy_targets(&self) -> Vec<String> {
        collect_healthy(&self.health_status).await
    }
}

/// IP hash load balancer
pub struct IpHashBalancer {
    targets: Vec<UpstreamTarget>,
    health_status: Arc<RwLock<HashMap<String, bool>>>,
}

impl IpHashBalancer {
    pub fn new(targets: Vec<UpstreamTarget>) -> Self {
        Self {
            health_status: initial_health(&targets),
            targets,
        }
    }
}

#[async_trait]
impl LoadBalancer for IpHashBalancer {
    async fn select(&self, context: Option<&RequestContext>) -> TetherResult<TargetSelection> {
        let health = self.health_status.read().await;
        let healthy_targets: Vec<_> = self
            .targets
            .iter()
            .filter(|t| *health.get(&t.address).unwrap_or(&true))
            .collect();

        if healthy_targets.is_empty() {
            return Err(TetherError::NoHealthyUpstream);
        }

        // Hash only the IP so all connections from one client stick together
        let hash = match context.and_then(|ctx| ctx.client_ip) {
            Some(addr) => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                addr.ip().hash(&mut hasher);
                hasher.finish()
            }
            None => 0,
        };

        let idx = (hash as usize) % healthy_targets.len();
        Ok(TargetSelection::from_target(healthy_targets[idx]))
    }

    async fn report_health(&self, address: &str, healthy: bool) {
        set_health(&self.health_status, address, healthy).await;
    }

    async fn healthy_targets(&self) -> Vec<String> {
        collect_healthy(&self.health_status).await
    }
}
