//! GPU allocation engine
//!
//! Searches the inventory for a single node able to satisfy a request,
//! reserves the lowest free GPU indices on it and issues a time-bounded
//! lease. Search and reservation run under one inventory write lock, so two
//! concurrent requests can never be granted the same GPU unit.
//!
//! Grants, releases and revocations are published as [`AllocationEvent`]s
//! on a broadcast channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::health::{components, AlertSeverity, HealthMonitor};
use crate::lifecycle::NodeState;
use crate::models::{
    Allocation, AllocationId, AllocationReceipt, AllocationRequest, NodeId,
};
use crate::observability::FleetMetrics;
use crate::registry::NodeRegistry;

/// Default lease duration
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(3600);

/// Capacity of the allocation event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Allocation engine configuration
#[derive(Debug, Clone)]
pub struct AllocationConfig {
    /// Lease lifetime applied to every grant
    pub default_lease_ttl: Duration,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            default_lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

/// Why a lease ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseReason {
    /// Explicit release by the job owner
    Released,
    /// Reclaimed by the expiry sweep
    Expired,
    /// Cancelled because the node left an allocatable state
    Revoked,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Released => "released",
            ReleaseReason::Expired => "expired",
            ReleaseReason::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change in lease accounting, published after the inventory lock is released
#[derive(Debug, Clone)]
pub enum AllocationEvent {
    Granted {
        job_id: String,
        receipt: AllocationReceipt,
        /// The grant moved the node from `Ready` to `Busy`
        node_became_busy: bool,
    },
    Released {
        allocation: Allocation,
        reason: ReleaseReason,
        /// The release moved the node from `Busy` back to `Ready`
        node_became_ready: bool,
    },
}

impl AllocationEvent {
    pub fn node_id(&self) -> NodeId {
        match self {
            AllocationEvent::Granted { receipt, .. } => receipt.node_id,
            AllocationEvent::Released { allocation, .. } => allocation.node_id,
        }
    }
}

/// A lease reclaimed by the sweep, with what the alert needs
struct Reclaimed {
    allocation: Allocation,
    hostname: String,
    node_became_ready: bool,
}

/// Allocation engine, cheap to clone
#[derive(Clone)]
pub struct AllocationEngine {
    registry: NodeRegistry,
    monitor: HealthMonitor,
    config: AllocationConfig,
    events: broadcast::Sender<AllocationEvent>,
    metrics: FleetMetrics,
}

impl AllocationEngine {
    pub fn new(registry: NodeRegistry, monitor: HealthMonitor, config: AllocationConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            monitor,
            config,
            events,
            metrics: FleetMetrics::new(),
        }
    }

    /// Receive every grant, release, expiry and revocation from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AllocationEvent> {
        self.events.subscribe()
    }

    pub fn allocate(&self, request: &AllocationRequest) -> Result<AllocationReceipt> {
        self.allocate_at(request, Utc::now())
    }

    /// Allocate as if the current time were `now`
    pub fn allocate_at(
        &self,
        request: &AllocationRequest,
        now: DateTime<Utc>,
    ) -> Result<AllocationReceipt> {
        let started = Instant::now();
        let result = self.try_allocate(request, now);
        self.metrics
            .observe_allocation_latency(started.elapsed().as_secs_f64());

        match &result {
            Ok((receipt, node_became_busy)) => {
                self.metrics.inc_allocation_requests("granted");
                let _ = self.events.send(AllocationEvent::Granted {
                    job_id: request.job_id.clone(),
                    receipt: receipt.clone(),
                    node_became_busy: *node_became_busy,
                });
            }
            Err(err) => {
                self.metrics.inc_allocation_requests(err.kind());
                debug!(
                    job_id = %request.job_id,
                    gpu_count = request.gpu_count,
                    min_vram_gb = request.min_vram_gb,
                    error = %err,
                    "Allocation request not granted"
                );
            }
        }

        result.map(|(receipt, _)| receipt)
    }

    fn try_allocate(
        &self,
        request: &AllocationRequest,
        now: DateTime<Utc>,
    ) -> Result<(AllocationReceipt, bool)> {
        validate(request)?;
        let ttl = chrono::Duration::from_std(self.config.default_lease_ttl).map_err(|_| {
            FleetError::InvalidRequest("lease ttl is out of range".to_string())
        })?;
        let expires_at = now.checked_add_signed(ttl).ok_or_else(|| {
            FleetError::InvalidRequest("lease expiration is out of range".to_string())
        })?;

        // Read before taking the inventory lock
        let excluded = self.monitor.excluded_nodes();

        let mut inventory = self.registry.write();

        let (node_id, hostname, was_ready, gpu_indices) = {
            let eligible: Vec<_> = inventory
                .entries()
                .filter(|e| e.node.state.is_allocatable())
                .filter(|e| !excluded.contains(&e.node.id))
                .filter(|e| e.node.hardware.vram_per_gpu_gb >= request.min_vram_gb)
                .collect();

            let Some(chosen) = eligible
                .iter()
                .filter(|e| e.free_count() >= request.gpu_count)
                .min_by_key(|e| (Reverse(e.free_count()), e.node.id))
            else {
                return Err(FleetError::InsufficientCapacity {
                    requested: request.gpu_count,
                    min_vram_gb: request.min_vram_gb,
                    largest_free: eligible.iter().map(|e| e.free_count()).max().unwrap_or(0),
                });
            };

            (
                chosen.node.id,
                chosen.node.hostname.clone(),
                chosen.node.state == NodeState::Ready,
                chosen
                    .free_indices()
                    .take(request.gpu_count as usize)
                    .collect::<Vec<u32>>(),
            )
        };

        let allocation = Allocation {
            id: AllocationId::new(),
            job_id: request.job_id.clone(),
            priority: request.priority,
            node_id,
            gpu_indices: gpu_indices.clone(),
            granted_at: now,
            expires_at,
        };
        let receipt = AllocationReceipt {
            allocation_id: allocation.id,
            node_id,
            hostname,
            gpu_indices,
            lease_expiration: allocation.expires_at,
        };

        inventory.reserve(allocation)?;
        if was_ready {
            inventory.transition(node_id, NodeState::Busy)?;
        }

        Ok((receipt, was_ready))
    }

    /// Free a lease immediately
    pub fn release(&self, id: AllocationId) -> Result<Allocation> {
        let (allocation, node_became_ready) = self.registry.write().release(id)?;

        self.metrics
            .inc_leases_released(ReleaseReason::Released.as_str(), 1);
        let _ = self.events.send(AllocationEvent::Released {
            allocation: allocation.clone(),
            reason: ReleaseReason::Released,
            node_became_ready,
        });

        Ok(allocation)
    }

    /// Reclaim every lease whose expiration is at or before `now`.
    ///
    /// Returns the number of leases reclaimed; a second sweep with the same
    /// `now` reclaims nothing.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> usize {
        let reclaimed: Vec<Reclaimed> = {
            let mut inventory = self.registry.write();
            let expired: Vec<AllocationId> = inventory
                .allocations()
                .filter(|a| a.is_expired(now))
                .map(|a| a.id)
                .collect();

            expired
                .into_iter()
                .filter_map(|id| {
                    let node_id = inventory.allocation(id)?.node_id;
                    let hostname = inventory.entry(node_id).ok()?.node.hostname.clone();
                    match inventory.release(id) {
                        Ok((allocation, node_became_ready)) => Some(Reclaimed {
                            allocation,
                            hostname,
                            node_became_ready,
                        }),
                        Err(err) => {
                            warn!(allocation_id = %id, error = %err, "Failed to reclaim expired lease");
                            None
                        }
                    }
                })
                .collect()
        };

        if reclaimed.is_empty() {
            return 0;
        }

        self.metrics
            .inc_leases_released(ReleaseReason::Expired.as_str(), reclaimed.len() as u64);

        for lease in &reclaimed {
            self.monitor.raise_for_node(
                lease.allocation.node_id,
                AlertSeverity::Info,
                components::ALLOCATOR,
                format!(
                    "Lease {} for job {} on {} expired; {} GPU(s) reclaimed.",
                    lease.allocation.id,
                    lease.allocation.job_id,
                    lease.hostname,
                    lease.allocation.gpu_indices.len()
                ),
            );
            let _ = self.events.send(AllocationEvent::Released {
                allocation: lease.allocation.clone(),
                reason: ReleaseReason::Expired,
                node_became_ready: lease.node_became_ready,
            });
        }

        reclaimed.len()
    }

    /// Publish revocations produced by a lifecycle transition
    pub(crate) fn notify_revoked(&self, revoked: &[Allocation]) {
        if revoked.is_empty() {
            return;
        }
        self.metrics
            .inc_leases_released(ReleaseReason::Revoked.as_str(), revoked.len() as u64);
        for allocation in revoked {
            let _ = self.events.send(AllocationEvent::Released {
                allocation: allocation.clone(),
                reason: ReleaseReason::Revoked,
                node_became_ready: false,
            });
        }
    }

    pub fn get(&self, id: AllocationId) -> Result<Allocation> {
        self.registry
            .read()
            .allocation(id)
            .cloned()
            .ok_or_else(|| FleetError::allocation_not_found(id))
    }

    /// Active leases, oldest grant first
    pub fn list(&self) -> Vec<Allocation> {
        let mut allocations: Vec<Allocation> =
            self.registry.read().allocations().cloned().collect();
        allocations.sort_by_key(|a| (a.granted_at, a.id));
        allocations
    }

    pub fn allocations_on(&self, node_id: NodeId) -> Vec<Allocation> {
        self.list()
            .into_iter()
            .filter(|a| a.node_id == node_id)
            .collect()
    }

    /// Run the expiry sweep on a fixed period until shutdown
    pub async fn run_expiry_loop(
        self,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            interval_secs = period.as_secs(),
            "Starting lease expiry loop"
        );

        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reclaimed = self.expire_sweep(Utc::now());
                    if reclaimed > 0 {
                        debug!(reclaimed = reclaimed, "Expiry sweep complete");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down lease expiry loop");
                    break;
                }
            }
        }
    }
}

fn validate(request: &AllocationRequest) -> Result<()> {
    if request.job_id.trim().is_empty() {
        return Err(FleetError::InvalidRequest(
            "job_id must not be empty".to_string(),
        ));
    }
    if request.gpu_count == 0 {
        return Err(FleetError::InvalidRequest(
            "gpu_count must be at least 1".to_string(),
        ));
    }
    Ok(())
}

impl std::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("config", &self.config)
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthConfig;
    use crate::models::{GpuMetric, TelemetrySample};
    use crate::registry::tests::ready_node;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn engine() -> (NodeRegistry, HealthMonitor, AllocationEngine) {
        let registry = NodeRegistry::new();
        let monitor = HealthMonitor::new(HealthConfig::default());
        let engine = AllocationEngine::new(
            registry.clone(),
            monitor.clone(),
            AllocationConfig::default(),
        );
        (registry, monitor, engine)
    }

    fn hot_sample(gpus: u32) -> TelemetrySample {
        TelemetrySample {
            timestamp: Utc::now(),
            gpu_metrics: (0..gpus)
                .map(|index| GpuMetric {
                    index,
                    temperature_celsius: 90.0,
                    power_draw_watts: 300.0,
                    fan_speed_percent: 90.0,
                    gpu_utilization_percent: 99.0,
                    memory_utilization_percent: 80.0,
                })
                .collect(),
            system_load: 4.0,
            disk_usage_percent: 50.0,
        }
    }

    #[test]
    fn test_grant_reserves_lowest_indices_and_marks_busy() {
        let (registry, _, engine) = engine();
        let node = ready_node(&registry, "node-a", 8, 80);

        let receipt = engine
            .allocate(&AllocationRequest::new("train-llm", 3, 40))
            .unwrap();

        assert_eq!(receipt.node_id, node);
        assert_eq!(receipt.hostname, "node-a");
        assert_eq!(receipt.gpu_indices, vec![0, 1, 2]);
        assert_eq!(registry.get(node).unwrap().state, NodeState::Busy);

        let second = engine
            .allocate(&AllocationRequest::new("eval", 2, 40))
            .unwrap();
        assert_eq!(second.gpu_indices, vec![3, 4]);
    }

    #[test]
    fn test_lease_expiration_uses_ttl() {
        let registry = NodeRegistry::new();
        ready_node(&registry, "node-a", 2, 80);
        let engine = AllocationEngine::new(
            registry,
            HealthMonitor::default(),
            AllocationConfig {
                default_lease_ttl: Duration::from_secs(600),
            },
        );

        let now = Utc::now();
        let receipt = engine
            .allocate_at(&AllocationRequest::new("job", 1, 0), now)
            .unwrap();
        assert_eq!(receipt.lease_expiration, now + chrono::Duration::seconds(600));
    }

    #[test]
    fn test_unrepresentable_expiration_rejected() {
        let registry = NodeRegistry::new();
        let node = ready_node(&registry, "node-a", 2, 80);
        let engine = AllocationEngine::new(
            registry.clone(),
            HealthMonitor::default(),
            AllocationConfig {
                default_lease_ttl: Duration::from_secs(9_000_000_000_000),
            },
        );

        let err = engine
            .allocate_at(&AllocationRequest::new("job", 1, 0), Utc::now())
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidRequest(_)));

        // Nothing was reserved and the lock is free
        assert_eq!(registry.gpu_usage(node).unwrap().free.len(), 2);
        assert_eq!(registry.get(node).unwrap().state, NodeState::Ready);
    }

    #[test]
    fn test_prefers_most_free_units() {
        let (registry, _, engine) = engine();
        let small = ready_node(&registry, "node-small", 4, 80);
        let large = ready_node(&registry, "node-large", 8, 80);

        let receipt = engine.allocate(&AllocationRequest::new("job", 2, 0)).unwrap();
        assert_eq!(receipt.node_id, large);

        // 6 free on large vs 4 on small: still large
        let receipt = engine.allocate(&AllocationRequest::new("job", 2, 0)).unwrap();
        assert_eq!(receipt.node_id, large);

        // 4 free on each: lowest node id wins
        let receipt = engine.allocate(&AllocationRequest::new("job", 1, 0)).unwrap();
        assert_eq!(receipt.node_id, small.min(large));
    }

    #[test]
    fn test_vram_floor_filters_nodes() {
        let (registry, _, engine) = engine();
        ready_node(&registry, "node-a100", 8, 40);
        let h100 = ready_node(&registry, "node-h100", 2, 80);

        let receipt = engine.allocate(&AllocationRequest::new("job", 2, 80)).unwrap();
        assert_eq!(receipt.node_id, h100);

        let err = engine.allocate(&AllocationRequest::new("job", 1, 80)).unwrap_err();
        assert!(matches!(
            err,
            FleetError::InsufficientCapacity { requested: 1, min_vram_gb: 80, largest_free: 0 }
        ));
    }

    #[test]
    fn test_requests_never_span_nodes() {
        let (registry, _, engine) = engine();
        ready_node(&registry, "node-a", 4, 80);
        ready_node(&registry, "node-b", 4, 80);

        let err = engine.allocate(&AllocationRequest::new("job", 6, 0)).unwrap_err();
        assert!(matches!(
            err,
            FleetError::InsufficientCapacity { largest_free: 4, .. }
        ));
        assert!(engine.list().is_empty());
    }

    #[test]
    fn test_non_allocatable_states_skipped() {
        let (registry, _, engine) = engine();
        let node = ready_node(&registry, "node-a", 4, 80);
        registry.transition(node, NodeState::Maintenance).unwrap();

        assert!(engine.allocate(&AllocationRequest::new("job", 1, 0)).is_err());
    }

    #[test]
    fn test_malformed_requests_rejected() {
        let (registry, _, engine) = engine();
        ready_node(&registry, "node-a", 4, 80);

        let err = engine.allocate(&AllocationRequest::new("", 1, 0)).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        let err = engine.allocate(&AllocationRequest::new("job", 0, 0)).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[test]
    fn test_unhealthy_nodes_excluded() {
        let (registry, monitor, engine) = engine();
        let hot = ready_node(&registry, "node-hot", 8, 80);
        let cool = ready_node(&registry, "node-cool", 2, 80);

        monitor.observe_sample(hot, "node-hot", &hot_sample(8));

        let receipt = engine.allocate(&AllocationRequest::new("job", 1, 0)).unwrap();
        assert_eq!(receipt.node_id, cool);
        assert!(engine.allocate(&AllocationRequest::new("job", 4, 0)).is_err());
    }

    #[test]
    fn test_release_restores_free_units() {
        let (registry, _, engine) = engine();
        let node = ready_node(&registry, "node-a", 8, 80);
        let before = registry.gpu_usage(node).unwrap();

        let receipt = engine.allocate(&AllocationRequest::new("job", 5, 0)).unwrap();
        assert_eq!(registry.gpu_usage(node).unwrap().free.len(), 3);

        let released = engine.release(receipt.allocation_id).unwrap();
        assert_eq!(released.gpu_indices, receipt.gpu_indices);
        assert_eq!(registry.gpu_usage(node).unwrap(), before);
        assert_eq!(registry.get(node).unwrap().state, NodeState::Ready);

        let err = engine.release(receipt.allocation_id).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_busy_until_last_release() {
        let (registry, _, engine) = engine();
        let node = ready_node(&registry, "node-a", 4, 80);

        let a = engine.allocate(&AllocationRequest::new("a", 1, 0)).unwrap();
        let b = engine.allocate(&AllocationRequest::new("b", 1, 0)).unwrap();

        engine.release(a.allocation_id).unwrap();
        assert_eq!(registry.get(node).unwrap().state, NodeState::Busy);
        engine.release(b.allocation_id).unwrap();
        assert_eq!(registry.get(node).unwrap().state, NodeState::Ready);
    }

    #[test]
    fn test_expire_sweep_is_idempotent() {
        let (registry, monitor, engine) = engine();
        let node = ready_node(&registry, "node-a", 4, 80);
        let granted_at = Utc::now() - chrono::Duration::hours(2);

        engine
            .allocate_at(&AllocationRequest::new("job", 2, 0), granted_at)
            .unwrap();
        assert_eq!(registry.get(node).unwrap().state, NodeState::Busy);

        let now = Utc::now();
        assert_eq!(engine.expire_sweep(now), 1);
        assert_eq!(registry.get(node).unwrap().state, NodeState::Ready);
        assert_eq!(registry.gpu_usage(node).unwrap().free.len(), 4);

        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Info);
        assert!(alerts[0].message.contains("expired"));

        assert_eq!(engine.expire_sweep(now), 0);
        assert_eq!(monitor.alerts().len(), 1);
    }

    #[test]
    fn test_expire_sweep_keeps_live_leases() {
        let (registry, _, engine) = engine();
        ready_node(&registry, "node-a", 4, 80);

        let live = engine.allocate(&AllocationRequest::new("live", 1, 0)).unwrap();
        engine
            .allocate_at(
                &AllocationRequest::new("stale", 1, 0),
                Utc::now() - chrono::Duration::hours(2),
            )
            .unwrap();

        assert_eq!(engine.expire_sweep(Utc::now()), 1);
        let remaining = engine.list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, live.allocation_id);
    }

    #[test]
    fn test_concurrent_allocations_never_share_units() {
        let (registry, _, engine) = engine();
        for i in 0..4 {
            ready_node(&registry, &format!("node-{}", i), 8, 80);
        }
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..16)
            .map(|t| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    (0..4)
                        .filter_map(|i| {
                            engine
                                .allocate(&AllocationRequest::new(format!("job-{}-{}", t, i), 1, 0))
                                .ok()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let receipts: Vec<AllocationReceipt> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        // 64 requests for 32 units: exactly 32 granted
        assert_eq!(receipts.len(), 32);

        let mut seen = HashSet::new();
        for receipt in &receipts {
            for idx in &receipt.gpu_indices {
                assert!(*idx < 8);
                assert!(seen.insert((receipt.node_id, *idx)), "unit granted twice");
            }
        }
    }

    #[tokio::test]
    async fn test_events_published() {
        let (registry, _, engine) = engine();
        ready_node(&registry, "node-a", 2, 80);
        let mut events = engine.subscribe();

        let receipt = engine.allocate(&AllocationRequest::new("job", 1, 0)).unwrap();
        engine.release(receipt.allocation_id).unwrap();

        match events.recv().await.unwrap() {
            AllocationEvent::Granted { node_became_busy, receipt: r, .. } => {
                assert!(node_became_busy);
                assert_eq!(r.allocation_id, receipt.allocation_id);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await.unwrap() {
            AllocationEvent::Released { reason, node_became_ready, .. } => {
                assert_eq!(reason, ReleaseReason::Released);
                assert!(node_became_ready);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_loop_reclaims_and_stops() {
        let (registry, _, engine) = engine();
        let node = ready_node(&registry, "node-a", 2, 80);
        engine
            .allocate_at(
                &AllocationRequest::new("job", 2, 0),
                Utc::now() - chrono::Duration::hours(2),
            )
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(
            engine
                .clone()
                .run_expiry_loop(Duration::from_secs(5), shutdown_rx),
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(engine.list().is_empty());
        assert_eq!(registry.get(node).unwrap().state, NodeState::Ready);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
