//! Cluster facade
//!
//! Wires the registry, telemetry aggregator, health monitor, allocation
//! engine and lifecycle controller around one shared inventory.

use std::sync::Arc;

use crate::allocation::{AllocationConfig, AllocationEngine};
use crate::error::Result;
use crate::health::{Alert, ClusterHealthReport, HealthConfig, HealthMonitor};
use crate::lifecycle::{LifecycleConfig, LifecycleController, NodeState, Provisioner};
use crate::models::{Node, NodeId, TelemetrySample};
use crate::observability::FleetMetrics;
use crate::registry::NodeRegistry;
use crate::telemetry::{TelemetryAggregator, TelemetryConfig};

/// Configuration for every component
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub allocation: AllocationConfig,
    pub telemetry: TelemetryConfig,
    pub health: HealthConfig,
    pub lifecycle: LifecycleConfig,
}

/// The control plane, cheap to clone
#[derive(Clone, Debug)]
pub struct Cluster {
    registry: NodeRegistry,
    monitor: HealthMonitor,
    telemetry: TelemetryAggregator,
    allocator: AllocationEngine,
    lifecycle: LifecycleController,
}

impl Cluster {
    pub fn new(config: ClusterConfig, provisioner: Arc<dyn Provisioner>) -> Self {
        let registry = NodeRegistry::new();
        let monitor = HealthMonitor::new(config.health);
        let telemetry =
            TelemetryAggregator::new(registry.clone(), monitor.clone(), config.telemetry);
        let allocator = AllocationEngine::new(registry.clone(), monitor.clone(), config.allocation);
        let lifecycle = LifecycleController::new(
            registry.clone(),
            allocator.clone(),
            telemetry.clone(),
            monitor.clone(),
            provisioner,
            config.lifecycle,
        );

        Self {
            registry,
            monitor,
            telemetry,
            allocator,
            lifecycle,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn telemetry(&self) -> &TelemetryAggregator {
        &self.telemetry
    }

    pub fn allocator(&self) -> &AllocationEngine {
        &self.allocator
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    /// Nodes ordered by id, optionally filtered by state
    pub fn nodes(&self, state: Option<NodeState>) -> Vec<Node> {
        match state {
            Some(state) => self.registry.list_by_state(state),
            None => self.registry.list(),
        }
    }

    pub fn ingest(&self, node_id: NodeId, sample: TelemetrySample) -> Result<()> {
        self.telemetry.ingest(node_id, sample)
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.monitor.recent_alerts(limit)
    }

    /// Derive the health report from the current registry, telemetry and
    /// alert log. Also refreshes the inventory gauges.
    pub fn health_report(&self) -> ClusterHealthReport {
        let snapshot = self.registry.snapshot();
        let summary = self.telemetry.cluster_summary();
        FleetMetrics::new().record_inventory(&snapshot);
        self.monitor.evaluate(&snapshot, &summary)
    }
}
