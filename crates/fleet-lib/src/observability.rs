//! Observability infrastructure for the control plane
//!
//! Provides:
//! - Prometheus metrics (inventory gauges, allocation outcomes, lease churn,
//!   telemetry intake, alerts by severity)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::allocation::ReleaseReason;
use crate::health::{AlertSeverity, ClusterHealthReport};
use crate::lifecycle::NodeState;
use crate::models::{Allocation, AllocationReceipt, NodeId};
use crate::registry::NodeUsage;

/// Histogram buckets for in-memory allocation decisions (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<FleetMetricsInner> = OnceLock::new();

struct FleetMetricsInner {
    nodes_by_state: IntGaugeVec,
    gpus_total: IntGauge,
    gpus_allocated: IntGauge,
    allocations_active: IntGauge,
    allocation_requests: IntCounterVec,
    allocation_latency_seconds: Histogram,
    leases_released: IntCounterVec,
    telemetry_samples_ingested: IntCounter,
    telemetry_samples_rejected: IntCounter,
    alerts_raised: IntCounterVec,
}

impl FleetMetricsInner {
    fn new() -> Self {
        Self {
            nodes_by_state: register_int_gauge_vec!(
                "fleet_nodes",
                "Number of registered nodes by lifecycle state",
                &["state"]
            )
            .expect("Failed to register fleet_nodes"),

            gpus_total: register_int_gauge!(
                "fleet_gpus_total",
                "GPU units across all registered nodes"
            )
            .expect("Failed to register fleet_gpus_total"),

            gpus_allocated: register_int_gauge!(
                "fleet_gpus_allocated",
                "GPU units currently held by active leases"
            )
            .expect("Failed to register fleet_gpus_allocated"),

            allocations_active: register_int_gauge!(
                "fleet_allocations_active",
                "Number of active GPU leases"
            )
            .expect("Failed to register fleet_allocations_active"),

            allocation_requests: register_int_counter_vec!(
                "fleet_allocation_requests_total",
                "Allocation requests by outcome",
                &["outcome"]
            )
            .expect("Failed to register fleet_allocation_requests_total"),

            allocation_latency_seconds: register_histogram!(
                "fleet_allocation_latency_seconds",
                "Time spent searching and reserving GPU units",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register fleet_allocation_latency_seconds"),

            leases_released: register_int_counter_vec!(
                "fleet_leases_released_total",
                "Leases terminated by reason",
                &["reason"]
            )
            .expect("Failed to register fleet_leases_released_total"),

            telemetry_samples_ingested: register_int_counter!(
                "fleet_telemetry_samples_ingested_total",
                "Telemetry samples accepted into node windows"
            )
            .expect("Failed to register fleet_telemetry_samples_ingested_total"),

            telemetry_samples_rejected: register_int_counter!(
                "fleet_telemetry_samples_rejected_total",
                "Telemetry samples discarded (unknown node or malformed)"
            )
            .expect("Failed to register fleet_telemetry_samples_rejected_total"),

            alerts_raised: register_int_counter_vec!(
                "fleet_alerts_raised_total",
                "Alerts appended to the alert log by severity",
                &["severity"]
            )
            .expect("Failed to register fleet_alerts_raised_total"),
        }
    }
}

/// Control plane metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct FleetMetrics {
    _private: (),
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &FleetMetricsInner {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new)
    }

    /// Refresh inventory gauges from a registry snapshot
    pub fn record_inventory(&self, nodes: &[NodeUsage]) {
        let inner = self.inner();
        for state in NodeState::ALL {
            let count = nodes.iter().filter(|n| n.node.state == state).count();
            inner
                .nodes_by_state
                .with_label_values(&[state.as_str()])
                .set(count as i64);
        }
        inner
            .gpus_total
            .set(nodes.iter().map(|n| n.node.hardware.gpu_count as i64).sum());
        inner
            .gpus_allocated
            .set(nodes.iter().map(|n| n.leased_gpus as i64).sum());
        inner
            .allocations_active
            .set(nodes.iter().map(|n| n.active_allocations as i64).sum());
    }

    pub fn inc_allocation_requests(&self, outcome: &str) {
        self.inner()
            .allocation_requests
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn observe_allocation_latency(&self, duration_secs: f64) {
        self.inner().allocation_latency_seconds.observe(duration_secs);
    }

    pub fn inc_leases_released(&self, reason: &str, count: u64) {
        self.inner()
            .leases_released
            .with_label_values(&[reason])
            .inc_by(count);
    }

    pub fn inc_telemetry_ingested(&self) {
        self.inner().telemetry_samples_ingested.inc();
    }

    pub fn inc_telemetry_rejected(&self) {
        self.inner().telemetry_samples_rejected.inc();
    }

    pub fn inc_alerts(&self, severity: AlertSeverity) {
        self.inner()
            .alerts_raised
            .with_label_values(&[&severity.to_string()])
            .inc();
    }
}

/// Structured logger for control plane events
///
/// Provides consistent JSON-formatted logging for lifecycle, allocation
/// and health events.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_provision_requested(&self, node_id: NodeId, hostname: &str, gpu_count: u32) {
        info!(
            event = "node_provision_requested",
            instance = %self.instance,
            node_id = %node_id,
            hostname = %hostname,
            gpu_count = gpu_count,
            "Provisioning node"
        );
    }

    pub fn log_provision_finished(&self, node_id: NodeId, success: bool, detail: &str) {
        if success {
            info!(
                event = "node_provisioned",
                instance = %self.instance,
                node_id = %node_id,
                "Node provisioned and ready"
            );
        } else {
            warn!(
                event = "node_provision_failed",
                instance = %self.instance,
                node_id = %node_id,
                reason = %detail,
                "Node provisioning failed, node marked offline"
            );
        }
    }

    pub fn log_transition(&self, node_id: NodeId, from: NodeState, to: NodeState, revoked: usize) {
        info!(
            event = "node_transition",
            instance = %self.instance,
            node_id = %node_id,
            from = %from,
            to = %to,
            revoked_allocations = revoked,
            "Node lifecycle transition"
        );
    }

    pub fn log_decommissioned(&self, node_id: NodeId, hostname: &str, gpus_recovered: u32) {
        info!(
            event = "node_decommissioned",
            instance = %self.instance,
            node_id = %node_id,
            hostname = %hostname,
            gpus_recovered = gpus_recovered,
            "Node decommissioned and removed from registry"
        );
    }

    pub fn log_allocation_granted(&self, job_id: &str, receipt: &AllocationReceipt) {
        info!(
            event = "allocation_granted",
            instance = %self.instance,
            allocation_id = %receipt.allocation_id,
            job_id = %job_id,
            node_id = %receipt.node_id,
            gpu_indices = ?receipt.gpu_indices,
            lease_expiration = %receipt.lease_expiration,
            "GPU allocation granted"
        );
    }

    pub fn log_allocation_released(&self, allocation: &Allocation, reason: ReleaseReason) {
        match reason {
            ReleaseReason::Released => info!(
                event = "allocation_released",
                instance = %self.instance,
                allocation_id = %allocation.id,
                job_id = %allocation.job_id,
                node_id = %allocation.node_id,
                gpus = allocation.gpu_indices.len(),
                "GPU lease released"
            ),
            ReleaseReason::Expired => info!(
                event = "lease_expired",
                instance = %self.instance,
                allocation_id = %allocation.id,
                job_id = %allocation.job_id,
                node_id = %allocation.node_id,
                gpus = allocation.gpu_indices.len(),
                expired_at = %allocation.expires_at,
                "GPU lease expired and reclaimed"
            ),
            ReleaseReason::Revoked => warn!(
                event = "allocation_revoked",
                instance = %self.instance,
                allocation_id = %allocation.id,
                job_id = %allocation.job_id,
                node_id = %allocation.node_id,
                gpus = allocation.gpu_indices.len(),
                "GPU lease revoked by node transition"
            ),
        }
    }

    pub fn log_drained(&self, node_id: NodeId, hostname: &str, revoked: usize) {
        info!(
            event = "node_drained",
            instance = %self.instance,
            node_id = %node_id,
            hostname = %hostname,
            revoked_allocations = revoked,
            "Node draining, allocations revoked"
        );
    }

    pub fn log_health(&self, report: &ClusterHealthReport) {
        info!(
            event = "cluster_health",
            instance = %self.instance,
            status = %report.status,
            total_nodes = report.total_nodes,
            available_nodes = report.available_nodes,
            total_gpus = report.total_gpus,
            available_gpus = report.available_gpus,
            utilization_percentage = report.utilization_percentage,
            "Cluster health evaluated"
        );
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "controller_started",
            instance = %self.instance,
            version = %version,
            "Fleet controller started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Fleet controller shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_metrics_creation() {
        let metrics = FleetMetrics::new();
        let again = FleetMetrics::new();

        metrics.inc_allocation_requests("granted");
        again.inc_allocation_requests("insufficient_capacity");
        metrics.observe_allocation_latency(0.0001);
        metrics.inc_leases_released("expired", 2);
        metrics.inc_telemetry_ingested();
        metrics.inc_alerts(AlertSeverity::Warning);
        metrics.record_inventory(&[]);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("fleetd-0");
        assert_eq!(logger.instance, "fleetd-0");
    }
}
