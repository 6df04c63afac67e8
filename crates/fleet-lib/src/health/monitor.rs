//! Cluster health derivation and alert intake
//!
//! The monitor owns the alert log and the per-node thermal breach state.
//! Everything else in a [`ClusterHealthReport`] is computed on demand from
//! inventory and telemetry snapshots handed in by the caller.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::alerts::{Alert, AlertLog, AlertSeverity, DEFAULT_ALERT_LOG_CAPACITY};
use crate::models::{NodeId, TelemetrySample};
use crate::observability::FleetMetrics;
use crate::registry::NodeUsage;
use crate::telemetry::ClusterSummary;

/// Default GPU temperature above which a node is considered overheating
pub const DEFAULT_THERMAL_THRESHOLD_CELSIUS: f64 = 75.0;

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Maximum number of alerts retained
    pub alert_log_capacity: usize,
    /// GPU temperature that opens a thermal breach episode
    pub thermal_threshold_celsius: f64,
    /// Whether nodes inside a breach episode are withheld from allocation
    pub exclude_unhealthy_nodes: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            alert_log_capacity: DEFAULT_ALERT_LOG_CAPACITY,
            thermal_threshold_celsius: DEFAULT_THERMAL_THRESHOLD_CELSIUS,
            exclude_unhealthy_nodes: true,
        }
    }
}

/// Overall cluster status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    /// Compute overall status from alert severities
    pub fn compute_status<'a>(alerts: impl IntoIterator<Item = &'a Alert>) -> HealthStatus {
        let mut has_degraded = false;

        for alert in alerts {
            match alert.severity {
                AlertSeverity::Critical => return HealthStatus::Critical,
                AlertSeverity::Warning | AlertSeverity::Error => has_degraded = true,
                AlertSeverity::Info => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Derived cluster snapshot for the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealthReport {
    pub status: HealthStatus,
    pub total_nodes: usize,
    pub available_nodes: usize,
    pub total_gpus: u32,
    pub available_gpus: u32,
    pub allocated_gpus: u32,
    pub utilization_percentage: f64,
    pub active_alerts: Vec<Alert>,
    pub generated_at: DateTime<Utc>,
}

/// An open thermal breach episode on one node
#[derive(Debug, Clone)]
struct ThermalBreach {
    gpu_index: u32,
    peak_celsius: f64,
    since: DateTime<Utc>,
}

/// Alert intake plus health derivation, cheap to clone
#[derive(Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    alerts: Arc<RwLock<AlertLog>>,
    breaches: Arc<Mutex<HashMap<NodeId, ThermalBreach>>>,
    metrics: FleetMetrics,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            alerts: Arc::new(RwLock::new(AlertLog::new(config.alert_log_capacity))),
            breaches: Arc::new(Mutex::new(HashMap::new())),
            config,
            metrics: FleetMetrics::new(),
        }
    }

    /// Append an alert. Single entry point for operator-visible events.
    pub fn raise(
        &self,
        severity: AlertSeverity,
        component: &str,
        message: impl Into<String>,
    ) -> Alert {
        self.append(severity, component, message.into(), None)
    }

    /// Append an alert tied to a specific node
    pub fn raise_for_node(
        &self,
        node_id: NodeId,
        severity: AlertSeverity,
        component: &str,
        message: impl Into<String>,
    ) -> Alert {
        self.append(severity, component, message.into(), Some(node_id))
    }

    fn append(
        &self,
        severity: AlertSeverity,
        component: &str,
        message: String,
        node_id: Option<NodeId>,
    ) -> Alert {
        let alert = self.alerts.write().push(severity, component, message, node_id);
        self.metrics.inc_alerts(severity);

        match severity {
            AlertSeverity::Info => info!(
                event = "alert_raised",
                severity = %severity,
                component = %alert.component,
                sequence = alert.sequence,
                "{}", alert.message
            ),
            AlertSeverity::Warning => warn!(
                event = "alert_raised",
                severity = %severity,
                component = %alert.component,
                sequence = alert.sequence,
                "{}", alert.message
            ),
            AlertSeverity::Error | AlertSeverity::Critical => error!(
                event = "alert_raised",
                severity = %severity,
                component = %alert.component,
                sequence = alert.sequence,
                "{}", alert.message
            ),
        }

        alert
    }

    /// All retained alerts, newest first
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().all()
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts.read().recent(limit)
    }

    /// Feed one accepted telemetry sample through thermal breach detection.
    ///
    /// Edge-triggered per node: the first over-threshold sample opens an
    /// episode and raises a warning, later hot samples are absorbed, and a
    /// sample with every GPU at or below threshold closes the episode.
    pub fn observe_sample(
        &self,
        node_id: NodeId,
        hostname: &str,
        sample: &TelemetrySample,
    ) -> Option<Alert> {
        let threshold = self.config.thermal_threshold_celsius;
        let hottest = sample
            .max_temperature()
            .filter(|(_, temp)| *temp > threshold);

        let opened = {
            let mut breaches = self.breaches.lock();
            match hottest {
                Some((gpu_index, temp)) => match breaches.get_mut(&node_id) {
                    Some(open) => {
                        open.peak_celsius = open.peak_celsius.max(temp);
                        None
                    }
                    None => {
                        breaches.insert(
                            node_id,
                            ThermalBreach {
                                gpu_index,
                                peak_celsius: temp,
                                since: sample.timestamp,
                            },
                        );
                        Some((gpu_index, temp))
                    }
                },
                None => {
                    if let Some(closed) = breaches.remove(&node_id) {
                        debug!(
                            node_id = %node_id,
                            gpu_index = closed.gpu_index,
                            peak_celsius = closed.peak_celsius,
                            since = %closed.since,
                            "Thermal breach episode closed"
                        );
                    }
                    None
                }
            }
        };

        opened.map(|(gpu_index, temp)| {
            self.raise_for_node(
                node_id,
                AlertSeverity::Warning,
                hostname,
                format!(
                    "High temperature detected on GPU {} ({:.0}°C)",
                    gpu_index, temp
                ),
            )
        })
    }

    /// True while the node has an open thermal breach episode
    pub fn is_unhealthy(&self, node_id: NodeId) -> bool {
        self.breaches.lock().contains_key(&node_id)
    }

    /// Nodes the allocation engine must skip
    pub fn excluded_nodes(&self) -> HashSet<NodeId> {
        if !self.config.exclude_unhealthy_nodes {
            return HashSet::new();
        }
        self.breaches.lock().keys().copied().collect()
    }

    /// Drop per-node state for a node that left the registry
    pub fn forget(&self, node_id: NodeId) {
        self.breaches.lock().remove(&node_id);
    }

    /// Derive the cluster health report from the given snapshots
    pub fn evaluate(&self, nodes: &[NodeUsage], summary: &ClusterSummary) -> ClusterHealthReport {
        let active_alerts = self.alerts();
        let status = HealthStatus::compute_status(&active_alerts);

        let available: Vec<&NodeUsage> = nodes
            .iter()
            .filter(|n| n.node.state.is_allocatable() && n.free_gpus > 0)
            .collect();

        ClusterHealthReport {
            status,
            total_nodes: nodes.len(),
            available_nodes: available.len(),
            total_gpus: nodes.iter().map(|n| n.node.hardware.gpu_count).sum(),
            available_gpus: available.iter().map(|n| n.free_gpus).sum(),
            allocated_gpus: nodes.iter().map(|n| n.leased_gpus).sum(),
            utilization_percentage: summary.mean_gpu_utilization_percent,
            active_alerts,
            generated_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("alerts", &self.alerts.read().len())
            .finish()
    }
}
