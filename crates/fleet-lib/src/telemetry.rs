//! Per-node telemetry windows and summaries
//!
//! Each node gets a fixed-capacity ring buffer of its most recent samples.
//! Windows are sharded in a `DashMap`, so ingestion for one node never waits
//! on another node's window and only holds the inventory read lock long
//! enough to validate identity and append.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::health::HealthMonitor;
use crate::models::{NodeId, TelemetrySample};
use crate::observability::FleetMetrics;
use crate::registry::NodeRegistry;

/// Default samples retained per node
pub const DEFAULT_WINDOW_CAPACITY: usize = 20;

/// Telemetry aggregator configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Samples retained per node before the oldest is evicted
    pub window_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
        }
    }
}

/// Ring buffer of recent samples for one node
#[derive(Debug, Clone)]
pub struct TelemetryWindow {
    samples: VecDeque<TelemetrySample>,
    capacity: usize,
}

impl TelemetryWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append in arrival order, evicting the oldest on overflow
    pub fn push(&mut self, sample: TelemetrySample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn summarize(&self, node_id: NodeId) -> Option<NodeSummary> {
        let latest = self.samples.back()?;

        let mut temp_sum = 0.0;
        let mut temp_max: Option<f64> = None;
        let mut util_sum = 0.0;
        let mut mem_sum = 0.0;
        let mut power_sum = 0.0;
        let mut gpu_points = 0usize;

        for metric in self.samples.iter().flat_map(|s| s.gpu_metrics.iter()) {
            temp_sum += metric.temperature_celsius;
            temp_max = Some(temp_max.map_or(metric.temperature_celsius, |m| {
                m.max(metric.temperature_celsius)
            }));
            util_sum += metric.gpu_utilization_percent;
            mem_sum += metric.memory_utilization_percent;
            power_sum += metric.power_draw_watts;
            gpu_points += 1;
        }

        let mean = |sum: f64| {
            if gpu_points == 0 {
                0.0
            } else {
                sum / gpu_points as f64
            }
        };

        // Timestamps may arrive out of order; report the newest seen
        let last_sample_at = self
            .samples
            .iter()
            .map(|s| s.timestamp)
            .max()
            .unwrap_or(latest.timestamp);

        Some(NodeSummary {
            node_id,
            sample_count: self.samples.len(),
            max_temperature_celsius: temp_max.unwrap_or(0.0),
            mean_temperature_celsius: mean(temp_sum),
            mean_gpu_utilization_percent: mean(util_sum),
            mean_memory_utilization_percent: mean(mem_sum),
            mean_power_draw_watts: mean(power_sum),
            latest_system_load: latest.system_load,
            latest_disk_usage_percent: latest.disk_usage_percent,
            last_sample_at,
        })
    }
}

/// Derived statistics over one node's window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: NodeId,
    pub sample_count: usize,
    pub max_temperature_celsius: f64,
    pub mean_temperature_celsius: f64,
    pub mean_gpu_utilization_percent: f64,
    pub mean_memory_utilization_percent: f64,
    pub mean_power_draw_watts: f64,
    pub latest_system_load: f64,
    pub latest_disk_usage_percent: f64,
    pub last_sample_at: DateTime<Utc>,
}

/// Cluster-wide aggregation over `Ready` and `Busy` nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    /// Nodes in a state that counts towards utilization
    pub nodes_considered: usize,
    /// Of those, nodes with at least one sample in their window
    pub nodes_reporting: usize,
    pub mean_gpu_utilization_percent: f64,
    pub mean_memory_utilization_percent: f64,
    pub max_temperature_celsius: Option<f64>,
}

/// Ingests samples and derives summaries
#[derive(Clone)]
pub struct TelemetryAggregator {
    registry: NodeRegistry,
    monitor: HealthMonitor,
    windows: Arc<DashMap<NodeId, TelemetryWindow>>,
    config: TelemetryConfig,
    metrics: FleetMetrics,
}

impl TelemetryAggregator {
    pub fn new(registry: NodeRegistry, monitor: HealthMonitor, config: TelemetryConfig) -> Self {
        Self {
            registry,
            monitor,
            windows: Arc::new(DashMap::new()),
            config,
            metrics: FleetMetrics::new(),
        }
    }

    /// Accept a sample for a registered node.
    ///
    /// Samples for nodes absent from the registry are dropped with
    /// `UnknownNode`; telemetry never creates nodes.
    pub fn ingest(&self, node_id: NodeId, sample: TelemetrySample) -> Result<()> {
        let hostname = {
            let inventory = self.registry.read();
            let entry = match inventory.entry(node_id) {
                Ok(entry) => entry,
                Err(_) => {
                    self.metrics.inc_telemetry_rejected();
                    debug!(node_id = %node_id, "Dropping telemetry for unknown node");
                    return Err(FleetError::UnknownNode(node_id));
                }
            };

            let gpu_count = entry.node.hardware.gpu_count;
            if let Some(bad) = sample.gpu_metrics.iter().find(|m| m.index >= gpu_count) {
                self.metrics.inc_telemetry_rejected();
                return Err(FleetError::InvalidRequest(format!(
                    "GPU index {} out of range for node {} with {} GPU(s)",
                    bad.index, node_id, gpu_count
                )));
            }

            // Append under the read lock so removal cannot interleave
            self.windows
                .entry(node_id)
                .or_insert_with(|| TelemetryWindow::new(self.config.window_capacity))
                .push(sample.clone());

            entry.node.hostname.clone()
        };

        self.metrics.inc_telemetry_ingested();
        self.monitor.observe_sample(node_id, &hostname, &sample);
        Ok(())
    }

    /// Summary of one node's window; `NotFound` if it never reported
    pub fn summary(&self, node_id: NodeId) -> Result<NodeSummary> {
        if !self.registry.contains(node_id) {
            return Err(FleetError::node_not_found(node_id));
        }

        self.windows
            .get(&node_id)
            .and_then(|window| window.summarize(node_id))
            .ok_or_else(|| FleetError::NotFound {
                kind: "telemetry for node",
                id: node_id.to_string(),
            })
    }

    /// Aggregate over nodes currently `Ready` or `Busy`.
    ///
    /// Nodes in any other state are excluded even if their window still
    /// holds samples.
    pub fn cluster_summary(&self) -> ClusterSummary {
        let considered: Vec<NodeId> = self
            .registry
            .list()
            .into_iter()
            .filter(|node| node.state.is_allocatable())
            .map(|node| node.id)
            .collect();

        let summaries: Vec<NodeSummary> = considered
            .iter()
            .filter_map(|id| self.windows.get(id).and_then(|w| w.summarize(*id)))
            .collect();

        if summaries.is_empty() {
            return ClusterSummary {
                nodes_considered: considered.len(),
                ..Default::default()
            };
        }

        let count = summaries.len() as f64;
        ClusterSummary {
            nodes_considered: considered.len(),
            nodes_reporting: summaries.len(),
            mean_gpu_utilization_percent: summaries
                .iter()
                .map(|s| s.mean_gpu_utilization_percent)
                .sum::<f64>()
                / count,
            mean_memory_utilization_percent: summaries
                .iter()
                .map(|s| s.mean_memory_utilization_percent)
                .sum::<f64>()
                / count,
            max_temperature_celsius: summaries
                .iter()
                .map(|s| s.max_temperature_celsius)
                .reduce(f64::max),
        }
    }

    /// Samples currently held for a node
    pub fn window_len(&self, node_id: NodeId) -> usize {
        self.windows.get(&node_id).map(|w| w.len()).unwrap_or(0)
    }

    /// Discard the window of a node that left the registry
    pub fn forget(&self, node_id: NodeId) {
        self.windows.remove(&node_id);
    }
}

impl std::fmt::Debug for TelemetryAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryAggregator")
            .field("config", &self.config)
            .field("windows", &self.windows.len())
            .finish()
    }
}
