//! Core data models for the fleet control plane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

use crate::lifecycle::NodeState;

/// Opaque node identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque allocation (lease) identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(Uuid);

impl AllocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AllocationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Hardware descriptor of a node, immutable after registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub gpu_model: String,
    pub gpu_count: u32,
    pub vram_per_gpu_gb: u32,
    pub cuda_version: String,
    pub driver_version: String,
}

impl HardwareSpec {
    /// Hardware catalog for the supported cloud instance families.
    ///
    /// `p5` instances carry H100s; every other family is treated as an
    /// A100 host.
    pub fn for_instance_type(instance_type: &str, gpu_count: u32) -> Self {
        let (gpu_model, vram_per_gpu_gb) = if instance_type.starts_with("p5") {
            ("NVIDIA H100", 80)
        } else {
            ("NVIDIA A100", 40)
        };

        Self {
            gpu_model: gpu_model.to_string(),
            gpu_count,
            vram_per_gpu_gb,
            cuda_version: "12.2".to_string(),
            driver_version: "535.104.05".to_string(),
        }
    }
}

/// Everything needed to register a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub hostname: String,
    pub address: IpAddr,
    pub hardware: HardwareSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A GPU host known to the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
    pub address: IpAddr,
    pub state: NodeState,
    pub hardware: HardwareSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub(crate) fn from_spec(id: NodeId, spec: NodeSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            hostname: spec.hostname,
            address: spec.address,
            state: NodeState::Initializing,
            hardware: spec.hardware,
            region: spec.region,
            instance_type: spec.instance_type,
            tags: spec.tags,
            created_at,
        }
    }
}

/// Job priority carried on allocation requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// GPU resource request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub job_id: String,
    pub gpu_count: u32,
    #[serde(default)]
    pub min_vram_gb: u32,
    #[serde(default)]
    pub priority: Priority,
}

impl AllocationRequest {
    pub fn new(job_id: impl Into<String>, gpu_count: u32, min_vram_gb: u32) -> Self {
        Self {
            job_id: job_id.into(),
            gpu_count,
            min_vram_gb,
            priority: Priority::Normal,
        }
    }
}

/// An active lease of GPU units on one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub job_id: String,
    pub priority: Priority,
    pub node_id: NodeId,
    pub gpu_indices: Vec<u32>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Allocation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Receipt returned to the requester on grant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationReceipt {
    pub allocation_id: AllocationId,
    pub node_id: NodeId,
    pub hostname: String,
    pub gpu_indices: Vec<u32>,
    pub lease_expiration: DateTime<Utc>,
}

/// Per-GPU metrics inside a telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuMetric {
    pub index: u32,
    pub temperature_celsius: f64,
    pub power_draw_watts: f64,
    pub fan_speed_percent: f64,
    pub gpu_utilization_percent: f64,
    pub memory_utilization_percent: f64,
}

/// One telemetry snapshot for a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub gpu_metrics: Vec<GpuMetric>,
    pub system_load: f64,
    pub disk_usage_percent: f64,
}

impl TelemetrySample {
    /// Hottest GPU in this sample, if any GPU reported
    pub fn max_temperature(&self) -> Option<(u32, f64)> {
        self.gpu_metrics
            .iter()
            .map(|m| (m.index, m.temperature_celsius))
            .fold(None, |acc, (idx, temp)| match acc {
                Some((_, best)) if best >= temp => acc,
                _ => Some((idx, temp)),
            })
    }
}
