//! GPU fleet control plane library
//!
//! This crate provides the core functionality for:
//! - Node inventory and GPU reservation tracking
//! - The node lifecycle state machine and provisioning
//! - Single-node GPU allocation with time-bounded leases
//! - Rolling per-node telemetry windows
//! - Cluster health derivation and alerting
//! - Prometheus metrics and structured logging

pub mod allocation;
pub mod cluster;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod registry;
pub mod telemetry;

pub use allocation::{AllocationConfig, AllocationEngine, AllocationEvent, ReleaseReason};
pub use cluster::{Cluster, ClusterConfig};
pub use error::{FleetError, Result};
pub use health::{Alert, AlertSeverity, ClusterHealthReport, HealthConfig, HealthMonitor, HealthStatus};
pub use lifecycle::{
    DecommissionTicket, DrainReport, LifecycleConfig, LifecycleController, NodeState,
    ProvisionRequest, Provisioner, SimulatedProvisioner,
};
pub use models::*;
pub use observability::{FleetMetrics, StructuredLogger};
pub use registry::{GpuUsage, NodeRegistry, NodeUsage};
pub use telemetry::{ClusterSummary, NodeSummary, TelemetryAggregator, TelemetryConfig};
