//! Cluster health and alerting
//!
//! This module provides:
//! - The bounded, append-only alert log
//! - Thermal breach detection over incoming telemetry
//! - Derivation of the cluster health report

mod alerts;
mod monitor;

pub use alerts::{components, Alert, AlertLog, AlertSeverity, DEFAULT_ALERT_LOG_CAPACITY};
pub use monitor::{
    ClusterHealthReport, HealthConfig, HealthMonitor, HealthStatus,
    DEFAULT_THERMAL_THRESHOLD_CELSIUS,
};
