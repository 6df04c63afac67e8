//! Daemon configuration

use anyhow::{Context, Result};
use fleet_lib::{
    AllocationConfig, ClusterConfig, HealthConfig, LifecycleConfig, TelemetryConfig,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Daemon configuration, read from `FLEET_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Name used to tag structured log lines
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Lifetime of every GPU lease
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Period of the lease expiry sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Period of the health report log line and gauge refresh
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Telemetry samples retained per node
    #[serde(default = "default_telemetry_window")]
    pub telemetry_window: usize,

    /// Alerts retained in the log
    #[serde(default = "default_alert_log_capacity")]
    pub alert_log_capacity: usize,

    /// GPU temperature that opens a thermal breach
    #[serde(default = "default_thermal_threshold")]
    pub thermal_threshold_celsius: f64,

    /// Delay of the simulated provisioner
    #[serde(default = "default_provision_delay")]
    pub provision_delay_secs: u64,

    /// Provisioning operations still pending after this fail
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_secs: u64,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "fleetd".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_lease_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_health_interval() -> u64 {
    30
}

fn default_telemetry_window() -> usize {
    20
}

fn default_alert_log_capacity() -> usize {
    100
}

fn default_thermal_threshold() -> f64 {
    75.0
}

fn default_provision_delay() -> u64 {
    5
}

fn default_provision_timeout() -> u64 {
    300
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            lease_ttl_secs: default_lease_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            health_interval_secs: default_health_interval(),
            telemetry_window: default_telemetry_window(),
            alert_log_capacity: default_alert_log_capacity(),
            thermal_threshold_celsius: default_thermal_threshold(),
            provision_delay_secs: default_provision_delay(),
            provision_timeout_secs: default_provision_timeout(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("FLEET").try_parsing(true))
            .build()
            .context("Failed to read FLEET_* environment")?;

        Ok(config.try_deserialize().unwrap_or_else(|err| {
            warn!(error = %err, "Invalid controller configuration, using defaults");
            ControllerConfig::default()
        }))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn provision_delay(&self) -> Duration {
        Duration::from_secs(self.provision_delay_secs)
    }

    /// Per-component library configuration
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            allocation: AllocationConfig {
                default_lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            },
            telemetry: TelemetryConfig {
                window_capacity: self.telemetry_window,
            },
            health: HealthConfig {
                alert_log_capacity: self.alert_log_capacity,
                thermal_threshold_celsius: self.thermal_threshold_celsius,
                ..Default::default()
            },
            lifecycle: LifecycleConfig {
                provision_timeout: Duration::from_secs(self.provision_timeout_secs),
            },
        }
    }
}
