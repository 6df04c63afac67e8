//! Provisioning collaborator
//!
//! The cloud provider is opaque: a provision call hands back a
//! [`ProvisionHandle`] that resolves to exactly one terminal
//! [`ProvisionOutcome`]. Dropping the sending side counts as failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::models::{HardwareSpec, NodeId, NodeSpec};

/// Delay used by the simulated provider before reporting success
pub const DEFAULT_SIMULATED_DELAY: Duration = Duration::from_secs(5);

/// Operator request to bring up a new node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub hostname: String,
    pub address: IpAddr,
    pub instance_type: String,
    pub gpu_count: u32,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Overrides the instance type catalog when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareSpec>,
}

impl ProvisionRequest {
    pub fn new(
        hostname: impl Into<String>,
        address: IpAddr,
        instance_type: impl Into<String>,
        gpu_count: u32,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            address,
            instance_type: instance_type.into(),
            gpu_count,
            region: None,
            tags: Vec::new(),
            hardware: None,
        }
    }

    /// Registry descriptor for the node this request will create
    pub fn to_node_spec(&self) -> NodeSpec {
        let hardware = self.hardware.clone().unwrap_or_else(|| {
            HardwareSpec::for_instance_type(&self.instance_type, self.gpu_count)
        });

        NodeSpec {
            hostname: self.hostname.clone(),
            address: self.address,
            hardware,
            region: self.region.clone(),
            instance_type: Some(self.instance_type.clone()),
            tags: self.tags.clone(),
        }
    }
}

/// Terminal signal from the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Succeeded(NodeId),
    Failed(String),
}

/// Receiving side of a provisioning operation
#[derive(Debug)]
pub struct ProvisionHandle {
    rx: oneshot::Receiver<ProvisionOutcome>,
}

impl ProvisionHandle {
    /// New handle plus the sender the provider completes it with
    pub fn channel() -> (oneshot::Sender<ProvisionOutcome>, ProvisionHandle) {
        let (tx, rx) = oneshot::channel();
        (tx, ProvisionHandle { rx })
    }

    /// Wait for the terminal signal
    pub async fn wait(self) -> ProvisionOutcome {
        self.rx.await.unwrap_or_else(|_| {
            ProvisionOutcome::Failed("provisioner dropped the operation".to_string())
        })
    }
}

/// Cloud provisioning API as seen by the lifecycle controller
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start bringing up `node_id`; completion arrives on the handle
    async fn begin_provision(&self, node_id: NodeId, request: &ProvisionRequest)
        -> ProvisionHandle;
}

/// Provider stand-in: reports a fixed outcome after a fixed delay
#[derive(Debug, Clone)]
pub struct SimulatedProvisioner {
    delay: Duration,
    failure: Option<String>,
}

impl Default for SimulatedProvisioner {
    fn default() -> Self {
        Self::new(DEFAULT_SIMULATED_DELAY)
    }
}

impl SimulatedProvisioner {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failure: None,
        }
    }

    /// Every provision fails with `reason`
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }
}

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    async fn begin_provision(
        &self,
        node_id: NodeId,
        request: &ProvisionRequest,
    ) -> ProvisionHandle {
        let (tx, handle) = ProvisionHandle::channel();
        let delay = self.delay;
        let outcome = match &self.failure {
            Some(reason) => ProvisionOutcome::Failed(reason.clone()),
            None => ProvisionOutcome::Succeeded(node_id),
        };

        debug!(
            node_id = %node_id,
            hostname = %request.hostname,
            instance_type = %request.instance_type,
            delay_ms = delay.as_millis() as u64,
            "Simulated provisioning started"
        );

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the controller already gave up
            let _ = tx.send(outcome);
        });

        handle
    }
}
