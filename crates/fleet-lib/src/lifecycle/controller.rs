//! Lifecycle controller
//!
//! Drives operator-initiated node transitions and provisioning. Every state
//! change goes through the registry's transition table; this layer adds the
//! side effects: lease revocation events, alerts, telemetry and thermal
//! state cleanup, and structured logs.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::provisioner::{ProvisionOutcome, ProvisionRequest, Provisioner};
use super::state::NodeState;
use crate::allocation::{AllocationEngine, AllocationEvent};
use crate::error::{FleetError, Result};
use crate::health::{components, AlertSeverity, HealthMonitor};
use crate::models::{AllocationId, Node, NodeId};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::registry::NodeRegistry;
use crate::telemetry::TelemetryAggregator;

/// Default bound on how long a provisioning operation may take
pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(300);

/// Lifecycle controller configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Provisioning operations that have not reported by then fail
    pub provision_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
        }
    }
}

/// Result of draining a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainReport {
    pub node_id: NodeId,
    pub hostname: String,
    pub previous_state: NodeState,
    pub revoked_allocations: Vec<AllocationId>,
}

/// First half of the decommission handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecommissionTicket {
    pub node_id: NodeId,
    pub hostname: String,
    /// Must be presented back to confirm
    pub ticket: Uuid,
    /// Leases that confirming with `force` would revoke
    pub active_allocations: usize,
    pub issued_at: DateTime<Utc>,
}

/// Node lifecycle driver, cheap to clone
#[derive(Clone)]
pub struct LifecycleController {
    registry: NodeRegistry,
    allocator: AllocationEngine,
    telemetry: TelemetryAggregator,
    monitor: HealthMonitor,
    provisioner: Arc<dyn Provisioner>,
    config: LifecycleConfig,
    pending_decommissions: Arc<Mutex<HashMap<NodeId, Uuid>>>,
    logger: StructuredLogger,
    metrics: FleetMetrics,
}

impl LifecycleController {
    pub fn new(
        registry: NodeRegistry,
        allocator: AllocationEngine,
        telemetry: TelemetryAggregator,
        monitor: HealthMonitor,
        provisioner: Arc<dyn Provisioner>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            allocator,
            telemetry,
            monitor,
            provisioner,
            config,
            pending_decommissions: Arc::new(Mutex::new(HashMap::new())),
            logger: StructuredLogger::new("lifecycle"),
            metrics: FleetMetrics::new(),
        }
    }

    /// Register a node in `Initializing` and start provisioning it.
    ///
    /// Returns as soon as the node is registered. Completion is handled by a
    /// spawned task, so this must be awaited inside a Tokio runtime.
    pub async fn request_provision(&self, request: ProvisionRequest) -> Result<NodeId> {
        let node_id = self.registry.register(request.to_node_spec())?;
        let hostname = request.hostname.clone();

        self.monitor.raise_for_node(
            node_id,
            AlertSeverity::Info,
            components::PROVISIONER,
            format!("Spinning up new node: {}", hostname),
        );
        self.logger
            .log_provision_requested(node_id, &hostname, request.gpu_count);
        self.refresh_metrics();

        let controller = self.clone();
        tokio::spawn(async move {
            let timeout = controller.config.provision_timeout;
            let provisioner = controller.provisioner.clone();
            // The bound covers starting the operation as well as waiting on it
            let provisioning = async move {
                provisioner
                    .begin_provision(node_id, &request)
                    .await
                    .wait()
                    .await
            };
            let outcome = match tokio::time::timeout(timeout, provisioning).await {
                Ok(outcome) => outcome,
                Err(_) => ProvisionOutcome::Failed(format!(
                    "no response within {}s",
                    timeout.as_secs()
                )),
            };
            controller.complete_provision(node_id, &hostname, outcome);
        });

        Ok(node_id)
    }

    /// Apply a provisioning signal. Signals for nodes that are gone or no
    /// longer `Initializing` are ignored.
    fn complete_provision(&self, node_id: NodeId, hostname: &str, outcome: ProvisionOutcome) {
        let target = match &outcome {
            ProvisionOutcome::Succeeded(_) => NodeState::Ready,
            ProvisionOutcome::Failed(_) => NodeState::Offline,
        };

        let applied = {
            let mut inventory = self.registry.write();
            let initializing = matches!(
                inventory.entry(node_id),
                Ok(entry) if entry.node.state == NodeState::Initializing
            );
            initializing && inventory.transition(node_id, target).is_ok()
        };

        if !applied {
            debug!(
                node_id = %node_id,
                outcome = ?outcome,
                "Ignoring provisioning signal for node no longer initializing"
            );
            return;
        }

        match outcome {
            ProvisionOutcome::Succeeded(_) => {
                self.logger.log_provision_finished(node_id, true, "");
            }
            ProvisionOutcome::Failed(reason) => {
                self.monitor.raise_for_node(
                    node_id,
                    AlertSeverity::Critical,
                    components::PROVISIONER,
                    format!("Failed to provision node {}: {}", hostname, reason),
                );
                self.logger.log_provision_finished(node_id, false, &reason);
            }
        }
        self.refresh_metrics();
    }

    /// Move a node to `Draining`, revoking every lease on it
    pub fn drain(&self, node_id: NodeId) -> Result<DrainReport> {
        let hostname = self.registry.get(node_id)?.hostname;
        let outcome = self.registry.transition(node_id, NodeState::Draining)?;

        self.allocator.notify_revoked(&outcome.revoked);
        self.monitor.raise_for_node(
            node_id,
            AlertSeverity::Warning,
            components::LIFECYCLE,
            format!("Node {} is now draining for maintenance.", hostname),
        );
        self.logger
            .log_drained(node_id, &hostname, outcome.revoked.len());
        self.refresh_metrics();

        Ok(DrainReport {
            node_id,
            hostname,
            previous_state: outcome.previous,
            revoked_allocations: outcome.revoked.iter().map(|a| a.id).collect(),
        })
    }

    pub fn set_maintenance(&self, node_id: NodeId) -> Result<Node> {
        self.operator_transition(node_id, NodeState::Maintenance)
    }

    /// Return a node in `Maintenance` to service
    pub fn return_to_service(&self, node_id: NodeId) -> Result<Node> {
        self.operator_transition(node_id, NodeState::Ready)
    }

    /// Take a node out of service immediately, revoking its leases
    pub fn mark_offline(&self, node_id: NodeId) -> Result<Node> {
        let node = self.operator_transition(node_id, NodeState::Offline)?;
        self.monitor.raise_for_node(
            node_id,
            AlertSeverity::Warning,
            components::LIFECYCLE,
            format!("Node {} marked offline.", node.hostname),
        );
        Ok(node)
    }

    /// Transition on operator request. `Ready <-> Busy` is owned by the
    /// allocation engine and always refused here.
    fn operator_transition(&self, node_id: NodeId, to: NodeState) -> Result<Node> {
        let (outcome, node) = {
            let mut inventory = self.registry.write();
            let from = inventory.entry(node_id)?.node.state;
            if NodeState::is_automatic_edge(from, to) {
                return Err(FleetError::InvalidTransition { node_id, from, to });
            }
            let outcome = inventory.transition(node_id, to)?;
            let node = inventory.entry(node_id)?.node.clone();
            (outcome, node)
        };

        self.allocator.notify_revoked(&outcome.revoked);
        self.logger.log_transition(
            node_id,
            outcome.previous,
            outcome.current,
            outcome.revoked.len(),
        );
        self.refresh_metrics();
        Ok(node)
    }

    /// Start the decommission handshake. A new request replaces any earlier
    /// ticket for the node.
    pub fn request_decommission(&self, node_id: NodeId) -> Result<DecommissionTicket> {
        let usage = self.registry.gpu_usage(node_id)?;
        let node = self.registry.get(node_id)?;

        let ticket = Uuid::new_v4();
        self.pending_decommissions.lock().insert(node_id, ticket);

        info!(
            node_id = %node_id,
            hostname = %node.hostname,
            active_allocations = usage.active_allocations,
            "Decommission requested, awaiting confirmation"
        );

        Ok(DecommissionTicket {
            node_id,
            hostname: node.hostname,
            ticket,
            active_allocations: usage.active_allocations,
            issued_at: Utc::now(),
        })
    }

    /// Finish the handshake: walk the node to `Decommissioned` and remove it.
    ///
    /// A node still holding leases is refused with `NodeBusy` unless `force`
    /// is set, in which case the leases are revoked first. The ticket stays
    /// valid after a refusal.
    pub fn confirm_decommission(&self, node_id: NodeId, ticket: Uuid, force: bool) -> Result<Node> {
        self.registry.get(node_id)?;
        if self.pending_decommissions.lock().get(&node_id) != Some(&ticket) {
            return Err(FleetError::ConfirmationRequired(node_id));
        }

        let (node, revoked) = {
            let mut inventory = self.registry.write();
            let entry = inventory.entry(node_id)?;
            let state = entry.node.state;
            let active_allocations = entry.active_allocations();
            if active_allocations > 0 && !force {
                return Err(FleetError::NodeBusy {
                    node_id,
                    active_allocations,
                });
            }

            let revoked = if state != NodeState::Offline {
                inventory.transition(node_id, NodeState::Offline)?.revoked
            } else {
                Vec::new()
            };
            inventory.transition(node_id, NodeState::Decommissioned)?;
            (inventory.remove(node_id)?, revoked)
        };

        self.pending_decommissions.lock().remove(&node_id);
        self.allocator.notify_revoked(&revoked);
        self.telemetry.forget(node_id);
        self.monitor.forget(node_id);

        let gpus = node.hardware.gpu_count;
        self.monitor.raise_for_node(
            node_id,
            AlertSeverity::Info,
            components::LIFECYCLE,
            format!(
                "Node {} decommissioned; {} GPUs recovered.",
                node.hostname, gpus
            ),
        );
        self.logger.log_decommissioned(node_id, &node.hostname, gpus);
        self.refresh_metrics();

        Ok(node)
    }

    /// Subscriber side of the `Ready <-> Busy` automation
    pub fn handle_allocation_event(&self, event: &AllocationEvent) {
        match event {
            AllocationEvent::Granted {
                job_id,
                receipt,
                node_became_busy,
            } => {
                self.logger.log_allocation_granted(job_id, receipt);
                if *node_became_busy {
                    self.logger
                        .log_transition(receipt.node_id, NodeState::Ready, NodeState::Busy, 0);
                }
            }
            AllocationEvent::Released {
                allocation,
                reason,
                node_became_ready,
            } => {
                self.logger.log_allocation_released(allocation, *reason);
                if *node_became_ready {
                    self.logger.log_transition(
                        allocation.node_id,
                        NodeState::Busy,
                        NodeState::Ready,
                        0,
                    );
                }
            }
        }
        self.refresh_metrics();
    }

    /// Consume allocation events until shutdown
    pub async fn run_event_loop(self, mut shutdown: broadcast::Receiver<()>) {
        let mut events = self.allocator.subscribe();
        info!("Starting lifecycle event loop");

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.handle_allocation_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Lifecycle event loop lagged behind allocation events");
                        self.refresh_metrics();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => {
                    info!("Shutting down lifecycle event loop");
                    break;
                }
            }
        }
    }

    fn refresh_metrics(&self) {
        self.metrics.record_inventory(&self.registry.snapshot());
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("config", &self.config)
            .field("pending_decommissions", &self.pending_decommissions.lock().len())
            .finish()
    }
}
