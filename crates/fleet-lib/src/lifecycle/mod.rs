//! Node lifecycle management
//!
//! This module provides:
//! - The node state machine and its transition table
//! - The provisioning collaborator interface and a simulated provider
//! - The controller that drives operator-initiated transitions

mod controller;
mod provisioner;
mod state;

pub use controller::{
    DecommissionTicket, DrainReport, LifecycleConfig, LifecycleController,
    DEFAULT_PROVISION_TIMEOUT,
};
pub use provisioner::{
    ProvisionHandle, ProvisionOutcome, ProvisionRequest, Provisioner, SimulatedProvisioner,
    DEFAULT_SIMULATED_DELAY,
};
pub use state::NodeState;
