//! Error taxonomy for the cluster engine
//!
//! Every variant is recoverable at the caller. `InsufficientCapacity` in
//! particular is an expected outcome of allocation, not a fault.

use thiserror::Error;

use crate::lifecycle::NodeState;
use crate::models::NodeId;

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FleetError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("node {node_id}: transition {from} -> {to} is not allowed")]
    InvalidTransition {
        node_id: NodeId,
        from: NodeState,
        to: NodeState,
    },

    #[error(
        "no single node can satisfy {requested} GPU(s) with at least {min_vram_gb} GB VRAM \
         (largest eligible free block: {largest_free})"
    )]
    InsufficientCapacity {
        requested: u32,
        min_vram_gb: u32,
        largest_free: u32,
    },

    #[error("node {node_id} still holds {active_allocations} active allocation(s)")]
    NodeBusy {
        node_id: NodeId,
        active_allocations: usize,
    },

    #[error("telemetry for unknown node {0} discarded")]
    UnknownNode(NodeId),

    #[error("hostname {0} is already registered")]
    DuplicateHostname(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("decommission of node {0} requires a matching confirmation ticket")]
    ConfirmationRequired(NodeId),
}

impl FleetError {
    pub fn node_not_found(id: NodeId) -> Self {
        FleetError::NotFound {
            kind: "node",
            id: id.to_string(),
        }
    }

    pub fn allocation_not_found(id: impl ToString) -> Self {
        FleetError::NotFound {
            kind: "allocation",
            id: id.to_string(),
        }
    }

    /// Stable snake_case tag for API responses and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::NotFound { .. } => "not_found",
            FleetError::InvalidTransition { .. } => "invalid_transition",
            FleetError::InsufficientCapacity { .. } => "insufficient_capacity",
            FleetError::NodeBusy { .. } => "node_busy",
            FleetError::UnknownNode(_) => "unknown_node",
            FleetError::DuplicateHostname(_) => "duplicate_hostname",
            FleetError::InvalidRequest(_) => "invalid_request",
            FleetError::ConfirmationRequired(_) => "confirmation_required",
        }
    }
}
