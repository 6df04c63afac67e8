//! Node lifecycle state machine
//!
//! The adjacency table in [`NodeState::allowed_targets`] is the only place
//! transition rules live. Registry, allocation engine and controller all
//! route through [`NodeState::can_transition_to`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Initializing,
    Ready,
    Busy,
    Draining,
    Maintenance,
    Offline,
    Decommissioned,
}

impl NodeState {
    pub const ALL: [NodeState; 7] = [
        NodeState::Initializing,
        NodeState::Ready,
        NodeState::Busy,
        NodeState::Draining,
        NodeState::Maintenance,
        NodeState::Offline,
        NodeState::Decommissioned,
    ];

    /// Targets reachable from this state in one step
    pub fn allowed_targets(&self) -> &'static [NodeState] {
        use NodeState::*;
        match self {
            Initializing => &[Ready, Offline],
            Ready => &[Busy, Draining, Maintenance, Offline],
            Busy => &[Ready, Draining, Offline],
            Draining => &[Offline, Maintenance],
            Maintenance => &[Ready, Offline],
            Offline => &[Decommissioned],
            Decommissioned => &[],
        }
    }

    pub fn can_transition_to(&self, target: NodeState) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// States the allocation engine may place new leases on
    pub fn is_allocatable(&self) -> bool {
        matches!(self, NodeState::Ready | NodeState::Busy)
    }

    /// Entering this state forcibly terminates the node's leases
    pub fn revokes_allocations(&self) -> bool {
        matches!(self, NodeState::Draining | NodeState::Offline)
    }

    /// Edges driven by allocation bookkeeping rather than by operators
    pub fn is_automatic_edge(from: NodeState, to: NodeState) -> bool {
        matches!(
            (from, to),
            (NodeState::Ready, NodeState::Busy) | (NodeState::Busy, NodeState::Ready)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Initializing => "initializing",
            NodeState::Ready => "ready",
            NodeState::Busy => "busy",
            NodeState::Draining => "draining",
            NodeState::Maintenance => "maintenance",
            NodeState::Offline => "offline",
            NodeState::Decommissioned => "decommissioned",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown node state '{}'", s))
    }
}
