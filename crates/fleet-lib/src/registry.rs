//! Node registry and GPU reservation inventory
//!
//! Nodes, their GPU reservation bitmaps and the active allocation table live
//! in one [`Inventory`] behind a single lock. The allocation engine and the
//! lifecycle controller take the write lock for every compound mutation, so
//! a reader never observes a half-applied grant, release or transition.

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::lifecycle::NodeState;
use crate::models::{Allocation, AllocationId, Node, NodeId, NodeSpec};

/// A registered node plus its per-GPU reservation state
#[derive(Debug, Clone)]
pub(crate) struct NodeEntry {
    pub node: Node,
    /// Slot `i` holds the lease on GPU `i`, if any
    gpus: Vec<Option<AllocationId>>,
    leases: BTreeSet<AllocationId>,
}

impl NodeEntry {
    fn new(node: Node) -> Self {
        let gpus = vec![None; node.hardware.gpu_count as usize];
        Self {
            node,
            gpus,
            leases: BTreeSet::new(),
        }
    }

    pub fn free_count(&self) -> u32 {
        self.gpus.iter().filter(|slot| slot.is_none()).count() as u32
    }

    pub fn leased_count(&self) -> u32 {
        self.node.hardware.gpu_count - self.free_count()
    }

    pub fn free_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.gpus
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(idx, _)| idx as u32)
    }

    pub fn leased_indices(&self) -> Vec<u32> {
        self.gpus
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(idx, _)| idx as u32)
            .collect()
    }

    pub fn active_allocations(&self) -> usize {
        self.leases.len()
    }
}

/// Outcome of a successful state change
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub node_id: NodeId,
    pub previous: NodeState,
    pub current: NodeState,
    /// Leases terminated because the target state does not keep them
    pub revoked: Vec<Allocation>,
}

/// Shared inventory state. Only reachable through [`NodeRegistry`].
#[derive(Debug, Default)]
pub(crate) struct Inventory {
    nodes: BTreeMap<NodeId, NodeEntry>,
    allocations: HashMap<AllocationId, Allocation>,
}

impl Inventory {
    pub fn insert(&mut self, id: NodeId, spec: NodeSpec, now: DateTime<Utc>) -> Result<NodeId> {
        if spec.hardware.gpu_count == 0 {
            return Err(FleetError::InvalidRequest(
                "gpu_count must be at least 1".to_string(),
            ));
        }
        if spec.hardware.vram_per_gpu_gb == 0 {
            return Err(FleetError::InvalidRequest(
                "vram_per_gpu_gb must be positive".to_string(),
            ));
        }
        if spec.hostname.trim().is_empty() {
            return Err(FleetError::InvalidRequest(
                "hostname must not be empty".to_string(),
            ));
        }
        if self.nodes.contains_key(&id) {
            return Err(FleetError::InvalidRequest(format!(
                "node id {} already registered",
                id
            )));
        }
        if self.nodes.values().any(|e| e.node.hostname == spec.hostname) {
            return Err(FleetError::DuplicateHostname(spec.hostname));
        }

        let node = Node::from_spec(id, spec, now);
        self.nodes.insert(id, NodeEntry::new(node));
        Ok(id)
    }

    pub fn entry(&self, id: NodeId) -> Result<&NodeEntry> {
        self.nodes.get(&id).ok_or_else(|| FleetError::node_not_found(id))
    }

    fn entry_mut(&mut self, id: NodeId) -> Result<&mut NodeEntry> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| FleetError::node_not_found(id))
    }

    pub fn entries(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    /// Apply a transition through the state table.
    ///
    /// `Ready -> Busy` needs at least one lease and `Busy -> Ready` needs
    /// none; entering a revoking state frees every lease on the node.
    pub fn transition(&mut self, id: NodeId, to: NodeState) -> Result<TransitionOutcome> {
        let entry = self.entry(id)?;
        let from = entry.node.state;
        let leases = entry.active_allocations();

        let consistent = match (from, to) {
            (NodeState::Ready, NodeState::Busy) => leases > 0,
            (NodeState::Busy, NodeState::Ready) => leases == 0,
            _ => true,
        };
        if !from.can_transition_to(to) || !consistent {
            return Err(FleetError::InvalidTransition {
                node_id: id,
                from,
                to,
            });
        }

        let revoked = if to.revokes_allocations() {
            self.revoke_node(id)
        } else {
            Vec::new()
        };

        self.entry_mut(id)?.node.state = to;
        debug!(node_id = %id, from = %from, to = %to, "Node state changed");

        Ok(TransitionOutcome {
            node_id: id,
            previous: from,
            current: to,
            revoked,
        })
    }

    pub fn remove(&mut self, id: NodeId) -> Result<Node> {
        let entry = self.entry(id)?;
        if entry.node.state != NodeState::Decommissioned {
            return Err(FleetError::InvalidTransition {
                node_id: id,
                from: entry.node.state,
                to: NodeState::Decommissioned,
            });
        }
        self.nodes
            .remove(&id)
            .map(|e| e.node)
            .ok_or_else(|| FleetError::node_not_found(id))
    }

    /// Mark `indices` on `allocation.node_id` as leased and record the lease
    pub fn reserve(&mut self, allocation: Allocation) -> Result<()> {
        let entry = self.entry_mut(allocation.node_id)?;
        for &idx in &allocation.gpu_indices {
            match entry.gpus.get(idx as usize) {
                Some(None) => {}
                _ => {
                    return Err(FleetError::InvalidRequest(format!(
                        "GPU {} on node {} is not free",
                        idx, allocation.node_id
                    )))
                }
            }
        }
        for &idx in &allocation.gpu_indices {
            entry.gpus[idx as usize] = Some(allocation.id);
        }
        entry.leases.insert(allocation.id);
        self.allocations.insert(allocation.id, allocation);
        Ok(())
    }

    /// Free a lease. Returns the allocation and whether its node went back
    /// to `Ready`.
    pub fn release(&mut self, id: AllocationId) -> Result<(Allocation, bool)> {
        let allocation = self
            .allocations
            .remove(&id)
            .ok_or_else(|| FleetError::allocation_not_found(id))?;

        let now_idle = match self.nodes.get_mut(&allocation.node_id) {
            Some(entry) => {
                entry.free_lease(id);
                entry.node.state == NodeState::Busy && entry.leases.is_empty()
            }
            None => false,
        };
        if now_idle {
            self.transition(allocation.node_id, NodeState::Ready)?;
        }

        Ok((allocation, now_idle))
    }

    /// Free every lease on a node without touching its state
    pub fn revoke_node(&mut self, id: NodeId) -> Vec<Allocation> {
        let Some(entry) = self.nodes.get_mut(&id) else {
            return Vec::new();
        };

        let lease_ids: Vec<AllocationId> = entry.leases.iter().copied().collect();
        for lease in &lease_ids {
            entry.free_lease(*lease);
        }

        lease_ids
            .into_iter()
            .filter_map(|lease| self.allocations.remove(&lease))
            .collect()
    }

    pub fn allocation(&self, id: AllocationId) -> Option<&Allocation> {
        self.allocations.get(&id)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }
}

impl NodeEntry {
    fn free_lease(&mut self, id: AllocationId) {
        for slot in self.gpus.iter_mut() {
            if *slot == Some(id) {
                *slot = None;
            }
        }
        self.leases.remove(&id);
    }
}

/// GPU reservation view of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuUsage {
    pub node_id: NodeId,
    pub total: u32,
    pub leased: Vec<u32>,
    pub free: Vec<u32>,
    pub active_allocations: usize,
}

/// Point-in-time copy of a node and its reservation counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUsage {
    pub node: Node,
    pub free_gpus: u32,
    pub leased_gpus: u32,
    pub active_allocations: usize,
}

/// Authoritative node registry, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    inner: Arc<RwLock<Inventory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node in `Initializing` state
    pub fn register(&self, spec: NodeSpec) -> Result<NodeId> {
        self.register_with_id(NodeId::new(), spec)
    }

    pub(crate) fn register_with_id(&self, id: NodeId, spec: NodeSpec) -> Result<NodeId> {
        let hostname = spec.hostname.clone();
        let id = self.inner.write().insert(id, spec, Utc::now())?;
        debug!(node_id = %id, hostname = %hostname, "Node registered");
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> Result<Node> {
        self.inner.read().entry(id).map(|e| e.node.clone())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.read().entry(id).is_ok()
    }

    /// All nodes ordered by id
    pub fn list(&self) -> Vec<Node> {
        self.inner.read().entries().map(|e| e.node.clone()).collect()
    }

    pub fn list_by_state(&self, state: NodeState) -> Vec<Node> {
        self.inner
            .read()
            .entries()
            .filter(|e| e.node.state == state)
            .map(|e| e.node.clone())
            .collect()
    }

    pub fn transition(&self, id: NodeId, to: NodeState) -> Result<TransitionOutcome> {
        self.inner.write().transition(id, to)
    }

    /// Remove a node. Only legal once it is `Decommissioned`.
    pub fn remove(&self, id: NodeId) -> Result<Node> {
        self.inner.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gpu_usage(&self, id: NodeId) -> Result<GpuUsage> {
        let inventory = self.inner.read();
        let entry = inventory.entry(id)?;
        Ok(GpuUsage {
            node_id: id,
            total: entry.node.hardware.gpu_count,
            leased: entry.leased_indices(),
            free: entry.free_indices().collect(),
            active_allocations: entry.active_allocations(),
        })
    }

    /// Consistent copy of every node with its reservation counts
    pub fn snapshot(&self) -> Vec<NodeUsage> {
        self.inner
            .read()
            .entries()
            .map(|e| NodeUsage {
                node: e.node.clone(),
                free_gpus: e.free_count(),
                leased_gpus: e.leased_count(),
                active_allocations: e.active_allocations(),
            })
            .collect()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Inventory> {
        self.inner.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Inventory> {
        self.inner.write()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::HardwareSpec;

    pub(crate) fn node_spec(hostname: &str, gpu_count: u32, vram: u32) -> NodeSpec {
        NodeSpec {
            hostname: hostname.to_string(),
            address: "10.0.1.10".parse().unwrap(),
            hardware: HardwareSpec {
                gpu_model: "NVIDIA H100".to_string(),
                gpu_count,
                vram_per_gpu_gb: vram,
                cuda_version: "12.2".to_string(),
                driver_version: "535.104.05".to_string(),
            },
            region: None,
            instance_type: None,
            tags: Vec::new(),
        }
    }

    pub(crate) fn ready_node(registry: &NodeRegistry, hostname: &str, gpus: u32, vram: u32) -> NodeId {
        let id = registry.register(node_spec(hostname, gpus, vram)).unwrap();
        registry.transition(id, NodeState::Ready).unwrap();
        id
    }

    #[test]
    fn test_register_starts_initializing() {
        let registry = NodeRegistry::new();
        let id = registry.register(node_spec("node-h100-01", 8, 80)).unwrap();

        let node = registry.get(id).unwrap();
        assert_eq!(node.state, NodeState::Initializing);
        assert_eq!(node.hardware.gpu_count, 8);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_zero_gpus() {
        let registry = NodeRegistry::new();
        let err = registry.register(node_spec("empty", 0, 80)).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_rejects_duplicate_hostname() {
        let registry = NodeRegistry::new();
        registry.register(node_spec("node-a", 4, 40)).unwrap();
        let err = registry.register(node_spec("node-a", 4, 40)).unwrap_err();
        assert_eq!(err, FleetError::DuplicateHostname("node-a".to_string()));
    }

    #[test]
    fn test_get_unknown_node() {
        let registry = NodeRegistry::new();
        let err = registry.get(NodeId::new()).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_invalid_transition_leaves_state_unchanged() {
        let registry = NodeRegistry::new();
        let id = ready_node(&registry, "node-a", 4, 40);

        let err = registry.transition(id, NodeState::Initializing).unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));
        assert_eq!(registry.get(id).unwrap().state, NodeState::Ready);
    }

    #[test]
    fn test_busy_requires_leases() {
        let registry = NodeRegistry::new();
        let id = ready_node(&registry, "node-a", 4, 40);

        let err = registry.transition(id, NodeState::Busy).unwrap_err();
        assert!(matches!(err, FleetError::InvalidTransition { .. }));
    }

    #[test]
    fn test_list_by_state() {
        let registry = NodeRegistry::new();
        ready_node(&registry, "node-a", 4, 40);
        ready_node(&registry, "node-b", 4, 40);
        registry.register(node_spec("node-c", 4, 40)).unwrap();

        assert_eq!(registry.list_by_state(NodeState::Ready).len(), 2);
        assert_eq!(registry.list_by_state(NodeState::Initializing).len(), 1);
        assert!(registry.list_by_state(NodeState::Draining).is_empty());
    }

    #[test]
    fn test_remove_only_from_decommissioned() {
        let registry = NodeRegistry::new();
        let id = ready_node(&registry, "node-a", 4, 40);

        assert!(registry.remove(id).is_err());
        assert!(registry.contains(id));

        registry.transition(id, NodeState::Offline).unwrap();
        registry.transition(id, NodeState::Decommissioned).unwrap();
        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.hostname, "node-a");
        assert!(!registry.contains(id));

        // Hostname is free again once the node is gone
        registry.register(node_spec("node-a", 4, 40)).unwrap();
    }

    #[test]
    fn test_reserve_and_release_restore_bitmap() {
        let registry = NodeRegistry::new();
        let id = ready_node(&registry, "node-a", 4, 40);
        let lease = Allocation {
            id: AllocationId::new(),
            job_id: "job".to_string(),
            priority: Default::default(),
            node_id: id,
            gpu_indices: vec![0, 1],
            granted_at: Utc::now(),
            expires_at: Utc::now(),
        };
        let lease_id = lease.id;

        {
            let mut inv = registry.write();
            inv.reserve(lease).unwrap();
            inv.transition(id, NodeState::Busy).unwrap();
        }
        let usage = registry.gpu_usage(id).unwrap();
        assert_eq!(usage.leased, vec![0, 1]);
        assert_eq!(usage.free, vec![2, 3]);

        let (_, back_to_ready) = registry.write().release(lease_id).unwrap();
        assert!(back_to_ready);
        assert_eq!(registry.get(id).unwrap().state, NodeState::Ready);
        assert_eq!(registry.gpu_usage(id).unwrap().free.len(), 4);
    }

    #[test]
    fn test_offline_transition_revokes_leases() {
        let registry = NodeRegistry::new();
        let id = ready_node(&registry, "node-a", 2, 40);
        let lease = Allocation {
            id: AllocationId::new(),
            job_id: "job".to_string(),
            priority: Default::default(),
            node_id: id,
            gpu_indices: vec![1],
            granted_at: Utc::now(),
            expires_at: Utc::now(),
        };
        {
            let mut inv = registry.write();
            inv.reserve(lease).unwrap();
            inv.transition(id, NodeState::Busy).unwrap();
        }

        let outcome = registry.transition(id, NodeState::Offline).unwrap();
        assert_eq!(outcome.previous, NodeState::Busy);
        assert_eq!(outcome.revoked.len(), 1);
        assert_eq!(registry.gpu_usage(id).unwrap().active_allocations, 0);
    }
}
