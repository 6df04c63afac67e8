//! End-to-end behaviour of the control plane through its public API

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_lib::health::components;
use fleet_lib::{
    AlertSeverity, AllocationRequest, Cluster, ClusterConfig, FleetError, GpuMetric,
    HardwareSpec, HealthStatus, NodeId, NodeSpec, NodeState, ProvisionRequest,
    SimulatedProvisioner, TelemetrySample,
};

fn cluster_with(provisioner: SimulatedProvisioner) -> Cluster {
    Cluster::new(ClusterConfig::default(), Arc::new(provisioner))
}

fn cluster() -> Cluster {
    cluster_with(SimulatedProvisioner::default())
}

fn ready_node(cluster: &Cluster, hostname: &str, gpus: u32, vram: u32) -> NodeId {
    let spec = NodeSpec {
        hostname: hostname.to_string(),
        address: "10.0.4.20".parse().unwrap(),
        hardware: HardwareSpec {
            gpu_model: "NVIDIA A100".to_string(),
            gpu_count: gpus,
            vram_per_gpu_gb: vram,
            cuda_version: "12.2".to_string(),
            driver_version: "535.104.05".to_string(),
        },
        region: Some("us-west-2".to_string()),
        instance_type: None,
        tags: vec!["training".to_string()],
    };
    let id = cluster.registry().register(spec).unwrap();
    cluster.registry().transition(id, NodeState::Ready).unwrap();
    id
}

fn sample(gpus: u32, temp: f64, util: f64) -> TelemetrySample {
    TelemetrySample {
        timestamp: Utc::now(),
        gpu_metrics: (0..gpus)
            .map(|index| GpuMetric {
                index,
                temperature_celsius: temp,
                power_draw_watts: 300.0,
                fan_speed_percent: 60.0,
                gpu_utilization_percent: util,
                memory_utilization_percent: util / 2.0,
            })
            .collect(),
        system_load: 3.5,
        disk_usage_percent: 42.0,
    }
}

#[test]
fn test_full_node_request_prefers_matching_node() {
    let cluster = cluster();
    let big = ready_node(&cluster, "node-8x80", 8, 80);
    ready_node(&cluster, "node-4x40", 4, 40);

    let receipt = cluster
        .allocator()
        .allocate(&AllocationRequest::new("train", 8, 40))
        .unwrap();
    assert_eq!(receipt.node_id, big);
    assert_eq!(receipt.gpu_indices, (0..8).collect::<Vec<u32>>());
}

#[test]
fn test_partially_leased_node_cannot_take_full_request() {
    let cluster = cluster();
    let big = ready_node(&cluster, "node-8x80", 8, 80);
    ready_node(&cluster, "node-4x40", 4, 40);

    let small_job = cluster
        .allocator()
        .allocate(&AllocationRequest::new("small", 2, 80))
        .unwrap();
    assert_eq!(small_job.node_id, big);

    let err = cluster
        .allocator()
        .allocate(&AllocationRequest::new("train", 8, 40))
        .unwrap_err();
    assert_eq!(
        err,
        FleetError::InsufficientCapacity {
            requested: 8,
            min_vram_gb: 40,
            largest_free: 6,
        }
    );
}

#[test]
fn test_concurrent_grants_are_disjoint() {
    let cluster = cluster();
    let nodes: Vec<NodeId> = (0..3)
        .map(|i| ready_node(&cluster, &format!("node-{}", i), 8, 80))
        .collect();

    let handles: Vec<_> = (0..12)
        .map(|t| {
            let cluster = cluster.clone();
            std::thread::spawn(move || {
                (0..3)
                    .filter_map(|i| {
                        cluster
                            .allocator()
                            .allocate(&AllocationRequest::new(format!("job-{}-{}", t, i), 2, 0))
                            .ok()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let receipts: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    assert_eq!(receipts.len(), 12);

    let mut units = HashSet::new();
    for receipt in &receipts {
        assert!(nodes.contains(&receipt.node_id));
        for idx in &receipt.gpu_indices {
            assert!(*idx < 8);
            assert!(units.insert((receipt.node_id, *idx)));
        }
    }
    for node in nodes {
        let usage = cluster.registry().gpu_usage(node).unwrap();
        assert!(usage.free.is_empty());
        assert_eq!(usage.active_allocations, 4);
    }
}

#[test]
fn test_drain_busy_node() {
    let cluster = cluster();
    let node = ready_node(&cluster, "node-a", 4, 80);
    ready_node(&cluster, "node-b", 2, 40);

    cluster
        .allocator()
        .allocate(&AllocationRequest::new("a", 2, 80))
        .unwrap();
    cluster
        .allocator()
        .allocate(&AllocationRequest::new("b", 1, 80))
        .unwrap();
    assert_eq!(cluster.registry().get(node).unwrap().state, NodeState::Busy);

    let report = cluster.lifecycle().drain(node).unwrap();
    assert_eq!(report.revoked_allocations.len(), 2);
    assert_eq!(cluster.registry().get(node).unwrap().state, NodeState::Draining);
    assert!(cluster.allocator().allocations_on(node).is_empty());

    let warnings = cluster
        .monitor()
        .alerts()
        .into_iter()
        .filter(|a| a.severity == AlertSeverity::Warning)
        .count();
    assert_eq!(warnings, 1);
    assert_eq!(cluster.health_report().status, HealthStatus::Degraded);

    // Only node-a had 80 GB GPUs
    let err = cluster
        .allocator()
        .allocate(&AllocationRequest::new("c", 1, 80))
        .unwrap_err();
    assert!(matches!(err, FleetError::InsufficientCapacity { .. }));
}

#[test]
fn test_expiry_returns_node_to_ready() {
    let cluster = cluster();
    let node = ready_node(&cluster, "node-a", 4, 80);
    let granted = Utc::now() - chrono::Duration::hours(3);

    cluster
        .allocator()
        .allocate_at(&AllocationRequest::new("stale", 4, 0), granted)
        .unwrap();
    assert_eq!(cluster.registry().get(node).unwrap().state, NodeState::Busy);

    let now = Utc::now();
    assert_eq!(cluster.allocator().expire_sweep(now), 1);
    assert_eq!(cluster.registry().get(node).unwrap().state, NodeState::Ready);
    assert_eq!(cluster.registry().gpu_usage(node).unwrap().free.len(), 4);

    assert_eq!(cluster.allocator().expire_sweep(now), 0);
    assert_eq!(cluster.registry().get(node).unwrap().state, NodeState::Ready);
}

#[test]
fn test_allocate_release_round_trip() {
    let cluster = cluster();
    let node = ready_node(&cluster, "node-a", 8, 80);
    cluster
        .allocator()
        .allocate(&AllocationRequest::new("keep", 3, 0))
        .unwrap();
    let before = cluster.registry().gpu_usage(node).unwrap();

    let receipt = cluster
        .allocator()
        .allocate(&AllocationRequest::new("temp", 4, 0))
        .unwrap();
    cluster.allocator().release(receipt.allocation_id).unwrap();

    assert_eq!(cluster.registry().gpu_usage(node).unwrap(), before);
}

#[test]
fn test_cluster_summary_drops_offline_node() {
    let cluster = cluster();
    let a = ready_node(&cluster, "node-a", 2, 80);
    let b = ready_node(&cluster, "node-b", 2, 80);

    cluster.ingest(a, sample(2, 60.0, 40.0)).unwrap();
    cluster.ingest(b, sample(2, 60.0, 100.0)).unwrap();
    assert_eq!(cluster.telemetry().cluster_summary().nodes_reporting, 2);

    cluster.lifecycle().mark_offline(b).unwrap();

    let summary = cluster.telemetry().cluster_summary();
    assert_eq!(summary.nodes_reporting, 1);
    assert!((summary.mean_gpu_utilization_percent - 40.0).abs() < 1e-9);
    assert!((cluster.health_report().utilization_percentage - 40.0).abs() < 1e-9);
}

#[test]
fn test_thermal_breach_alerts_once_per_episode() {
    let cluster = cluster();
    let node = ready_node(&cluster, "node-hot", 2, 80);

    cluster.ingest(node, sample(2, 80.0, 90.0)).unwrap();
    cluster.ingest(node, sample(2, 85.0, 90.0)).unwrap();
    cluster.ingest(node, sample(2, 82.0, 90.0)).unwrap();

    let thermal: Vec<_> = cluster
        .monitor()
        .alerts()
        .into_iter()
        .filter(|a| a.component == "node-hot")
        .collect();
    assert_eq!(thermal.len(), 1);
    assert!(thermal[0].message.contains("High temperature detected on GPU 0"));
    assert!(cluster.monitor().is_unhealthy(node));

    // Unhealthy nodes are skipped by the allocator
    assert!(cluster
        .allocator()
        .allocate(&AllocationRequest::new("job", 1, 0))
        .is_err());

    cluster.ingest(node, sample(2, 60.0, 90.0)).unwrap();
    assert!(!cluster.monitor().is_unhealthy(node));
    cluster.ingest(node, sample(2, 77.0, 90.0)).unwrap();
    let thermal = cluster
        .monitor()
        .alerts()
        .into_iter()
        .filter(|a| a.component == "node-hot")
        .count();
    assert_eq!(thermal, 2);
}

#[test]
fn test_unknown_node_telemetry_rejected() {
    let cluster = cluster();
    let ghost = NodeId::new();
    assert_eq!(
        cluster.ingest(ghost, sample(1, 50.0, 10.0)),
        Err(FleetError::UnknownNode(ghost))
    );
}

#[test]
fn test_ready_to_initializing_is_rejected() {
    let cluster = cluster();
    let node = ready_node(&cluster, "node-a", 2, 80);

    let err = cluster
        .registry()
        .transition(node, NodeState::Initializing)
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidTransition { .. }));
    assert_eq!(cluster.registry().get(node).unwrap().state, NodeState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_paths() {
    let ok = cluster();
    let id = ok
        .lifecycle()
        .request_provision(ProvisionRequest::new(
            "node-p4-01",
            "10.0.5.1".parse().unwrap(),
            "p4d.24xlarge",
            4,
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    let node = ok.registry().get(id).unwrap();
    assert_eq!(node.state, NodeState::Ready);
    assert_eq!(node.hardware.vram_per_gpu_gb, 40);

    let failing = cluster_with(SimulatedProvisioner::default().failing("no capacity in zone"));
    let id = failing
        .lifecycle()
        .request_provision(ProvisionRequest::new(
            "node-p4-02",
            "10.0.5.2".parse().unwrap(),
            "p4d.24xlarge",
            4,
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(failing.registry().get(id).unwrap().state, NodeState::Offline);
    assert_eq!(failing.health_report().status, HealthStatus::Critical);

    let critical: Vec<_> = failing
        .monitor()
        .alerts()
        .into_iter()
        .filter(|a| a.severity == AlertSeverity::Critical)
        .collect();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].component, components::PROVISIONER);
}
