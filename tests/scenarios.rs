//! Integration tests driving [`Algorithm`] purely through its public
//! surface, the way the host scheduler-extender would. The state
//! assertions rely on the white-box accessors gated behind the
//! `test_private` feature, so this file only compiles with it enabled:
//! `cargo test --features test_private`.
#![cfg(feature = "test_private")]

mod common;

use std::time::SystemTime;

use cellsched::cell::CellState;
use cellsched::group::GroupState;
use cellsched::request::PodBindInfo;
use cellsched::{Algorithm, RequestError};

use common::{
    config_with_reservation, guaranteed_spec, opportunistic_spec, reservation_spec, sample_config, CHAIN,
    RESERVATION,
};

#[test]
fn s1_guaranteed_schedule_and_release_round_trips_physical_capacity() {
    let algo = Algorithm::new(sample_config()).unwrap();

    let spec = guaranteed_spec("vc-a", "g1", 10, 2);
    let result = algo.schedule(&spec, "pod-1", SystemTime::UNIX_EPOCH).unwrap();
    let placement = result.placement.expect("vc-a has a free quota root for 2 GPUs");
    assert_eq!(placement.gpu_indices.len(), 2);
    assert!(result.victims.is_empty());

    let node = placement.node.clone();
    let idx0 = placement.gpu_indices[0];
    assert_eq!(algo.cell_state(CHAIN, &node, idx0), Some(CellState::Used));

    algo.delete_allocated_pod("g1", 2, "pod-1");
    assert!(!algo.group_exists("g1"));
    assert_eq!(algo.cell_state(CHAIN, &node, idx0), Some(CellState::Free));
}

#[test]
fn s2_demand_exceeding_any_single_quota_root_waits() {
    let algo = Algorithm::new(sample_config()).unwrap();

    // Every quota root in the fixture covers exactly one 2-GPU node; no
    // VC can satisfy a 4-GPU pod as a single guaranteed unit.
    let spec = guaranteed_spec("vc-a", "g1", 10, 4);
    let result = algo.schedule(&spec, "pod-1", SystemTime::UNIX_EPOCH).unwrap();
    assert!(result.placement.is_none());
    assert!(!algo.group_exists("g1"));
}

#[test]
fn s3_opportunistic_bypasses_vc_quota_until_the_chain_is_full() {
    let algo = Algorithm::new(sample_config()).unwrap();

    // Neither VC has guaranteed quota for a 1-GPU unit anywhere; every one
    // of these eight placements must come from the opportunistic path.
    for i in 0..8 {
        let spec = opportunistic_spec("vc-a", &format!("opp-{i}"), 1);
        let result = algo.schedule(&spec, &format!("pod-{i}"), SystemTime::UNIX_EPOCH).unwrap();
        assert!(result.placement.is_some(), "leaf {i} of 8 should still be free");
    }

    let spec = opportunistic_spec("vc-a", "opp-overflow", 1);
    let result = algo.schedule(&spec, "pod-overflow", SystemTime::UNIX_EPOCH).unwrap();
    assert!(result.placement.is_none(), "the whole chain is occupied");
}

#[test]
fn s4_higher_priority_guaranteed_preempts_lower_priority_occupant() {
    let algo = Algorithm::new(sample_config()).unwrap();

    let low = guaranteed_spec("vc-a", "g-low", 1, 2);
    let r_low = algo.schedule(&low, "pod-low", SystemTime::UNIX_EPOCH).unwrap();
    let placement_low = r_low.placement.expect("the first request places cleanly");

    let high = guaranteed_spec("vc-a", "g-high", 100, 2);
    let r_high = algo.schedule(&high, "pod-high", SystemTime::UNIX_EPOCH).unwrap();
    let placement_high = r_high.placement.expect("the preemptor is told its placement up front");
    assert_eq!(placement_high.node, placement_low.node);
    assert!(!r_high.victims.is_empty());
    assert!(r_high.victims.values().flatten().any(|pod| pod == "pod-low"));

    assert_eq!(algo.group_state("g-low"), Some(GroupState::BeingPreempted));
    assert_eq!(algo.group_state("g-high"), Some(GroupState::Preempting));

    let node = placement_low.node;
    let idx0 = placement_low.gpu_indices[0];
    assert_eq!(algo.cell_state(CHAIN, &node, idx0), Some(CellState::Acquiring));

    // The host scheduler-extender evicts the victim's pod...
    algo.delete_allocated_pod("g-low", 2, "pod-low");
    assert!(!algo.group_exists("g-low"));
    assert_eq!(algo.cell_state(CHAIN, &node, idx0), Some(CellState::Used));

    // ...then confirms the preemptor's own bind, which was already
    // recorded at `Schedule` time.
    algo.add_allocated_pod(&PodBindInfo {
        vc: "vc-a".to_string(),
        group: "g-high".to_string(),
        chain: CHAIN.to_string(),
        gpu_count: 2,
        pod: "pod-high".to_string(),
        node: node.clone(),
        gpu_index: idx0,
        priority: 100,
        gang_release: false,
        lazy_preemption_enable: false,
    });
    assert_eq!(algo.group_state("g-high"), Some(GroupState::Allocated));
}

#[test]
fn s5_higher_preemptor_cancels_a_pending_preemptor_outright() {
    let algo = Algorithm::new(sample_config()).unwrap();

    let low = guaranteed_spec("vc-a", "g-low", 1, 2);
    let r_low = algo.schedule(&low, "pod-low", SystemTime::UNIX_EPOCH).unwrap();
    let placement_low = r_low.placement.unwrap();

    let mid = guaranteed_spec("vc-a", "g-mid", 50, 2);
    algo.schedule(&mid, "pod-mid", SystemTime::UNIX_EPOCH).unwrap();
    assert_eq!(algo.group_state("g-mid"), Some(GroupState::Preempting));

    let high = guaranteed_spec("vc-a", "g-high", 100, 2);
    algo.schedule(&high, "pod-high", SystemTime::UNIX_EPOCH).unwrap();

    assert!(!algo.group_exists("g-mid"), "the cancelled preemptor is removed outright, not demoted");
    assert_eq!(algo.group_state("g-low"), Some(GroupState::BeingPreempted));
    assert_eq!(algo.group_state("g-high"), Some(GroupState::Preempting));

    let node = placement_low.node;
    let idx0 = placement_low.gpu_indices[0];
    assert_eq!(algo.cell_state(CHAIN, &node, idx0), Some(CellState::Acquiring));
}

#[test]
fn s5_deleting_the_last_preemptor_pod_cancels_the_preempt_and_restores_the_occupant() {
    let algo = Algorithm::new(sample_config()).unwrap();

    let low = guaranteed_spec("vc-a", "g-low", 1, 2);
    let r_low = algo.schedule(&low, "pod-low", SystemTime::UNIX_EPOCH).unwrap();
    let placement_low = r_low.placement.unwrap();

    let high = guaranteed_spec("vc-a", "g-high", 100, 2);
    algo.schedule(&high, "pod-high", SystemTime::UNIX_EPOCH).unwrap();
    assert_eq!(algo.group_state("g-high"), Some(GroupState::Preempting));

    // The preemptor's own pod is withdrawn before the victim is ever
    // evicted (e.g. the scheduling attempt was abandoned upstream).
    algo.delete_unallocated_pod("g-high", "pod-high");

    assert!(!algo.group_exists("g-high"));
    assert_eq!(algo.group_state("g-low"), Some(GroupState::Allocated));
    let node = placement_low.node;
    let idx0 = placement_low.gpu_indices[0];
    assert_eq!(algo.cell_state(CHAIN, &node, idx0), Some(CellState::Used));
}

#[test]
fn s6_node_health_propagates_to_cluster_status_and_is_idempotent() {
    let algo = Algorithm::new(sample_config()).unwrap();

    let healthy_count = |algo: &Algorithm| {
        algo.cluster_status().cells.iter().filter(|c| c.healthy).count()
    };
    assert_eq!(healthy_count(&algo), 0, "every cell starts unhealthy until a signal arrives");

    algo.add_node(CHAIN, "node-0", true);
    let after_one = healthy_count(&algo);
    assert!(after_one > 0);

    // A repeated healthy signal for the same node is a no-op.
    algo.update_node(CHAIN, "node-0", true);
    assert_eq!(healthy_count(&algo), after_one);

    algo.delete_node(CHAIN, "node-0");
    assert_eq!(healthy_count(&algo), 0);
}

#[test]
fn s7_reservation_schedules_into_its_own_pinned_node() {
    let algo = Algorithm::new(config_with_reservation()).unwrap();

    let spec = reservation_spec("vc-a", "g1", 10, 2, RESERVATION);
    let result = algo.schedule(&spec, "pod-1", SystemTime::UNIX_EPOCH).unwrap();
    let placement = result.placement.expect("a never-used reservation has its whole node free");
    assert_eq!(placement.node, "node-3");
    assert_eq!(placement.gpu_indices.len(), 2);
    assert_eq!(algo.cell_state(CHAIN, "node-3", placement.gpu_indices[0]), Some(CellState::Used));
}

#[test]
fn s7_reservation_is_independent_of_its_vcs_own_quota() {
    let algo = Algorithm::new(config_with_reservation()).unwrap();

    // vc-a's ordinary quota (one node) is unaffected by the reservation on
    // another node, and vice versa: both can be scheduled at once.
    let quota_spec = guaranteed_spec("vc-a", "g-quota", 10, 2);
    let quota_result = algo.schedule(&quota_spec, "pod-quota", SystemTime::UNIX_EPOCH).unwrap();
    let quota_placement = quota_result.placement.expect("vc-a still has its own quota root free");
    assert_ne!(quota_placement.node, "node-3");

    let res_spec = reservation_spec("vc-a", "g-res", 10, 2, RESERVATION);
    let res_result = algo.schedule(&res_spec, "pod-res", SystemTime::UNIX_EPOCH).unwrap();
    let res_placement = res_result.placement.expect("the reservation is untouched by the quota placement");
    assert_eq!(res_placement.node, "node-3");
}

#[test]
fn s7_reservation_without_enough_free_capacity_waits() {
    let algo = Algorithm::new(config_with_reservation()).unwrap();

    let first = reservation_spec("vc-a", "g1", 10, 2, RESERVATION);
    let r1 = algo.schedule(&first, "pod-1", SystemTime::UNIX_EPOCH).unwrap();
    assert!(r1.placement.is_some());

    // The reservation's single 2-GPU node is now fully occupied.
    let second = reservation_spec("vc-a", "g2", 10, 2, RESERVATION);
    let r2 = algo.schedule(&second, "pod-2", SystemTime::UNIX_EPOCH).unwrap();
    assert!(r2.placement.is_none(), "the reservation has no free leaves left");
    assert!(!algo.group_exists("g2"));
}

#[test]
fn unknown_vc_is_rejected_without_mutating_state() {
    let algo = Algorithm::new(sample_config()).unwrap();
    let spec = guaranteed_spec("vc-ghost", "g1", 10, 2);
    let err = algo.schedule(&spec, "pod-1", SystemTime::UNIX_EPOCH).unwrap_err();
    assert_eq!(err, RequestError::UnknownVc("vc-ghost".to_string()));
    assert!(!algo.group_exists("g1"));
}
