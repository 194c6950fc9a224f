//! Shared fixture for the scenario tests: one chain, four levels deep,
//! eight leaves split across four two-GPU nodes, with two VCs each
//! quoted for exactly one node's worth of GPUs.

use std::collections::BTreeMap;

use cellsched::config::{ChainConfig, ClusterConfig, GpuAddr, LevelSpec, PhysicalRootSpec, ReservationSpec, VcConfig};
use cellsched::request::PodSchedulingSpec;

pub const CHAIN: &str = "c1";
pub const NODE_LEVEL: u32 = 2;
pub const RESERVATION: &str = "res-a";

pub fn sample_config() -> ClusterConfig {
    let nodes = ["node-0", "node-1", "node-2", "node-3"];
    let leaves: Vec<GpuAddr> = nodes
        .iter()
        .flat_map(|&node| (0..2).map(move |index| GpuAddr { node: node.to_string(), index }))
        .collect();

    let chain = ChainConfig {
        name: CHAIN.to_string(),
        levels: vec![
            LevelSpec { cell_type: "gpu".to_string(), fan_out: 0 },
            LevelSpec { cell_type: "node".to_string(), fan_out: 2 },
            LevelSpec { cell_type: "rack".to_string(), fan_out: 2 },
            LevelSpec { cell_type: "cluster".to_string(), fan_out: 2 },
        ],
        gpu_type: "A100".to_string(),
        roots: vec![PhysicalRootSpec { leaves }],
    };

    let mut chains = BTreeMap::new();
    chains.insert(CHAIN.to_string(), chain);

    let mut vcs = BTreeMap::new();
    for vc in ["vc-a", "vc-b"] {
        let quota = BTreeMap::from([(CHAIN.to_string(), BTreeMap::from([(NODE_LEVEL, 1)]))]);
        vcs.insert(vc.to_string(), VcConfig { name: vc.to_string(), quota, reservations: BTreeMap::new() });
    }

    ClusterConfig { chains, vcs, gpu_type_index: BTreeMap::new(), min_guaranteed_priority: 0 }
}

/// Same fixture, plus a reservation on `vc-a` pinned to the fourth node
/// (index 3 at `NODE_LEVEL`), distinct from the node that VC's own quota
/// would otherwise claim first.
pub fn config_with_reservation() -> ClusterConfig {
    let mut cfg = sample_config();
    let vc = cfg.vcs.get_mut("vc-a").unwrap();
    vc.reservations.insert(
        RESERVATION.to_string(),
        ReservationSpec { chain: CHAIN.to_string(), root_index: 0, level: NODE_LEVEL, cell_index: 3 },
    );
    cfg
}

/// A guaranteed single-pod request for `gpu_count` GPUs in `group`.
pub fn guaranteed_spec(vc: &str, group: &str, priority: i32, gpu_count: u32) -> PodSchedulingSpec {
    PodSchedulingSpec {
        vc: vc.to_string(),
        priority,
        group: group.to_string(),
        pod_numbers: BTreeMap::from([(gpu_count, 1)]),
        gpu_type: None,
        reservation_id: None,
        gang_release: false,
        lazy_preemption_enable: false,
        gpu_count,
    }
}

/// An opportunistic single-pod request for `gpu_count` GPUs in `group`.
pub fn opportunistic_spec(vc: &str, group: &str, gpu_count: u32) -> PodSchedulingSpec {
    guaranteed_spec(vc, group, -1, gpu_count)
}

/// A guaranteed single-pod request naming a reservation by id.
pub fn reservation_spec(vc: &str, group: &str, priority: i32, gpu_count: u32, reservation_id: &str) -> PodSchedulingSpec {
    PodSchedulingSpec {
        reservation_id: Some(reservation_id.to_string()),
        ..guaranteed_spec(vc, group, priority, gpu_count)
    }
}
