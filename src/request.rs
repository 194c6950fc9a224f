//! Transient, caller-supplied request shapes.

use std::collections::BTreeMap;

use crate::ids::{ChainName, GroupName, ReservationId, VcName};

/// A scheduling request for one pod of an affinity group.
#[derive(Debug, Clone)]
pub struct PodSchedulingSpec {
    pub vc: VcName,
    /// Small-integer total order; values below the cluster's configured
    /// `min_guaranteed_priority` are opportunistic.
    pub priority: i32,
    pub group: GroupName,
    /// Expected pod count per GPU-count bucket for this group.
    pub pod_numbers: BTreeMap<u32, u32>,
    pub gpu_type: Option<String>,
    pub reservation_id: Option<ReservationId>,
    pub gang_release: bool,
    pub lazy_preemption_enable: bool,
    /// The GPU-count bucket this particular pod belongs to.
    pub gpu_count: u32,
}

/// One already-bound physical GPU reported back to the algorithm on
/// restart, via `AddAllocatedPod`.
#[derive(Debug, Clone)]
pub struct PodBindInfo {
    pub vc: VcName,
    pub group: GroupName,
    pub chain: ChainName,
    pub gpu_count: u32,
    pub pod: String,
    pub node: String,
    pub gpu_index: u32,
    pub priority: i32,
    pub gang_release: bool,
    pub lazy_preemption_enable: bool,
}
