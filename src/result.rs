//! Outputs handed back to the caller.

use std::collections::BTreeMap;

use crate::cell::{CellPriority, Level};
use crate::config::GpuAddr;
use crate::group::{LazyPreemptionRecord, PodId};
use crate::ids::{ChainName, GroupName, VcName};

/// One pod's physical binding: the node plus its GPU indices, in the
/// same order as the preassigned-cell-type list.
#[derive(Debug, Clone)]
pub struct PodPlacement {
    pub node: String,
    pub gpu_indices: Vec<u32>,
    pub preassigned_cell_types: Vec<Level>,
}

/// `Schedule`'s result: either a binding instruction, a non-empty victim
/// set, or an empty "wait" result when no placement could be produced.
/// Placement soft failures take this shape rather than an error.
#[derive(Debug, Clone, Default)]
pub struct PodScheduleResult {
    pub placement: Option<PodPlacement>,
    pub slot_index: Option<usize>,
    pub priority: Option<CellPriority>,
    /// Victim node -> pod ids evicted to make room for this placement.
    pub victims: BTreeMap<String, Vec<PodId>>,
}

impl PodScheduleResult {
    pub fn wait() -> Self {
        Self::default()
    }
}

/// Per-cell status, for `ClusterStatus` snapshots.
#[derive(Debug, Clone)]
pub struct CellStatus {
    pub chain: ChainName,
    pub level: Level,
    pub leaves: Vec<GpuAddr>,
    pub healthy: bool,
    pub vc: Option<VcName>,
    pub priority: CellPriority,
    /// Used GPU counts at each priority across this cell's whole subtree
    /// (a leaf's own histogram is either empty or a single entry).
    pub histogram: BTreeMap<CellPriority, u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterStatus {
    pub cells: Vec<CellStatus>,
}

/// One VC's virtual placement entry, for `VcStatus` snapshots.
#[derive(Debug, Clone)]
pub struct VcCellPlacement {
    pub chain: ChainName,
    pub level: Level,
    pub bound_physical: Option<Vec<GpuAddr>>,
    pub healthy: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VcStatus {
    pub placements: Vec<VcCellPlacement>,
    pub lazy_preemptions: Vec<(GroupName, LazyPreemptionRecord)>,
}
