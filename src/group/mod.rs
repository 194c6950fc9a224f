//! Affinity groups: gangs of pods that share a placement and move through
//! the allocated/preempting/being-preempted lifecycle together.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::cell::{CellGraph, CellPriority, CellState, PhysicalCellId, VirtualCellId};
use crate::ids::GroupName;

/// Identifies one pod within a group: its GPU-count bucket and slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodSlot {
    pub gpu_count: u32,
    pub index: usize,
}

/// An opaque pod identity, supplied by the caller (namespace/name or
/// equivalent — the host scheduler-extender's concern, not ours).
pub type PodId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Allocated,
    Preempting,
    BeingPreempted,
}

/// A lazy-preemption record attached when a group is demoted in place.
#[derive(Debug, Clone)]
pub struct LazyPreemptionRecord {
    pub preemptor: GroupName,
    pub at: SystemTime,
}

/// One affinity group: a gang of pods scheduled (or being preempted)
/// together.
#[derive(Debug, Clone)]
pub struct AffinityGroup {
    pub name: GroupName,
    pub vc: String,
    pub chain: String,
    pub priority: CellPriority,
    pub gang_release: bool,
    pub lazy_preemption_enable: bool,
    pub state: GroupState,
    /// Expected pod count per GPU-count bucket.
    pub pod_numbers: BTreeMap<u32, u32>,
    /// Bound pod id per slot; `None` means the slot is open.
    pub allocated_pods: BTreeMap<u32, Vec<Option<PodId>>>,
    /// Physical GPU cells backing each slot, parallel to `allocated_pods`.
    pub physical_placement: BTreeMap<u32, Vec<Vec<PhysicalCellId>>>,
    /// Virtual GPU cells backing each slot; cleared by lazy-preemption.
    pub virtual_placement: Option<BTreeMap<u32, Vec<Vec<VirtualCellId>>>>,
    pub lazy_preemption: Option<LazyPreemptionRecord>,
    /// Pod ids currently preempting as this group (only meaningful while
    /// `state == Preempting`).
    pub preemptor_pods: std::collections::BTreeSet<PodId>,
    /// Victim group -> cells taken from it, recorded when this group was
    /// created as a preemptor, so a repeated `Schedule` call against a
    /// still-`Preempting` group can report the same outstanding set.
    pub victims: BTreeMap<GroupName, Vec<PhysicalCellId>>,
}

impl AffinityGroup {
    pub fn new_allocated(
        name: GroupName,
        vc: String,
        chain: String,
        priority: CellPriority,
        gang_release: bool,
        lazy_preemption_enable: bool,
        pod_numbers: BTreeMap<u32, u32>,
    ) -> Self {
        let allocated_pods = pod_numbers
            .iter()
            .map(|(&count, &n)| (count, vec![None; n as usize]))
            .collect();
        AffinityGroup {
            name,
            vc,
            chain,
            priority,
            gang_release,
            lazy_preemption_enable,
            state: GroupState::Allocated,
            pod_numbers,
            allocated_pods,
            physical_placement: BTreeMap::new(),
            virtual_placement: Some(BTreeMap::new()),
            lazy_preemption: None,
            preemptor_pods: std::collections::BTreeSet::new(),
            victims: BTreeMap::new(),
        }
    }

    /// First open slot for `gpu_count`, if any.
    pub fn first_open_slot(&self, gpu_count: u32) -> Option<usize> {
        self.allocated_pods
            .get(&gpu_count)?
            .iter()
            .position(Option::is_none)
    }

    pub fn bind_slot(&mut self, gpu_count: u32, index: usize, pod: PodId) {
        if let Some(slots) = self.allocated_pods.get_mut(&gpu_count) {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(pod);
            }
        }
    }

    pub fn clear_slot(&mut self, gpu_count: u32, index: usize) {
        if let Some(slots) = self.allocated_pods.get_mut(&gpu_count) {
            if let Some(slot) = slots.get_mut(index) {
                *slot = None;
            }
        }
        if let Some(cells) = self.physical_placement.get_mut(&gpu_count) {
            if index < cells.len() {
                cells[index].clear();
            }
        }
    }

    /// `true` once every slot across every GPU-count bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.allocated_pods.values().all(|slots| slots.iter().all(Option::is_none))
    }

    pub fn all_cells(&self) -> impl Iterator<Item = PhysicalCellId> + '_ {
        self.physical_placement.values().flatten().flatten().copied()
    }

    /// Demote from guaranteed to opportunistic in place: clears the
    /// virtual placement and records the preemptor, but keeps the
    /// physical placement untouched — the pods keep running.
    pub fn lazy_preempt(&mut self, preemptor: GroupName, at: SystemTime) {
        self.priority = CellPriority::Opportunistic;
        self.virtual_placement = None;
        self.lazy_preemption = Some(LazyPreemptionRecord { preemptor, at });
    }

    pub fn begin_being_preempted(&mut self) {
        self.state = GroupState::BeingPreempted;
    }
}

/// Cancel a preemptor group outright: every cell it was acquiring reverts
/// (Acquiring -> Used, handing the cell back to the original owner, which
/// returns to `Allocated`; Acquired -> Free), then the preemptor itself is
/// removed.
///
/// A preempting group's acquire set is treated as all-or-nothing here: a
/// higher-priority request stealing even one of its cells cancels the
/// whole group, rather than leaving it half-preempting.
pub fn cancel_preemptor(
    groups: &mut BTreeMap<GroupName, AffinityGroup>,
    graph: &mut CellGraph,
    chain_name: &str,
    name: &str,
) {
    let Some(group) = groups.get(name) else {
        return;
    };
    let cells: Vec<PhysicalCellId> = group.all_cells().collect();
    for cell_id in cells {
        let chain = match graph.chain_mut(chain_name) {
            Some(c) => c,
            None => continue,
        };
        let cell = chain.cell_mut(cell_id);
        match cell.state() {
            CellState::Acquiring => {
                let victim = cell.using_group().cloned();
                cell.cancel_acquiring();
                if let Some(v) = victim {
                    if let Some(vg) = groups.get_mut(&v) {
                        vg.state = GroupState::Allocated;
                    }
                }
            }
            CellState::Acquired => cell.cancel_acquired(),
            _ => {}
        }
    }
    groups.remove(name);
}
