use std::collections::BTreeMap;

use crate::config::GpuAddr;
use crate::ids::{ChainName, GroupName};

use super::{CellPriority, CellState, Level, PhysicalCellId, VirtualCellId};

/// A node in one chain's physical tree.
///
/// `split == true` means this cell's children (not this cell itself) are
/// the ones that may appear in the free list.
#[derive(Debug, Clone)]
pub struct PhysicalCellNode {
    pub chain: ChainName,
    pub level: Level,
    pub parent: Option<PhysicalCellId>,
    /// Empty at leaves.
    pub children: Vec<PhysicalCellId>,
    /// The physical placement: every GPU leaf beneath this cell, in a
    /// fixed left-to-right order mirrored by virtual leaves bound to it.
    pub leaves: Vec<GpuAddr>,
    pub priority: CellPriority,
    /// Used GPU counts at each priority, for status reporting.
    pub histogram: BTreeMap<CellPriority, u32>,
    pub healthy: bool,
    pub split: bool,
    using_group: Option<GroupName>,
    acquiring_group: Option<GroupName>,
    pub bound_virtual: Option<(String /* vc */, VirtualCellId)>,
}

impl PhysicalCellNode {
    pub fn new(
        chain: ChainName,
        level: Level,
        parent: Option<PhysicalCellId>,
        leaves: Vec<GpuAddr>,
    ) -> Self {
        PhysicalCellNode {
            chain,
            level,
            parent,
            children: Vec::new(),
            leaves,
            priority: CellPriority::Free,
            histogram: BTreeMap::new(),
            // Nodes start bad until an explicit healthy signal arrives.
            healthy: false,
            split: false,
            using_group: None,
            acquiring_group: None,
            bound_virtual: None,
        }
    }

    /// The derived four-state preemption lifecycle state.
    pub fn state(&self) -> CellState {
        CellState::from_groups(self.using_group.is_some(), self.acquiring_group.is_some())
    }

    pub fn using_group(&self) -> Option<&GroupName> {
        self.using_group.as_ref()
    }

    pub fn acquiring_group(&self) -> Option<&GroupName> {
        self.acquiring_group.as_ref()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Free -> Used: a group begins using this cell outright (no victim).
    pub fn assign_used(&mut self, group: GroupName, priority: CellPriority) {
        debug_assert_eq!(self.state(), CellState::Free, "assign_used from non-Free state");
        self.using_group = Some(group);
        self.priority = priority;
    }

    /// Free -> Acquired: a preemptor takes this cell with no victim to
    /// displace.
    pub fn assign_acquired(&mut self, preemptor: GroupName) {
        debug_assert_eq!(self.state(), CellState::Free, "assign_acquired from non-Free state");
        self.acquiring_group = Some(preemptor);
    }

    /// Used -> Acquiring: `preemptor` begins preempting the current
    /// using-group.
    pub fn begin_acquiring(&mut self, preemptor: GroupName) {
        debug_assert_eq!(self.state(), CellState::Used, "begin_acquiring from non-Used state");
        self.acquiring_group = Some(preemptor);
    }

    /// Acquiring -> Used: preemption cancelled, the original using-group
    /// keeps the cell.
    pub fn cancel_acquiring(&mut self) {
        debug_assert_eq!(self.state(), CellState::Acquiring, "cancel_acquiring from non-Acquiring state");
        self.acquiring_group = None;
    }

    /// Acquired -> Free: preemption cancelled, nobody held the cell yet.
    pub fn cancel_acquired(&mut self) {
        debug_assert_eq!(self.state(), CellState::Acquired, "cancel_acquired from non-Acquired state");
        self.acquiring_group = None;
    }

    /// Acquiring | Acquired -> Used: victim pods fully deleted, the
    /// preemptor becomes the new owner.
    pub fn settle_acquired(&mut self, priority: CellPriority) {
        let state = self.state();
        debug_assert!(
            matches!(state, CellState::Acquiring | CellState::Acquired),
            "settle_acquired from {state:?}"
        );
        self.using_group = self.acquiring_group.take();
        self.priority = priority;
    }

    /// Used -> Free: last pod deleted.
    pub fn release(&mut self) {
        debug_assert_eq!(self.state(), CellState::Used, "release from non-Used state");
        self.using_group = None;
        self.priority = CellPriority::Free;
    }

    /// Guaranteed -> Opportunistic demotion in place, keeping the same
    /// using-group.
    pub fn demote_to_opportunistic(&mut self) {
        debug_assert_eq!(self.state(), CellState::Used, "demote_to_opportunistic from non-Used state");
        self.priority = CellPriority::Opportunistic;
    }
}
