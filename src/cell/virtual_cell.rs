use crate::ids::{ChainName, VcName};

use super::{Level, PhysicalCellId, VirtualCellId};

/// A node in one VC's virtual tree for one chain.
///
/// `preassigned` names the ancestor virtual cell that represents the unit
/// of VC quota this cell belongs to; for the preassigned cell itself,
/// `preassigned == self`.
#[derive(Debug, Clone)]
pub struct VirtualCellNode {
    pub vc: VcName,
    pub chain: ChainName,
    pub level: Level,
    pub parent: Option<VirtualCellId>,
    pub children: Vec<VirtualCellId>,
    pub preassigned: VirtualCellId,
    pub bound_physical: Option<PhysicalCellId>,
    /// API-visible healthiness. Independent of the bound physical cell's
    /// healthiness while unbound: the health accountant may mark an
    /// unbound virtual cell "doomed-bad" when physical healthy capacity
    /// can no longer cover its VC's quota.
    pub healthy: bool,
    /// Set iff this cell is the root of a static reservation subtree.
    pub reservation: Option<String>,
}

impl VirtualCellNode {
    pub fn is_preassigned(&self, self_id: VirtualCellId) -> bool {
        self.preassigned == self_id
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}
