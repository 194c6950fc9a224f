//! The two scheduling capabilities the facade delegates to: per-VC
//! topology-aware placement and opportunistic placement. Both are
//! injected traits rather than an inheritance hierarchy, so the actual
//! search heuristic stays swappable — [`simple`] supplies a reference
//! implementation good enough to drive this crate's own tests, not a
//! production search engine.

pub mod simple;

use std::collections::BTreeMap;

use crate::cell::{PhysicalCellId, PhysicalChain, VirtualCellId, VirtualForest};
use crate::freelist::ChainFreeList;

/// GPU-count bucket -> per-pod list of cells, one list per pod in that
/// bucket, each list `gpu_count` long.
pub type Placement<Id> = BTreeMap<u32, Vec<Vec<Id>>>;

pub type VirtualPlacement = Placement<VirtualCellId>;
pub type PhysicalPlacement = Placement<PhysicalCellId>;

/// Produces a virtual placement for a request within one VC, honoring
/// topology affinity. `reservation` scopes the search to that
/// reservation's subtree when the request named one. `chain` is the
/// physical side of the same (VC, chain) pair, needed to judge a
/// reservation's current free capacity: a reservation's root is bound to
/// its physical cell for the engine's whole lifetime, so `bound_physical`
/// can't tell a free reservation from an occupied one — only the physical
/// leaves' own cell state can.
pub trait IntraVcScheduler: Send + Sync {
    fn schedule(
        &self,
        chain: &PhysicalChain,
        forest: &VirtualForest,
        pod_numbers: &BTreeMap<u32, u32>,
        reservation: Option<VirtualCellId>,
    ) -> Option<VirtualPlacement>;
}

/// Produces a physical placement directly from any free physical GPUs in
/// a chain, ignoring VC accounting entirely.
pub trait OpportunisticScheduler: Send + Sync {
    fn schedule(
        &self,
        chain: &PhysicalChain,
        free: &ChainFreeList,
        pod_numbers: &BTreeMap<u32, u32>,
    ) -> Option<PhysicalPlacement>;
}
