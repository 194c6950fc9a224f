//! Reference `IntraVcScheduler`/`OpportunisticScheduler` implementations.
//!
//! First-fit, not topology-optimal: good enough to exercise the cell
//! graph, free list, and mapper in this crate's own tests. A production
//! deployment supplies its own topology-aware search behind the same
//! traits.

use std::collections::BTreeMap;

use crate::cell::{CellState, PhysicalChain, VirtualCellId, VirtualForest};
use crate::freelist::ChainFreeList;

use super::{IntraVcScheduler, OpportunisticScheduler, PhysicalPlacement, VirtualPlacement};

fn partition<T: Copy>(mut leaves: Vec<T>, pod_numbers: &BTreeMap<u32, u32>) -> BTreeMap<u32, Vec<Vec<T>>> {
    let mut out = BTreeMap::new();
    for (&gpu_count, &pod_count) in pod_numbers {
        let mut pods = Vec::with_capacity(pod_count as usize);
        for _ in 0..pod_count {
            let split_at = gpu_count as usize;
            let rest = leaves.split_off(split_at.min(leaves.len()));
            pods.push(std::mem::replace(&mut leaves, rest));
        }
        out.insert(gpu_count, pods);
    }
    out
}

/// First-fit intra-VC scheduler: picks the smallest unbound quota root
/// (or the named reservation root, if it currently has enough free
/// leaves) with enough leaf capacity, then hands out its leaves to pods
/// in GPU-count order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstFitIntraVcScheduler;

impl IntraVcScheduler for FirstFitIntraVcScheduler {
    fn schedule(
        &self,
        chain: &PhysicalChain,
        forest: &VirtualForest,
        pod_numbers: &BTreeMap<u32, u32>,
        reservation: Option<VirtualCellId>,
    ) -> Option<VirtualPlacement> {
        let total_needed: u32 = pod_numbers.iter().map(|(&c, &n)| c * n).sum();
        if total_needed == 0 {
            return None;
        }

        let root = if let Some(res_root) = reservation {
            // A reservation's root is bound to its physical cell for the
            // engine's whole lifetime, so `bound_physical` is always
            // `Some` here and says nothing about whether it's in use.
            // Count the reservation's own free physical leaves instead.
            let phys_root = forest.cell(res_root).bound_physical?;
            let free = chain
                .leaves_of(phys_root)
                .iter()
                .filter(|&&leaf| chain.cell(leaf).state() == CellState::Free)
                .count() as u32;
            if free < total_needed {
                return None;
            }
            res_root
        } else {
            forest
                .quota_roots
                .iter()
                .find_map(|(_, roots)| {
                    roots.iter().copied().find(|&r| {
                        forest.cell(r).bound_physical.is_none()
                            && forest.leaves_of(r).len() as u32 >= total_needed
                    })
                })?
        };

        let leaves = forest.leaves_of(root);
        if (leaves.len() as u32) < total_needed {
            return None;
        }
        Some(partition(leaves, pod_numbers))
    }
}

/// First-fit opportunistic scheduler: grabs whatever free physical GPUs
/// exist in the chain, preferring healthy ones, ignoring VC accounting.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstFitOpportunisticScheduler;

impl OpportunisticScheduler for FirstFitOpportunisticScheduler {
    fn schedule(
        &self,
        chain: &PhysicalChain,
        free: &ChainFreeList,
        pod_numbers: &BTreeMap<u32, u32>,
    ) -> Option<PhysicalPlacement> {
        let total_needed: u32 = pod_numbers.iter().map(|(&c, &n)| c * n).sum();
        if total_needed == 0 {
            return None;
        }

        let mut leaves: Vec<_> = free
            .free_entries()
            .flat_map(|(_, id)| chain.leaves_of(id))
            .collect();
        leaves.sort_by_key(|&id| (!chain.cell(id).healthy, id));

        if (leaves.len() as u32) < total_needed {
            return None;
        }
        leaves.truncate(total_needed as usize);
        Some(partition(leaves, pod_numbers))
    }
}
