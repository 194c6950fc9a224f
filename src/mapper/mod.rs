//! Virtual -> physical projection: walk a virtual placement down to
//! concrete physical cells, choosing fresh physical ancestors for
//! not-yet-bound VC quota units and resolving contention within
//! already-bound ones.
//!
//! A freshly chosen (previously unbound) preassigned ancestor is always
//! entirely free — the free list never exposes a partially-occupied
//! subtree as a whole unit — so preemption only ever happens within an
//! *already-bound* ancestor, where a different group may already hold
//! some of its leaves. The resolution below runs in two passes: first
//! resolve every virtual leaf to a physical leaf (recording any victim),
//! then commit cell-state transitions together, because whether a free
//! leaf becomes `Used` or `Acquired` depends on whether *any* leaf in the
//! whole group's placement had a victim.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::cell::{CellGraph, CellPriority, CellState, Level, PhysicalCellId, VirtualCellId};
use crate::freelist::FreeList;
use crate::group::{self, AffinityGroup};
use crate::ids::GroupName;
use crate::scheduler::{PhysicalPlacement, VirtualPlacement};

/// The result of a successful mapping: the physical placement and, for
/// any group whose cells were taken to make room, the cells taken from
/// it.
#[derive(Debug, Clone)]
pub struct MapOutcome {
    pub physical: PhysicalPlacement,
    pub victims: BTreeMap<GroupName, Vec<PhysicalCellId>>,
    pub has_victims: bool,
}

/// Resolve `placement` (a virtual placement for `new_group` in `vc`) down
/// to physical cells, mutating the graph/free list/group table in place.
/// Returns `None` (a soft failure, not an error) if any virtual leaf
/// cannot be resolved; all bindings made during the attempt are then
/// undone.
#[allow(clippy::too_many_arguments)]
pub fn map(
    graph: &mut CellGraph,
    freelist: &mut FreeList,
    groups: &mut BTreeMap<GroupName, AffinityGroup>,
    vc: &str,
    chain_name: &str,
    new_group: &str,
    new_priority: CellPriority,
    now: SystemTime,
    placement: &VirtualPlacement,
) -> Option<MapOutcome> {
    let mut newly_bound: Vec<(VirtualCellId, PhysicalCellId, Level)> = Vec::new();
    let mut resolved: BTreeMap<u32, Vec<Vec<(PhysicalCellId, Option<GroupName>)>>> = BTreeMap::new();

    for (&gpu_count, pods) in placement {
        let mut pod_results = Vec::with_capacity(pods.len());
        for pod_leaves in pods {
            let mut cells = Vec::with_capacity(pod_leaves.len());
            for &vleaf in pod_leaves {
                match resolve_leaf(
                    graph, freelist, groups, vc, chain_name, new_priority, new_group, now, vleaf,
                    &mut newly_bound,
                ) {
                    Ok(r) => cells.push(r),
                    Err(()) => {
                        rollback(graph, freelist, vc, chain_name, &newly_bound);
                        return None;
                    }
                }
            }
            pod_results.push(cells);
        }
        resolved.insert(gpu_count, pod_results);
    }

    let has_any_victim = resolved
        .values()
        .flatten()
        .flatten()
        .any(|(_, victim)| victim.is_some());

    let mut physical: PhysicalPlacement = BTreeMap::new();
    let mut victims: BTreeMap<GroupName, Vec<PhysicalCellId>> = BTreeMap::new();

    for (gpu_count, pods) in resolved {
        let mut phys_pods = Vec::with_capacity(pods.len());
        for pod in pods {
            let mut cells = Vec::with_capacity(pod.len());
            for (phys_leaf, victim) in pod {
                commit_cell(graph, groups, chain_name, new_group, new_priority, has_any_victim, phys_leaf, &victim);
                if let Some(v) = victim {
                    victims.entry(v).or_default().push(phys_leaf);
                }
                cells.push(phys_leaf);
            }
            phys_pods.push(cells);
        }
        physical.insert(gpu_count, phys_pods);
    }

    Some(MapOutcome { physical, victims, has_victims: has_any_victim })
}

#[allow(clippy::too_many_arguments)]
fn resolve_leaf(
    graph: &mut CellGraph,
    freelist: &mut FreeList,
    groups: &mut BTreeMap<GroupName, AffinityGroup>,
    vc: &str,
    chain_name: &str,
    new_priority: CellPriority,
    new_group: &str,
    now: SystemTime,
    virtual_leaf: VirtualCellId,
    newly_bound: &mut Vec<(VirtualCellId, PhysicalCellId, Level)>,
) -> Result<(PhysicalCellId, Option<GroupName>), ()> {
    let forest = graph.virtual_forest(vc, chain_name).ok_or(())?;
    let ancestor = forest.cell(virtual_leaf).preassigned;
    let already_bound = forest.cell(ancestor).bound_physical;

    let phys_ancestor = if let Some(bound) = already_bound {
        bound
    } else {
        let level = forest.cell(ancestor).level;
        let phys_id = freelist.find_or_split(chain_name, graph, level).ok_or(())?;
        freelist.take(chain_name, graph, phys_id);
        freelist.bind_quota(chain_name, vc, level, graph);
        graph.bind_preassigned(vc, chain_name, ancestor, phys_id);
        newly_bound.push((ancestor, phys_id, level));
        phys_id
    };

    let forest = graph.virtual_forest(vc, chain_name).unwrap();
    let path = leaf_path(forest, virtual_leaf, ancestor);
    let chain = graph.chain(chain_name).unwrap();
    let phys_leaf = descend(chain, phys_ancestor, &path);

    if already_bound.is_none() {
        // A brand-new preassigned ancestor is, by construction, entirely
        // free — no occupant to resolve.
        return Ok((phys_leaf, None));
    }

    loop {
        let state = graph.chain(chain_name).unwrap().cell(phys_leaf).state();
        match state {
            CellState::Free => return Ok((phys_leaf, None)),
            CellState::Used => {
                let occupant = graph
                    .chain(chain_name)
                    .unwrap()
                    .cell(phys_leaf)
                    .using_group()
                    .cloned()
                    .unwrap();
                let occupant_priority = groups.get(&occupant).map(|g| g.priority).unwrap_or(CellPriority::Free);
                if !occupant_priority.preemptable_by(new_priority) {
                    return Err(());
                }
                let lazy_ok = groups
                    .get(&occupant)
                    .map(|g| g.lazy_preemption_enable && g.priority.is_guaranteed())
                    .unwrap_or(false);
                if lazy_ok {
                    if let Some(g) = groups.get_mut(&occupant) {
                        g.lazy_preempt(new_group.to_string(), now);
                    }
                    graph.chain_mut(chain_name).unwrap().demote_to_opportunistic(phys_leaf);
                }
                return Ok((phys_leaf, Some(occupant)));
            }
            CellState::Acquiring | CellState::Acquired => {
                let preemptor = graph
                    .chain(chain_name)
                    .unwrap()
                    .cell(phys_leaf)
                    .acquiring_group()
                    .cloned()
                    .unwrap();
                let preemptor_priority = groups.get(&preemptor).map(|g| g.priority).unwrap_or(CellPriority::Free);
                if preemptor_priority >= new_priority {
                    return Err(());
                }
                group::cancel_preemptor(groups, graph, chain_name, &preemptor);
                continue;
            }
        }
    }
}

fn commit_cell(
    graph: &mut CellGraph,
    groups: &mut BTreeMap<GroupName, AffinityGroup>,
    chain_name: &str,
    new_group: &str,
    new_priority: CellPriority,
    has_any_victim: bool,
    phys_leaf: PhysicalCellId,
    victim: &Option<GroupName>,
) {
    if has_any_victim {
        let cell = graph.chain_mut(chain_name).unwrap().cell_mut(phys_leaf);
        match victim {
            Some(_) => cell.begin_acquiring(new_group.to_string()),
            None => cell.assign_acquired(new_group.to_string()),
        }
    } else {
        graph.chain_mut(chain_name).unwrap().assign_used(phys_leaf, new_group.to_string(), new_priority);
    }
    if let Some(v) = victim {
        if let Some(g) = groups.get_mut(v) {
            g.begin_being_preempted();
        }
    }
}

fn rollback(
    graph: &mut CellGraph,
    freelist: &mut FreeList,
    vc: &str,
    chain_name: &str,
    newly_bound: &[(VirtualCellId, PhysicalCellId, Level)],
) {
    for &(ancestor, phys_id, level) in newly_bound.iter().rev() {
        graph.unbind_preassigned(vc, chain_name, ancestor);
        freelist.unbind_quota(chain_name, vc, level, graph);
        freelist.release(chain_name, graph, phys_id);
    }
}

fn leaf_path(forest: &crate::cell::VirtualForest, leaf: VirtualCellId, ancestor: VirtualCellId) -> Vec<usize> {
    let mut path = Vec::new();
    let mut current = leaf;
    while current != ancestor {
        let parent = forest.cell(current).parent.expect("leaf under ancestor's subtree");
        let idx = forest
            .cell(parent)
            .children
            .iter()
            .position(|&c| c == current)
            .expect("child indexed under its parent");
        path.push(idx);
        current = parent;
    }
    path.reverse();
    path
}

fn descend(chain: &crate::cell::PhysicalChain, ancestor: PhysicalCellId, path: &[usize]) -> PhysicalCellId {
    let mut current = ancestor;
    for &idx in path {
        current = chain.cell(current).children[idx];
    }
    current
}
