//! Per-chain, per-level bookkeeping: the buddy-style free list and the
//! five counters it maintains.
//!
//! Splitting a cell conserves capacity at every level finer than the
//! split itself, but the split level's own count drops by one the
//! instant the parent stops being an assemblable whole (merging is the
//! reverse). Allocating (`take`) or freeing (`release`) a cell changes
//! `total_left`/`bad_free` at its own level and every finer level, using
//! the exact per-level counts of its subtree. `vc_free` is touched only
//! by binding and unbinding a VC's preassigned quota cells.

use std::collections::BTreeMap;

use crate::cell::{CellGraph, Level, PhysicalCellId, PhysicalChain};
use crate::config::ClusterConfig;
use crate::ids::{ChainName, VcName};

/// The five counters tracked at one (chain, level).
#[derive(Debug, Clone, Default)]
pub struct LevelCounters {
    /// Free physical capacity at this level, cluster-wide for the chain.
    pub total_left: u32,
    /// Of `total_left`, how much is currently unhealthy.
    pub bad_free: u32,
    /// Per-VC free (unbound) quota at this level.
    pub vc_free: BTreeMap<VcName, u32>,
    /// Sum of `vc_free` across VCs.
    pub all_vc_free: u32,
    /// Per-VC count of virtual cells marked doomed-bad at this level.
    pub doomed_bad: BTreeMap<VcName, u32>,
}

impl LevelCounters {
    fn vc_free(&self, vc: &str) -> u32 {
        self.vc_free.get(vc).copied().unwrap_or(0)
    }

    fn doomed_bad(&self, vc: &str) -> u32 {
        self.doomed_bad.get(vc).copied().unwrap_or(0)
    }

    /// `doomedBad = max(0, vcFree - (totalLeft - badFree))`.
    fn wanted_doomed_bad(&self, vc: &str) -> u32 {
        let healthy_left = self.total_left.saturating_sub(self.bad_free);
        self.vc_free(vc).saturating_sub(healthy_left)
    }
}

/// One chain's free list and counters, per level.
#[derive(Debug, Clone, Default)]
pub struct ChainFreeList {
    /// Free physical cell ids per level, in insertion order — this order
    /// is the deterministic tie-break the mapper and the doomed-bad
    /// marker both rely on.
    free: BTreeMap<Level, Vec<PhysicalCellId>>,
    pub counters: BTreeMap<Level, LevelCounters>,
    /// Virtual cells currently marked doomed-bad per (VC, level), in the
    /// order they were marked, so unmarking is deterministic LIFO.
    doomed_marks: BTreeMap<(VcName, Level), Vec<crate::cell::VirtualCellId>>,
}

impl ChainFreeList {
    pub fn free_at(&self, level: Level) -> &[PhysicalCellId] {
        self.free.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn counters_at(&self, level: Level) -> LevelCounters {
        self.counters.get(&level).cloned().unwrap_or_default()
    }

    /// Every currently free entry, at any level, in deterministic order.
    pub fn free_entries(&self) -> impl Iterator<Item = (Level, PhysicalCellId)> + '_ {
        self.free.iter().flat_map(|(&level, ids)| ids.iter().map(move |&id| (level, id)))
    }

    pub(crate) fn counters_mut(&mut self, level: Level) -> &mut LevelCounters {
        self.counters.entry(level).or_default()
    }
}

/// Picks the first healthy cell in `ids`, falling back to the first
/// entry (healthy or not) when every entry is currently unhealthy.
/// `ids` keeps insertion order, so this is still a deterministic
/// first-fit search, just with a healthy-over-bad tie-break ahead of it.
fn pick_healthy_first(ids: &[PhysicalCellId], chain: &PhysicalChain) -> Option<PhysicalCellId> {
    ids.iter().copied().find(|&id| chain.cell(id).healthy).or_else(|| ids.first().copied())
}

/// The whole engine's free-list state, one [`ChainFreeList`] per chain.
#[derive(Debug, Clone, Default)]
pub struct FreeList {
    chains: BTreeMap<ChainName, ChainFreeList>,
}

impl FreeList {
    /// Build initial counters from a freshly constructed graph: every root
    /// starts free and unsplit, every cell starts unhealthy, and every
    /// VC's quota starts fully unbound.
    pub fn build(config: &ClusterConfig, graph: &CellGraph) -> Self {
        let mut chains = BTreeMap::new();
        for (chain_name, chain) in graph.chains() {
            let mut cfl = ChainFreeList::default();
            for id in chain.ids() {
                let node = chain.cell(id);
                let counters = cfl.counters_mut(node.level);
                counters.total_left += 1;
                if !node.healthy {
                    counters.bad_free += 1;
                }
            }
            for &root in &chain.roots {
                cfl.free.entry(chain.cell(root).level).or_default().push(root);
            }
            chains.insert(chain_name.clone(), cfl);
        }

        let mut free_list = FreeList { chains };
        for (vc_name, vc_cfg) in &config.vcs {
            for (chain_name, by_level) in &vc_cfg.quota {
                let Some(cfl) = free_list.chains.get_mut(chain_name) else {
                    continue;
                };
                for (&level, &count) in by_level {
                    let counters = cfl.counters_mut(level);
                    counters.vc_free.insert(vc_name.clone(), count);
                    counters.all_vc_free += count;
                }
            }
            for res in vc_cfg.reservations.values() {
                // Reservations are bound at construction and never counted
                // as free VC quota.
                let _ = res;
            }
        }
        for cfl in free_list.chains.values_mut() {
            for counters in cfl.counters.values_mut() {
                for vc_name in counters.vc_free.keys().cloned().collect::<Vec<_>>() {
                    let wanted = counters.wanted_doomed_bad(&vc_name);
                    if wanted > 0 {
                        counters.doomed_bad.insert(vc_name, wanted);
                    }
                }
            }
        }
        free_list
    }

    pub fn chain(&self, name: &str) -> Option<&ChainFreeList> {
        self.chains.get(name)
    }

    pub fn chain_mut(&mut self, name: &str) -> Option<&mut ChainFreeList> {
        self.chains.get_mut(name)
    }

    /// Find a free cell at `level`, splitting ancestors down from the
    /// nearest free cell above if none is free at `level` itself, healthy
    /// cells preferred over bad ones at every choice point. Returns `None`
    /// if the chain has no free capacity at or above `level`.
    pub fn find_or_split(&mut self, chain_name: &str, graph: &mut CellGraph, level: Level) -> Option<PhysicalCellId> {
        let cfl = self.chains.get(chain_name)?;
        let chain = graph.chain(chain_name)?;
        if let Some(id) = pick_healthy_first(cfl.free_at(level), chain) {
            return Some(id);
        }
        let root_level = chain.config.root_level();
        let mut above = level + 1;
        while above <= root_level {
            let cfl = self.chains.get(chain_name)?;
            let chain = graph.chain(chain_name)?;
            if let Some(id) = pick_healthy_first(cfl.free_at(above), chain) {
                let mut current = id;
                for l in (level..above).rev() {
                    current = self.split_one(chain_name, graph, current)?;
                    let _ = l;
                }
                return Some(current);
            }
            above += 1;
        }
        None
    }

    /// Split `id` into its children, removing `id` from the free list and
    /// exposing its children instead. Returns the first healthy child, or
    /// the leftmost child if none are healthy. `total_left`/`bad_free` at
    /// `id`'s own level drop by one; finer levels are unaffected.
    fn split_one(&mut self, chain_name: &str, graph: &mut CellGraph, id: PhysicalCellId) -> Option<PhysicalCellId> {
        let chain = graph.chain_mut(chain_name)?;
        let level = chain.cell(id).level;
        let children = chain.cell(id).children.clone();
        if children.is_empty() {
            return None;
        }
        let was_bad = !chain.cell(id).healthy;
        chain.cell_mut(id).split = true;

        let cfl = self.chains.get_mut(chain_name)?;
        if let Some(v) = cfl.free.get_mut(&level) {
            v.retain(|&x| x != id);
        }
        let child_level = chain.cell(children[0]).level;
        cfl.free.entry(child_level).or_default().extend(children.iter().copied());
        let preferred = pick_healthy_first(&children, chain).unwrap_or(children[0]);

        // The parent stops being an assemblable whole unit at its own
        // level the instant it's split, even though its descendants'
        // capacity is conserved at every finer level.
        let counters = cfl.counters_mut(level);
        counters.total_left -= 1;
        if was_bad {
            counters.bad_free -= 1;
        }
        Some(preferred)
    }

    /// Merge `parent` back from its children if every child is present in
    /// the free list (unbound/unallocated). Recurses upward. No-op, and
    /// returns `false`, if the children aren't all free.
    pub fn try_merge(&mut self, chain_name: &str, graph: &mut CellGraph, parent: PhysicalCellId) -> bool {
        let Some(chain) = graph.chain(chain_name) else {
            return false;
        };
        let node = chain.cell(parent);
        if node.children.is_empty() {
            return false;
        }
        let child_level = chain.cell(node.children[0]).level;
        let children = node.children.clone();
        let level = node.level;

        let Some(cfl) = self.chains.get(chain_name) else {
            return false;
        };
        let free_children = cfl.free_at(child_level);
        if !children.iter().all(|c| free_children.contains(c)) {
            return false;
        }

        let chain = graph.chain_mut(chain_name).unwrap();
        let now_bad = !chain.cell(parent).healthy;
        chain.cell_mut(parent).split = false;
        let cfl = self.chains.get_mut(chain_name).unwrap();
        if let Some(v) = cfl.free.get_mut(&child_level) {
            v.retain(|c| !children.contains(c));
        }
        cfl.free.entry(level).or_default().push(parent);
        let counters = cfl.counters_mut(level);
        counters.total_left += 1;
        if now_bad {
            counters.bad_free += 1;
        }

        if let Some(grandparent) = graph.chain(chain_name).unwrap().cell(parent).parent {
            self.try_merge(chain_name, graph, grandparent);
        }
        true
    }

    /// Remove `id` from the free list at `level` and decrement
    /// `total_left`/`bad_free` at every level `<= level` by the exact
    /// per-level subtree counts.
    pub fn take(&mut self, chain_name: &str, graph: &CellGraph, id: PhysicalCellId) {
        let chain = graph.chain(chain_name).expect("take: unknown chain");
        let level = chain.cell(id).level;
        let counts = chain.subtree_counts(id);

        let cfl = self.chains.get_mut(chain_name).expect("take: unknown chain");
        if let Some(v) = cfl.free.get_mut(&level) {
            v.retain(|&x| x != id);
        }
        for (&m, &(total, bad)) in &counts {
            let counters = cfl.counters_mut(m);
            counters.total_left -= total;
            counters.bad_free -= bad;
        }
    }

    /// Inverse of [`Self::take`]: re-adds `id` to the free list and
    /// restores `total_left`/`bad_free`, then attempts an upward merge.
    pub fn release(&mut self, chain_name: &str, graph: &mut CellGraph, id: PhysicalCellId) {
        let chain = graph.chain(chain_name).expect("release: unknown chain");
        let level = chain.cell(id).level;
        let counts = chain.subtree_counts(id);
        let parent = chain.cell(id).parent;

        let cfl = self.chains.get_mut(chain_name).expect("release: unknown chain");
        for (&m, &(total, bad)) in &counts {
            let counters = cfl.counters_mut(m);
            counters.total_left += total;
            counters.bad_free += bad;
        }
        cfl.free.entry(level).or_default().push(id);

        if let Some(parent_id) = parent {
            self.try_merge(chain_name, graph, parent_id);
        }
    }

    /// Record that `vc` has bound one of its free quota cells at
    /// (chain, level), decrementing `vc_free`/`all_vc_free` and
    /// recomputing doomed-bad for every VC at that level.
    pub fn bind_quota(&mut self, chain_name: &str, vc: &str, level: Level, graph: &CellGraph) {
        let cfl = self.chains.get_mut(chain_name).expect("bind_quota: unknown chain");
        let counters = cfl.counters_mut(level);
        let entry = counters.vc_free.entry(vc.to_string()).or_insert(0);
        *entry = entry.saturating_sub(1);
        counters.all_vc_free = counters.all_vc_free.saturating_sub(1);
        drop(counters);
        self.recompute_doomed_bad(chain_name, level, graph);
    }

    /// Inverse of [`Self::bind_quota`].
    pub fn unbind_quota(&mut self, chain_name: &str, vc: &str, level: Level, graph: &CellGraph) {
        let cfl = self.chains.get_mut(chain_name).expect("unbind_quota: unknown chain");
        let counters = cfl.counters_mut(level);
        *counters.vc_free.entry(vc.to_string()).or_insert(0) += 1;
        counters.all_vc_free += 1;
        drop(counters);
        self.recompute_doomed_bad(chain_name, level, graph);
    }

    /// Recompute `doomed_bad` for every VC at (chain, level) against the
    /// current counters, returning virtual cells that need to flip
    /// healthy (newly marked, to `false`) or unhealthy (newly unmarked,
    /// back to `true`) so the caller can apply it to the virtual forest.
    pub fn recompute_doomed_bad(
        &mut self,
        chain_name: &str,
        level: Level,
        graph: &CellGraph,
    ) -> DoomedBadDelta {
        let mut delta = DoomedBadDelta::default();
        let Some(cfl) = self.chains.get_mut(chain_name) else {
            return delta;
        };
        let vcs: Vec<String> = cfl
            .counters
            .get(&level)
            .map(|c| c.vc_free.keys().cloned().collect())
            .unwrap_or_default();

        for vc in vcs {
            let wanted = {
                let counters = cfl.counters.get(&level).cloned().unwrap_or_default();
                counters.wanted_doomed_bad(&vc)
            };
            let current = cfl
                .counters
                .get(&level)
                .map(|c| c.doomed_bad(&vc))
                .unwrap_or(0);
            let marks = cfl.doomed_marks.entry((vc.clone(), level)).or_default();

            if wanted > current {
                let Some(forest) = graph.virtual_forest(&vc, chain_name) else {
                    continue;
                };
                let candidates: Vec<crate::cell::VirtualCellId> = forest
                    .quota_roots
                    .get(&level)
                    .into_iter()
                    .flatten()
                    .copied()
                    .filter(|&v| forest.cell(v).bound_physical.is_none() && forest.cell(v).healthy)
                    .collect();
                for &v in candidates.iter().take((wanted - current) as usize) {
                    marks.push(v);
                    delta.newly_doomed.push((vc.clone(), v));
                }
            } else if current > wanted {
                let to_unmark = (current - wanted) as usize;
                for _ in 0..to_unmark {
                    if let Some(v) = marks.pop() {
                        delta.newly_healthy.push((vc.clone(), v));
                    }
                }
            }

            cfl.counters
                .get_mut(&level)
                .unwrap()
                .doomed_bad
                .insert(vc, marks.len() as u32);
        }
        delta
    }
}

/// Virtual cells that must flip healthy/unhealthy after a counter change,
/// returned so the health accountant can apply them without the free
/// list needing a mutable reference to the forest it just read from.
#[derive(Debug, Clone, Default)]
pub struct DoomedBadDelta {
    pub newly_doomed: Vec<(VcName, crate::cell::VirtualCellId)>,
    pub newly_healthy: Vec<(VcName, crate::cell::VirtualCellId)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainConfig, ClusterConfig, GpuAddr, LevelSpec, PhysicalRootSpec, VcConfig};

    fn two_level_config() -> ClusterConfig {
        let roots = vec![PhysicalRootSpec {
            leaves: (0..4)
                .map(|i| GpuAddr { node: "node-0".to_string(), index: i })
                .collect(),
        }];
        let chain = ChainConfig {
            name: "a100".to_string(),
            levels: vec![
                LevelSpec { cell_type: "gpu".to_string(), fan_out: 0 },
                LevelSpec { cell_type: "node".to_string(), fan_out: 4 },
            ],
            gpu_type: "A100".to_string(),
            roots,
        };
        let mut chains = BTreeMap::new();
        chains.insert("a100".to_string(), chain);
        let mut quota = BTreeMap::new();
        quota.insert("a100".to_string(), BTreeMap::from([(1, 2)]));
        let mut vcs = BTreeMap::new();
        vcs.insert("vc-a".to_string(), VcConfig { name: "vc-a".to_string(), quota, reservations: BTreeMap::new() });
        ClusterConfig { chains, vcs, gpu_type_index: BTreeMap::new(), min_guaranteed_priority: 0 }
    }

    fn two_root_config() -> ClusterConfig {
        let roots = (0..2)
            .map(|r| PhysicalRootSpec {
                leaves: (0..4).map(|i| GpuAddr { node: format!("node-{r}"), index: i }).collect(),
            })
            .collect();
        let chain = ChainConfig {
            name: "a100".to_string(),
            levels: vec![
                LevelSpec { cell_type: "gpu".to_string(), fan_out: 0 },
                LevelSpec { cell_type: "node".to_string(), fan_out: 4 },
            ],
            gpu_type: "A100".to_string(),
            roots,
        };
        let mut chains = BTreeMap::new();
        chains.insert("a100".to_string(), chain);
        let mut vcs = BTreeMap::new();
        vcs.insert("vc-a".to_string(), VcConfig { name: "vc-a".to_string(), quota: BTreeMap::new(), reservations: BTreeMap::new() });
        ClusterConfig { chains, vcs, gpu_type_index: BTreeMap::new(), min_guaranteed_priority: 0 }
    }

    #[test]
    fn find_or_split_prefers_healthy_over_leftmost() {
        use crate::health::HealthAccountant;

        let cfg = two_root_config();
        let mut graph = CellGraph::build(&cfg);
        let mut fl = FreeList::build(&cfg, &graph);
        // Both roots start bad; only the second (node-1) is marked healthy,
        // even though the first root is the leftmost/earliest free entry.
        HealthAccountant.set_healthy_node(&mut graph, &mut fl, "a100", "node-1");
        let root = fl.find_or_split("a100", &mut graph, 2).unwrap();
        let chain = graph.chain("a100").unwrap();
        let leaves = chain.leaves_of(root);
        assert!(leaves.iter().all(|&l| chain.cell(l).leaves[0].node == "node-1"));
    }

    #[test]
    fn initial_counters_all_bad() {
        let cfg = two_level_config();
        let graph = CellGraph::build(&cfg);
        let fl = FreeList::build(&cfg, &graph);
        let cfl = fl.chain("a100").unwrap();
        let root_counters = cfl.counters_at(2);
        assert_eq!(root_counters.total_left, 1);
        assert_eq!(root_counters.bad_free, 1);
        let leaf_counters = cfl.counters_at(1);
        assert_eq!(leaf_counters.total_left, 4);
        assert_eq!(leaf_counters.bad_free, 4);
    }

    #[test]
    fn split_conserves_finer_levels_but_not_its_own() {
        let cfg = two_level_config();
        let mut graph = CellGraph::build(&cfg);
        let mut fl = FreeList::build(&cfg, &graph);
        let leaf = fl.find_or_split("a100", &mut graph, 1).unwrap();
        assert_eq!(graph.chain("a100").unwrap().cell(leaf).level, 1);
        let cfl = fl.chain("a100").unwrap();
        // Level 1 (finer than the split) is conserved: still 4 GPUs worth.
        assert_eq!(cfl.counters_at(1).total_left, 4);
        // Level 2 (the split level itself) is no longer an assemblable
        // whole: the root is fragmented into its 4 free children.
        assert_eq!(cfl.counters_at(2).total_left, 0);
    }

    #[test]
    fn take_and_release_round_trip() {
        let cfg = two_level_config();
        let mut graph = CellGraph::build(&cfg);
        let mut fl = FreeList::build(&cfg, &graph);
        let leaf = fl.find_or_split("a100", &mut graph, 1).unwrap();
        fl.take("a100", &graph, leaf);
        {
            let cfl = fl.chain("a100").unwrap();
            assert_eq!(cfl.counters_at(1).total_left, 3);
            assert_eq!(cfl.counters_at(2).total_left, 0);
        }
        fl.release("a100", &mut graph, leaf);
        let cfl = fl.chain("a100").unwrap();
        assert_eq!(cfl.counters_at(1).total_left, 4);
        // Releasing the last taken leaf frees all 4 siblings, so the
        // root re-merges and the whole level-2 unit is available again.
        assert_eq!(cfl.counters_at(2).total_left, 1);
        assert!(!cfl.free_at(2).is_empty());
    }
}
