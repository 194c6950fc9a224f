use std::collections::BTreeMap;

use crate::config::{ChainConfig, ClusterConfig, GpuAddr};
use crate::ids::{ChainName, GroupName, NodeName, VcName};

use super::{CellPriority, CellState, Level, PhysicalCellId, PhysicalCellNode, VirtualCellId, VirtualCellNode};

/// One chain's physical forest: an arena plus its root ids in
/// configuration order.
#[derive(Debug, Clone)]
pub struct PhysicalChain {
    pub config: ChainConfig,
    arena: Vec<PhysicalCellNode>,
    pub roots: Vec<PhysicalCellId>,
}

impl PhysicalChain {
    fn build(config: ChainConfig) -> Self {
        let mut arena = Vec::new();
        let mut roots = Vec::new();
        let root_level = config.root_level();
        for root in &config.roots {
            let id = build_physical_subtree(
                &mut arena,
                &config.name,
                root_level,
                &config.levels,
                &root.leaves,
                None,
            );
            roots.push(id);
        }
        PhysicalChain {
            config,
            arena,
            roots,
        }
    }

    pub fn cell(&self, id: PhysicalCellId) -> &PhysicalCellNode {
        &self.arena[id.0 as usize]
    }

    pub fn cell_mut(&mut self, id: PhysicalCellId) -> &mut PhysicalCellNode {
        &mut self.arena[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PhysicalCellId> + '_ {
        (0..self.arena.len()).map(|i| PhysicalCellId(i as u32))
    }

    /// Per-level `(total, bad)` counts of the cells in `root`'s subtree,
    /// inclusive of `root` itself.
    pub fn subtree_counts(&self, root: PhysicalCellId) -> BTreeMap<Level, (u32, u32)> {
        let mut counts = BTreeMap::new();
        self.subtree_counts_into(root, &mut counts);
        counts
    }

    /// The level-1 leaves under `id`, left to right (`id` itself if it is
    /// already a leaf).
    pub fn leaves_of(&self, id: PhysicalCellId) -> Vec<PhysicalCellId> {
        let mut out = Vec::new();
        self.leaves_of_into(id, &mut out);
        out
    }

    fn leaves_of_into(&self, id: PhysicalCellId, out: &mut Vec<PhysicalCellId>) {
        let node = self.cell(id);
        if node.is_leaf() {
            out.push(id);
            return;
        }
        for &child in &node.children {
            self.leaves_of_into(child, out);
        }
    }

    fn subtree_counts_into(&self, id: PhysicalCellId, counts: &mut BTreeMap<Level, (u32, u32)>) {
        let node = self.cell(id);
        let entry = counts.entry(node.level).or_insert((0, 0));
        entry.0 += 1;
        if !node.healthy {
            entry.1 += 1;
        }
        for &child in &node.children {
            self.subtree_counts_into(child, counts);
        }
    }

    /// Recompute `healthy` for `leaf` and every ancestor up to the root,
    /// stopping at the first ancestor whose healthiness is unchanged.
    /// Returns the ids whose healthiness actually flipped, nearest first.
    pub fn propagate_leaf_health(&mut self, leaf: PhysicalCellId, healthy: bool) -> Vec<PhysicalCellId> {
        let mut flipped = Vec::new();
        if self.cell(leaf).healthy != healthy {
            self.cell_mut(leaf).healthy = healthy;
            flipped.push(leaf);
        } else {
            return flipped;
        }
        let mut current = self.cell(leaf).parent;
        while let Some(id) = current {
            let new_healthy = self.cell(id).children.iter().any(|&c| self.cell(c).healthy);
            if self.cell(id).healthy == new_healthy {
                break;
            }
            self.cell_mut(id).healthy = new_healthy;
            flipped.push(id);
            current = self.cell(id).parent;
        }
        flipped
    }

    /// `true` iff no ancestor of `id` (nor `id` itself) is bound into any
    /// VC's virtual subtree — i.e. `id`'s whole subtree is still free-list
    /// capacity. `state()` alone can't answer this: it's only ever set on
    /// leaves, while a bound VC subtree's ancestors and unused siblings
    /// never get `using_group`/`acquiring_group` set on them directly.
    pub fn is_free_capacity(&self, id: PhysicalCellId) -> bool {
        let mut current = Some(id);
        while let Some(cur) = current {
            if self.cell(cur).bound_virtual.is_some() {
                return false;
            }
            current = self.cell(cur).parent;
        }
        true
    }

    /// Free -> Used, recording `priority` in the used-priority histogram
    /// of `leaf` and every ancestor up to the root.
    pub fn assign_used(&mut self, leaf: PhysicalCellId, group: GroupName, priority: CellPriority) {
        self.cell_mut(leaf).assign_used(group, priority);
        self.bump_histogram(leaf, None, Some(priority));
    }

    /// Used -> Free, removing `leaf`'s histogram entry up to the root.
    pub fn release(&mut self, leaf: PhysicalCellId) {
        let old = self.cell(leaf).priority;
        self.cell_mut(leaf).release();
        self.bump_histogram(leaf, Some(old), None);
    }

    /// Acquiring | Acquired -> Used. The displaced occupant's histogram
    /// entry (if there was one — `Acquired` has none, nobody ever held the
    /// cell) is swapped for the new owner's `priority`.
    pub fn settle_acquired(&mut self, leaf: PhysicalCellId, priority: CellPriority) {
        let old = match self.cell(leaf).state() {
            CellState::Acquiring => Some(self.cell(leaf).priority),
            _ => None,
        };
        self.cell_mut(leaf).settle_acquired(priority);
        self.bump_histogram(leaf, old, Some(priority));
    }

    /// Guaranteed -> Opportunistic demotion, moving `leaf`'s histogram
    /// entry from its old priority to `Opportunistic`.
    pub fn demote_to_opportunistic(&mut self, leaf: PhysicalCellId) {
        let old = self.cell(leaf).priority;
        self.cell_mut(leaf).demote_to_opportunistic();
        self.bump_histogram(leaf, Some(old), Some(CellPriority::Opportunistic));
    }

    fn bump_histogram(&mut self, leaf: PhysicalCellId, old: Option<CellPriority>, new: Option<CellPriority>) {
        if old == new {
            return;
        }
        let mut current = Some(leaf);
        while let Some(id) = current {
            let node = self.cell_mut(id);
            if let Some(p) = old {
                if let Some(count) = node.histogram.get_mut(&p) {
                    *count -= 1;
                    if *count == 0 {
                        node.histogram.remove(&p);
                    }
                }
            }
            if let Some(p) = new {
                *node.histogram.entry(p).or_insert(0) += 1;
            }
            current = node.parent;
        }
    }
}

fn build_physical_subtree(
    arena: &mut Vec<PhysicalCellNode>,
    chain: &str,
    level: Level,
    level_specs: &[crate::config::LevelSpec],
    leaves: &[GpuAddr],
    parent: Option<PhysicalCellId>,
) -> PhysicalCellId {
    let id = PhysicalCellId(arena.len() as u32);
    arena.push(PhysicalCellNode::new(
        chain.to_string(),
        level,
        parent,
        leaves.to_vec(),
    ));
    if level > 1 {
        let fan_out = level_specs[(level - 1) as usize].fan_out.max(1) as usize;
        let chunk_size = leaves.len() / fan_out;
        let mut children = Vec::with_capacity(fan_out);
        for chunk in leaves.chunks(chunk_size) {
            let child = build_physical_subtree(arena, chain, level - 1, level_specs, chunk, Some(id));
            children.push(child);
        }
        arena[id.0 as usize].children = children;
    }
    id
}

/// One VC's virtual forest for one chain: the arena, plus the roots of its
/// non-reserved quota subtrees (grouped by level) and reservation
/// subtrees (keyed by reservation id).
#[derive(Debug, Clone, Default)]
pub struct VirtualForest {
    arena: Vec<VirtualCellNode>,
    pub quota_roots: BTreeMap<Level, Vec<VirtualCellId>>,
    pub reservation_roots: BTreeMap<String, VirtualCellId>,
}

impl VirtualForest {
    pub fn cell(&self, id: VirtualCellId) -> &VirtualCellNode {
        &self.arena[id.0 as usize]
    }

    pub fn cell_mut(&mut self, id: VirtualCellId) -> &mut VirtualCellNode {
        &mut self.arena[id.0 as usize]
    }

    /// The level-1 virtual leaves under `id`, left to right.
    pub fn leaves_of(&self, id: VirtualCellId) -> Vec<VirtualCellId> {
        let mut out = Vec::new();
        self.leaves_of_into(id, &mut out);
        out
    }

    fn leaves_of_into(&self, id: VirtualCellId, out: &mut Vec<VirtualCellId>) {
        let node = self.cell(id);
        if node.is_leaf() {
            out.push(id);
            return;
        }
        for &child in &node.children {
            self.leaves_of_into(child, out);
        }
    }

    fn push_subtree(
        &mut self,
        vc: &str,
        chain: &str,
        level: Level,
        fan_out_at: impl Fn(Level) -> u32,
        parent: Option<VirtualCellId>,
        preassigned: Option<VirtualCellId>,
    ) -> VirtualCellId {
        let id = VirtualCellId(self.arena.len() as u32);
        // placeholder; `preassigned` filled in once we know our own id
        self.arena.push(VirtualCellNode {
            vc: vc.to_string(),
            chain: chain.to_string(),
            level,
            parent,
            children: Vec::new(),
            preassigned: preassigned.unwrap_or(id),
            bound_physical: None,
            healthy: false,
            reservation: None,
        });
        if level > 1 {
            let fan_out = fan_out_at(level).max(1);
            let mut children = Vec::with_capacity(fan_out as usize);
            for _ in 0..fan_out {
                let child = self.push_subtree(vc, chain, level - 1, &fan_out_at, Some(id), Some(preassigned.unwrap_or(id)));
                children.push(child);
            }
            self.cell_mut(id).children = children;
        }
        id
    }
}

/// The cell graph: per-chain physical forests, and per-(VC, chain) virtual
/// forests.
#[derive(Debug, Clone, Default)]
pub struct CellGraph {
    physical: BTreeMap<ChainName, PhysicalChain>,
    virtual_forests: BTreeMap<(VcName, ChainName), VirtualForest>,
    /// (chain, node, gpu index) -> leaf cell id, for `AddAllocatedPod`
    /// address lookups and the health accountant's node -> leaves index.
    leaf_index: BTreeMap<(ChainName, NodeName, u32), PhysicalCellId>,
    node_leaves: BTreeMap<(ChainName, NodeName), Vec<PhysicalCellId>>,
}

impl CellGraph {
    pub fn build(config: &ClusterConfig) -> Self {
        let mut physical = BTreeMap::new();
        for (name, chain_cfg) in &config.chains {
            physical.insert(name.clone(), PhysicalChain::build(chain_cfg.clone()));
        }

        let mut leaf_index = BTreeMap::new();
        let mut node_leaves: BTreeMap<(ChainName, NodeName), Vec<PhysicalCellId>> = BTreeMap::new();
        for (chain_name, chain) in &physical {
            for id in chain.ids() {
                let node = chain.cell(id);
                if node.is_leaf() {
                    let addr = &node.leaves[0];
                    leaf_index.insert((chain_name.clone(), addr.node.clone(), addr.index), id);
                    node_leaves
                        .entry((chain_name.clone(), addr.node.clone()))
                        .or_default()
                        .push(id);
                }
            }
        }

        let mut virtual_forests = BTreeMap::new();
        for (vc_name, vc_cfg) in &config.vcs {
            for (chain_name, by_level) in &vc_cfg.quota {
                let Some(chain) = physical.get(chain_name) else {
                    continue;
                };
                let forest = virtual_forests
                    .entry((vc_name.clone(), chain_name.clone()))
                    .or_insert_with(VirtualForest::default);
                for (&level, &count) in by_level {
                    let roots = forest.quota_roots.entry(level).or_default();
                    for _ in 0..count {
                        let id = forest.push_subtree(
                            vc_name,
                            chain_name,
                            level,
                            |l| chain.config.fan_out_at(l),
                            None,
                            None,
                        );
                        roots.push(id);
                    }
                }
            }
            for (res_id, res) in &vc_cfg.reservations {
                let Some(chain) = physical.get(&res.chain) else {
                    continue;
                };
                let forest = virtual_forests
                    .entry((vc_name.clone(), res.chain.clone()))
                    .or_insert_with(VirtualForest::default);
                let root_id = forest.push_subtree(
                    vc_name,
                    &res.chain,
                    res.level,
                    |l| chain.config.fan_out_at(l),
                    None,
                    None,
                );
                forest.cell_mut(root_id).reservation = Some(res_id.clone());
                forest.reservation_roots.insert(res_id.clone(), root_id);
            }
        }

        let mut graph = CellGraph {
            physical,
            virtual_forests,
            leaf_index,
            node_leaves,
        };

        // Pin every reservation to its configured physical cell immediately;
        // reservations are static for the engine's lifetime.
        let reservations: Vec<(VcName, String, String)> = graph
            .virtual_forests
            .iter()
            .flat_map(|((vc, chain), forest)| {
                forest
                    .reservation_roots
                    .keys()
                    .map(move |res_id| (vc.clone(), chain.clone(), res_id.clone()))
            })
            .collect();
        for (vc, chain_name, res_id) in reservations {
            let vc_cfg = &config.vcs[&vc];
            let res = &vc_cfg.reservations[&res_id];
            let phys_root = graph.physical[&chain_name].roots[res.root_index];
            let phys_id =
                find_cell_at(&graph.physical[&chain_name], phys_root, res.level, res.cell_index);
            let virt_root = graph.virtual_forests[&(vc.clone(), chain_name.clone())]
                .reservation_roots[&res_id];
            graph.bind_preassigned(&vc, &chain_name, virt_root, phys_id);
        }

        graph
    }

    pub fn chain(&self, name: &str) -> Option<&PhysicalChain> {
        self.physical.get(name)
    }

    pub fn chain_mut(&mut self, name: &str) -> Option<&mut PhysicalChain> {
        self.physical.get_mut(name)
    }

    pub fn chains(&self) -> impl Iterator<Item = (&ChainName, &PhysicalChain)> {
        self.physical.iter()
    }

    pub fn virtual_forest(&self, vc: &str, chain: &str) -> Option<&VirtualForest> {
        self.virtual_forests.get(&(vc.to_string(), chain.to_string()))
    }

    pub fn virtual_forest_mut(&mut self, vc: &str, chain: &str) -> Option<&mut VirtualForest> {
        self.virtual_forests.get_mut(&(vc.to_string(), chain.to_string()))
    }

    pub fn leaf_at(&self, chain: &str, node: &str, index: u32) -> Option<PhysicalCellId> {
        self.leaf_index
            .get(&(chain.to_string(), node.to_string(), index))
            .copied()
    }

    pub fn leaves_on_node(&self, chain: &str, node: &str) -> &[PhysicalCellId] {
        self.node_leaves
            .get(&(chain.to_string(), node.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Bind a VC's preassigned virtual cell to a physical cell, propagating
    /// the binding down both subtrees in lockstep: the binding is
    /// symmetric, and every descendant mirrors it so the mapper can
    /// descend to the specific leaf by following `bound_physical`.
    pub fn bind_preassigned(
        &mut self,
        vc: &str,
        chain_name: &str,
        virtual_id: VirtualCellId,
        physical_id: PhysicalCellId,
    ) {
        let forest = self
            .virtual_forests
            .get_mut(&(vc.to_string(), chain_name.to_string()))
            .expect("bind_preassigned: unknown (vc, chain)");
        let chain = self.physical.get_mut(chain_name).expect("bind_preassigned: unknown chain");
        bind_subtree(forest, chain, vc, virtual_id, physical_id);
    }

    pub fn unbind_preassigned(&mut self, vc: &str, chain_name: &str, virtual_id: VirtualCellId) {
        let forest = self
            .virtual_forests
            .get_mut(&(vc.to_string(), chain_name.to_string()))
            .expect("unbind_preassigned: unknown (vc, chain)");
        let chain = self.physical.get_mut(chain_name).expect("unbind_preassigned: unknown chain");
        unbind_subtree(forest, chain, virtual_id);
    }
}

fn bind_subtree(
    forest: &mut VirtualForest,
    chain: &mut PhysicalChain,
    vc: &str,
    virtual_id: VirtualCellId,
    physical_id: PhysicalCellId,
) {
    forest.cell_mut(virtual_id).bound_physical = Some(physical_id);
    chain.cell_mut(physical_id).bound_virtual = Some((vc.to_string(), virtual_id));
    let v_children = forest.cell(virtual_id).children.clone();
    let p_children = chain.cell(physical_id).children.clone();
    for (v_child, p_child) in v_children.into_iter().zip(p_children) {
        bind_subtree(forest, chain, vc, v_child, p_child);
    }
}

fn unbind_subtree(forest: &mut VirtualForest, chain: &mut PhysicalChain, virtual_id: VirtualCellId) {
    if let Some(physical_id) = forest.cell(virtual_id).bound_physical {
        chain.cell_mut(physical_id).bound_virtual = None;
    }
    forest.cell_mut(virtual_id).bound_physical = None;
    let v_children = forest.cell(virtual_id).children.clone();
    for v_child in v_children {
        unbind_subtree(forest, chain, v_child);
    }
}

/// Find the `index`-th (left to right, depth-first) physical cell at
/// `level` under `root`.
fn find_cell_at(chain: &PhysicalChain, root: PhysicalCellId, level: Level, index: usize) -> PhysicalCellId {
    let mut matches = Vec::new();
    collect_at_level(chain, root, level, &mut matches);
    matches[index]
}

fn collect_at_level(chain: &PhysicalChain, id: PhysicalCellId, level: Level, out: &mut Vec<PhysicalCellId>) {
    let node = chain.cell(id);
    if node.level == level {
        out.push(id);
        return;
    }
    for &child in &node.children {
        collect_at_level(chain, child, level, out);
    }
}
