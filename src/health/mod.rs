//! Health accountant: propagates node-level health signals up the cell
//! tree and keeps `badFree`/`doomedBad` in sync.

use std::collections::BTreeSet;

use crate::cell::{CellGraph, Level};
use crate::freelist::{DoomedBadDelta, FreeList};

#[derive(Debug, Default, Clone, Copy)]
pub struct HealthAccountant;

impl HealthAccountant {
    /// Mark every leaf physical cell placed on `node` (in `chain`) as bad.
    /// A no-op for leaves already bad, so repeated calls are idempotent.
    pub fn set_bad_node(
        &self,
        graph: &mut CellGraph,
        freelist: &mut FreeList,
        chain_name: &str,
        node: &str,
    ) -> DoomedBadDelta {
        self.set_node_health(graph, freelist, chain_name, node, false)
    }

    /// Mark every leaf physical cell placed on `node` (in `chain`) healthy.
    pub fn set_healthy_node(
        &self,
        graph: &mut CellGraph,
        freelist: &mut FreeList,
        chain_name: &str,
        node: &str,
    ) -> DoomedBadDelta {
        self.set_node_health(graph, freelist, chain_name, node, true)
    }

    fn set_node_health(
        &self,
        graph: &mut CellGraph,
        freelist: &mut FreeList,
        chain_name: &str,
        node: &str,
        healthy: bool,
    ) -> DoomedBadDelta {
        let leaves = graph.leaves_on_node(chain_name, node).to_vec();
        let mut touched_levels: BTreeSet<Level> = BTreeSet::new();

        for leaf in leaves {
            let Some(chain) = graph.chain_mut(chain_name) else {
                continue;
            };
            if chain.cell(leaf).healthy == healthy {
                continue;
            }
            let flipped = chain.propagate_leaf_health(leaf, healthy);
            for id in flipped {
                let level = chain.cell(id).level;
                // Only a leaf-level (or ancestor-level) cell that is still
                // free capacity contributes to `badFree`; a cell already
                // bound to a group doesn't count toward any free-list
                // level at all.
                if chain.is_free_capacity(id) {
                    if let Some(cfl) = freelist.chain_mut(chain_name) {
                        let counters = cfl.counters_mut(level);
                        if healthy {
                            counters.bad_free = counters.bad_free.saturating_sub(1);
                        } else {
                            counters.bad_free += 1;
                        }
                    }
                    touched_levels.insert(level);
                }
            }
        }

        let mut delta = DoomedBadDelta::default();
        for level in touched_levels {
            let level_delta = freelist.recompute_doomed_bad(chain_name, level, graph);
            for (vc, v) in &level_delta.newly_doomed {
                if let Some(forest) = graph.virtual_forest_mut(vc, chain_name) {
                    forest.cell_mut(*v).healthy = false;
                }
            }
            for (vc, v) in &level_delta.newly_healthy {
                if let Some(forest) = graph.virtual_forest_mut(vc, chain_name) {
                    forest.cell_mut(*v).healthy = true;
                }
            }
            delta.newly_doomed.extend(level_delta.newly_doomed);
            delta.newly_healthy.extend(level_delta.newly_healthy);
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainConfig, ClusterConfig, GpuAddr, LevelSpec, PhysicalRootSpec, VcConfig};
    use std::collections::BTreeMap;

    fn sample_config() -> ClusterConfig {
        let roots = vec![PhysicalRootSpec {
            leaves: (0..4).map(|i| GpuAddr { node: "node-0".to_string(), index: i }).collect(),
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
        quota.insert("a100".to_string(), BTreeMap::from([(1, 4)]));
        let mut vcs = BTreeMap::new();
        vcs.insert("vc-a".to_string(), VcConfig { name: "vc-a".to_string(), quota, reservations: BTreeMap::new() });
        ClusterConfig { chains, vcs, gpu_type_index: BTreeMap::new(), min_guaranteed_priority: 0 }
    }

    #[test]
    fn marking_node_healthy_clears_bad_free_and_doomed_bad() {
        let cfg = sample_config();
        let mut graph = CellGraph::build(&cfg);
        let mut fl = FreeList::build(&cfg, &graph);
        // All 4 leaves start bad, vc-a wants all 4 as quota: fully doomed.
        let doomed = |fl: &FreeList| {
            fl.chain("a100").unwrap().counters_at(1).doomed_bad.get("vc-a").copied().unwrap_or(0)
        };
        assert_eq!(doomed(&fl), 4);

        let accountant = HealthAccountant;
        let delta = accountant.set_healthy_node(&mut graph, &mut fl, "a100", "node-0");
        assert_eq!(delta.newly_healthy.len(), 4);
        assert_eq!(fl.chain("a100").unwrap().counters_at(1).bad_free, 0);
        assert_eq!(doomed(&fl), 0);
    }

    #[test]
    fn setting_bad_node_twice_is_idempotent() {
        let cfg = sample_config();
        let mut graph = CellGraph::build(&cfg);
        let mut fl = FreeList::build(&cfg, &graph);
        let accountant = HealthAccountant;
        accountant.set_healthy_node(&mut graph, &mut fl, "a100", "node-0");
        let first = accountant.set_bad_node(&mut graph, &mut fl, "a100", "node-0");
        assert_eq!(first.newly_doomed.len(), 4);
        let second = accountant.set_bad_node(&mut graph, &mut fl, "a100", "node-0");
        assert!(second.newly_doomed.is_empty());
        assert!(second.newly_healthy.is_empty());
    }
}
