//! Static cluster configuration: the shape ingested once at construction.
//!
//! This module only describes data. Parsing a YAML/JSON file into these
//! types, and watching the Kubernetes API for node objects, are the host
//! scheduler-extender's job.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cell::Level;

/// One level of a chain, e.g. "gpu", "socket", "node", "rack".
///
/// `fan_out` is the number of children a cell at this level has, each a
/// cell at the next level down. Leaves (level 1) have no children and
/// their `fan_out` is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSpec {
    pub cell_type: String,
    #[serde(default)]
    pub fan_out: u32,
}

/// The physical address of a single GPU: a node name and a GPU index on
/// that node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GpuAddr {
    pub node: String,
    pub index: u32,
}

/// One physical root cell of a chain: the node/GPU addresses of every leaf
/// beneath it, in the order they mirror the chain's level structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalRootSpec {
    pub leaves: Vec<GpuAddr>,
}

/// One hardware chain: a rooted tree of cell types from GPU (level 1) up
/// to the chain root, plus the physical roots available for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    /// `levels[0]` is level 1 (the GPU leaf), `levels[last]` is the root.
    pub levels: Vec<LevelSpec>,
    pub gpu_type: String,
    pub roots: Vec<PhysicalRootSpec>,
}

impl ChainConfig {
    /// The chain's root level (equal to the number of levels).
    pub fn root_level(&self) -> Level {
        self.levels.len() as Level
    }

    /// Number of leaves under one cell at `level`.
    pub fn leaves_under(&self, level: Level) -> u32 {
        let mut n = 1u32;
        for l in 2..=level {
            n *= self.levels[(l - 1) as usize].fan_out.max(1);
        }
        n
    }

    /// Number of children a cell at `level` has (each a cell at
    /// `level - 1`). Leaves (level 1) have none.
    pub fn fan_out_at(&self, level: Level) -> u32 {
        if level <= 1 {
            0
        } else {
            self.levels[(level - 1) as usize].fan_out
        }
    }
}

/// A reservation: a specific physical cell, identified by root index and
/// level, carved out for one VC ahead of time. Its physical binding is
/// static for the engine's lifetime, so it is excluded from the
/// bad-free/doomed-bad accounting that tracks non-reserved quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSpec {
    pub chain: String,
    pub root_index: usize,
    pub level: Level,
    /// Index of the cell among its siblings at `level` under the chosen
    /// root, left to right.
    pub cell_index: usize,
}

/// Per-VC configuration: the non-reserved quota (chain, level) -> count,
/// and any static reservations keyed by reservation id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcConfig {
    pub name: String,
    /// Non-reserved quota, counted in units of cells at (chain, level).
    #[serde(default)]
    pub quota: BTreeMap<String, BTreeMap<Level, u32>>,
    #[serde(default)]
    pub reservations: BTreeMap<String, ReservationSpec>,
}

impl VcConfig {
    pub fn quota_at(&self, chain: &str, level: Level) -> u32 {
        self.quota
            .get(chain)
            .and_then(|by_level| by_level.get(&level))
            .copied()
            .unwrap_or(0)
    }
}

/// The whole cluster configuration, validated once at `Algorithm::new`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Chains keyed by name; `BTreeMap` gives deterministic, lexicographic
    /// iteration order.
    pub chains: BTreeMap<String, ChainConfig>,
    pub vcs: BTreeMap<String, VcConfig>,
    /// GPU type -> chains that provide it, in preference order.
    #[serde(default)]
    pub gpu_type_index: BTreeMap<String, Vec<String>>,
    /// Minimum priority treated as guaranteed; below this a request is
    /// opportunistic.
    #[serde(default = "default_min_guaranteed_priority")]
    pub min_guaranteed_priority: i32,
}

fn default_min_guaranteed_priority() -> i32 {
    0
}

/// A validated configuration is malformed in a way that makes the engine
/// unable to start: insufficient physical cells to back configured VC
/// quota, or a reference to an unknown chain/level/gpu-type.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chain '{0}' referenced by VC '{1}' is not configured")]
    UnknownChainForVc(String, String),
    #[error("reservation '{0}' for VC '{1}' references unknown chain '{2}'")]
    UnknownChainForReservation(String, String, String),
    #[error("reservation '{0}' for VC '{1}' references root index {2} out of range for chain '{3}'")]
    RootIndexOutOfRange(String, String, usize, String),
    #[error("reservation '{0}' for VC '{1}' references level {2} out of range for chain '{3}'")]
    LevelOutOfRange(String, String, Level, String),
    #[error(
        "reservation '{0}' for VC '{1}' references cell index {2} out of range for chain \
         '{3}' root {4} at level {5}"
    )]
    CellIndexOutOfRange(String, String, usize, String, usize, Level),
    #[error("gpu type '{0}' in the gpu-type index names unknown chain '{1}'")]
    UnknownChainForGpuType(String, String),
    #[error(
        "chain '{chain}' level {level}: total physical capacity {total} is insufficient for \
         configured VC quota {quota} (broken safety)"
    )]
    BrokenSafety {
        chain: String,
        level: Level,
        total: u32,
        quota: u32,
    },
}

impl ClusterConfig {
    /// Validate cross-references and the safety invariant that total
    /// physical capacity at each level covers the sum of VC quotas there.
    /// Called once at `Algorithm::new`; failures here are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (vc_name, vc) in &self.vcs {
            for chain_name in vc.quota.keys() {
                if !self.chains.contains_key(chain_name) {
                    return Err(ConfigError::UnknownChainForVc(
                        chain_name.clone(),
                        vc_name.clone(),
                    ));
                }
            }
            for (res_id, res) in &vc.reservations {
                let chain = self.chains.get(&res.chain).ok_or_else(|| {
                    ConfigError::UnknownChainForReservation(
                        res_id.clone(),
                        vc_name.clone(),
                        res.chain.clone(),
                    )
                })?;
                if res.root_index >= chain.roots.len() {
                    return Err(ConfigError::RootIndexOutOfRange(
                        res_id.clone(),
                        vc_name.clone(),
                        res.root_index,
                        res.chain.clone(),
                    ));
                }
                if res.level == 0 || res.level > chain.root_level() {
                    return Err(ConfigError::LevelOutOfRange(
                        res_id.clone(),
                        vc_name.clone(),
                        res.level,
                        res.chain.clone(),
                    ));
                }
                let leaves_per_cell = chain.leaves_under(res.level).max(1);
                let root_leaves = chain.roots[res.root_index].leaves.len() as u32;
                let cells_at_level = root_leaves / leaves_per_cell;
                if res.cell_index >= cells_at_level as usize {
                    return Err(ConfigError::CellIndexOutOfRange(
                        res_id.clone(),
                        vc_name.clone(),
                        res.cell_index,
                        res.chain.clone(),
                        res.root_index,
                        res.level,
                    ));
                }
            }
        }

        for (gpu_type, chains) in &self.gpu_type_index {
            for chain_name in chains {
                if !self.chains.contains_key(chain_name) {
                    return Err(ConfigError::UnknownChainForGpuType(
                        gpu_type.clone(),
                        chain_name.clone(),
                    ));
                }
            }
        }

        for (chain_name, chain) in &self.chains {
            for level in 1..=chain.root_level() {
                let leaves_per_root = chain.leaves_under(level);
                if leaves_per_root == 0 {
                    continue;
                }
                let total_cells: u32 = chain
                    .roots
                    .iter()
                    .map(|r| r.leaves.len() as u32 / leaves_per_root)
                    .sum();
                let quota: u32 = self
                    .vcs
                    .values()
                    .map(|vc| vc.quota_at(chain_name, level))
                    .sum();
                if total_cells < quota {
                    return Err(ConfigError::BrokenSafety {
                        chain: chain_name.clone(),
                        level,
                        total: total_cells,
                        quota,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_level_chain(name: &str, gpu_type: &str, num_roots: usize, fan_out: u32) -> ChainConfig {
        let leaves_per_root = fan_out as usize;
        let roots = (0..num_roots)
            .map(|r| PhysicalRootSpec {
                leaves: (0..leaves_per_root)
                    .map(|i| GpuAddr {
                        node: format!("node-{r}"),
                        index: i as u32,
                    })
                    .collect(),
            })
            .collect();
        ChainConfig {
            name: name.to_string(),
            levels: vec![
                LevelSpec {
                    cell_type: "gpu".to_string(),
                    fan_out: 0,
                },
                LevelSpec {
                    cell_type: "node".to_string(),
                    fan_out,
                },
            ],
            gpu_type: gpu_type.to_string(),
            roots,
        }
    }

    #[test]
    fn validate_accepts_sufficient_quota() {
        let mut chains = BTreeMap::new();
        chains.insert("a100".to_string(), two_level_chain("a100", "A100", 2, 4));
        let mut quota = BTreeMap::new();
        quota.insert("a100".to_string(), BTreeMap::from([(2, 1)]));
        let mut vcs = BTreeMap::new();
        vcs.insert(
            "vc-a".to_string(),
            VcConfig {
                name: "vc-a".to_string(),
                quota,
                reservations: BTreeMap::new(),
            },
        );
        let cfg = ClusterConfig {
            chains,
            vcs,
            gpu_type_index: BTreeMap::new(),
            min_guaranteed_priority: 0,
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_broken_safety() {
        let mut chains = BTreeMap::new();
        chains.insert("a100".to_string(), two_level_chain("a100", "A100", 1, 4));
        let mut quota = BTreeMap::new();
        quota.insert("a100".to_string(), BTreeMap::from([(2, 5)]));
        let mut vcs = BTreeMap::new();
        vcs.insert(
            "vc-a".to_string(),
            VcConfig {
                name: "vc-a".to_string(),
                quota,
                reservations: BTreeMap::new(),
            },
        );
        let cfg = ClusterConfig {
            chains,
            vcs,
            gpu_type_index: BTreeMap::new(),
            min_guaranteed_priority: 0,
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BrokenSafety { .. })
        ));
    }

    #[test]
    fn validate_rejects_cell_index_out_of_range() {
        let mut chains = BTreeMap::new();
        chains.insert("a100".to_string(), two_level_chain("a100", "A100", 1, 4));
        let mut vcs = BTreeMap::new();
        vcs.insert(
            "vc-a".to_string(),
            VcConfig {
                name: "vc-a".to_string(),
                quota: BTreeMap::new(),
                reservations: BTreeMap::from([(
                    "res-1".to_string(),
                    ReservationSpec {
                        chain: "a100".to_string(),
                        root_index: 0,
                        level: 1,
                        cell_index: 4,
                    },
                )]),
            },
        );
        let cfg = ClusterConfig {
            chains,
            vcs,
            gpu_type_index: BTreeMap::new(),
            min_guaranteed_priority: 0,
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::CellIndexOutOfRange(..))
        ));
    }
}
