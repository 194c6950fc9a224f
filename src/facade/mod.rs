//! The single-writer public surface: one [`Algorithm`] instance per
//! cluster, gating every mutation behind one `RwLock`, mirroring the
//! single locked-instance pattern this crate's buddy allocator and cell
//! graph were themselves grounded on.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::SystemTime;

use crate::cell::{CellGraph, CellPriority, CellState, PhysicalCellId};
use crate::config::ClusterConfig;
use crate::error::{FatalError, RequestError};
use crate::freelist::FreeList;
use crate::group::{self, AffinityGroup, GroupState, PodId};
use crate::health::HealthAccountant;
use crate::ids::GroupName;
use crate::mapper;
use crate::request::{PodBindInfo, PodSchedulingSpec};
use crate::result::{CellStatus, ClusterStatus, PodPlacement, PodScheduleResult, VcCellPlacement, VcStatus};
use crate::scheduler::simple::{FirstFitIntraVcScheduler, FirstFitOpportunisticScheduler};
use crate::scheduler::{IntraVcScheduler, OpportunisticScheduler};

fn priority_from(raw: i32, min_guaranteed: i32) -> CellPriority {
    if raw < min_guaranteed {
        CellPriority::Opportunistic
    } else {
        CellPriority::Guaranteed(raw)
    }
}

/// The engine's whole mutable state, behind `Algorithm`'s one lock.
struct AlgorithmState {
    config: ClusterConfig,
    graph: CellGraph,
    freelist: FreeList,
    groups: BTreeMap<GroupName, AffinityGroup>,
    intra_vc: Box<dyn IntraVcScheduler>,
    opportunistic: Box<dyn OpportunisticScheduler>,
    health: HealthAccountant,
}

/// The cell-scheduling engine for one cluster configuration.
///
/// Every mutating entry point takes the write side of the lock; status
/// queries take the read side.
pub struct Algorithm {
    state: RwLock<AlgorithmState>,
}

impl Algorithm {
    /// Validate `config` and build the initial graph/free list. Fatal if
    /// the configuration can't back its own VC quotas.
    pub fn new(config: ClusterConfig) -> Result<Self, FatalError> {
        Self::with_schedulers(
            config,
            Box::new(FirstFitIntraVcScheduler),
            Box::new(FirstFitOpportunisticScheduler),
        )
    }

    /// Same as [`Self::new`], but with custom scheduling strategies
    /// injected behind the [`IntraVcScheduler`]/[`OpportunisticScheduler`]
    /// traits.
    pub fn with_schedulers(
        config: ClusterConfig,
        intra_vc: Box<dyn IntraVcScheduler>,
        opportunistic: Box<dyn OpportunisticScheduler>,
    ) -> Result<Self, FatalError> {
        config.validate()?;
        let graph = CellGraph::build(&config);
        let freelist = FreeList::build(&config, &graph);
        Ok(Algorithm {
            state: RwLock::new(AlgorithmState {
                config,
                graph,
                freelist,
                groups: BTreeMap::new(),
                intra_vc,
                opportunistic,
                health: HealthAccountant,
            }),
        })
    }

    pub fn schedule(
        &self,
        spec: &PodSchedulingSpec,
        pod: &str,
        now: SystemTime,
    ) -> Result<PodScheduleResult, RequestError> {
        self.state.write().unwrap().schedule(spec, pod, now)
    }

    pub fn add_allocated_pod(&self, info: &PodBindInfo) {
        self.state.write().unwrap().add_allocated_pod(info);
    }

    pub fn delete_allocated_pod(&self, group: &str, gpu_count: u32, pod: &str) {
        self.state.write().unwrap().delete_allocated_pod(group, gpu_count, pod);
    }

    pub fn delete_unallocated_pod(&self, group: &str, pod: &str) {
        self.state.write().unwrap().delete_unallocated_pod(group, pod);
    }

    pub fn add_node(&self, chain: &str, node: &str, is_healthy: bool) {
        self.state.write().unwrap().set_node_healthy(chain, node, is_healthy);
    }

    pub fn update_node(&self, chain: &str, node: &str, is_healthy: bool) {
        self.state.write().unwrap().set_node_healthy(chain, node, is_healthy);
    }

    pub fn delete_node(&self, chain: &str, node: &str) {
        self.state.write().unwrap().set_node_healthy(chain, node, false);
    }

    pub fn cluster_status(&self) -> ClusterStatus {
        self.state.read().unwrap().cluster_status()
    }

    pub fn vc_status(&self, vc: &str) -> VcStatus {
        self.state.read().unwrap().vc_status(vc)
    }

    /// White-box accessors for integration tests (`Cargo.toml`'s
    /// `test_private` feature).
    #[cfg(feature = "test_private")]
    pub fn group_state(&self, name: &str) -> Option<GroupState> {
        self.state.read().unwrap().groups.get(name).map(|g| g.state)
    }

    #[cfg(feature = "test_private")]
    pub fn group_exists(&self, name: &str) -> bool {
        self.state.read().unwrap().groups.contains_key(name)
    }

    #[cfg(feature = "test_private")]
    pub fn cell_state(&self, chain: &str, node: &str, gpu_index: u32) -> Option<CellState> {
        let state = self.state.read().unwrap();
        let cell_id = state.graph.leaf_at(chain, node, gpu_index)?;
        state.graph.chain(chain).map(|c| c.cell(cell_id).state())
    }
}

impl AlgorithmState {
    fn schedule(
        &mut self,
        spec: &PodSchedulingSpec,
        pod: &str,
        now: SystemTime,
    ) -> Result<PodScheduleResult, RequestError> {
        if let Some(group) = self.groups.get_mut(&spec.group) {
            match group.state {
                GroupState::Allocated => {
                    let index = group
                        .first_open_slot(spec.gpu_count)
                        .ok_or_else(|| RequestError::TooManyPods(spec.group.clone(), spec.gpu_count))?;
                    group.bind_slot(spec.gpu_count, index, pod.to_string());
                    let chain_name = group.chain.clone();
                    let priority = group.priority;
                    let cells = group
                        .physical_placement
                        .get(&spec.gpu_count)
                        .and_then(|v| v.get(index))
                        .cloned()
                        .unwrap_or_default();
                    return Ok(PodScheduleResult {
                        placement: self.placement_from_cells(&chain_name, &cells),
                        slot_index: Some(index),
                        priority: Some(priority),
                        victims: BTreeMap::new(),
                    });
                }
                GroupState::Preempting => {
                    group.preemptor_pods.insert(pod.to_string());
                    let chain_name = group.chain.clone();
                    let priority = group.priority;
                    let victims = group.victims.clone();
                    return Ok(PodScheduleResult {
                        placement: None,
                        slot_index: None,
                        priority: Some(priority),
                        victims: self.victims_by_node(&chain_name, &victims),
                    });
                }
                GroupState::BeingPreempted => {
                    return Err(RequestError::TooManyPods(spec.group.clone(), spec.gpu_count));
                }
            }
        }

        self.validate_new_request(spec)?;
        let priority = priority_from(spec.priority, self.config.min_guaranteed_priority);

        for chain_name in self.candidate_chains(spec)? {
            if let Some(outcome) = self.try_chain(spec, &chain_name, priority, now) {
                return Ok(self.commit_new_group(spec, pod, &chain_name, priority, outcome));
            }
        }
        Ok(PodScheduleResult::wait())
    }

    fn validate_new_request(&self, spec: &PodSchedulingSpec) -> Result<(), RequestError> {
        let vc = self
            .config
            .vcs
            .get(&spec.vc)
            .ok_or_else(|| RequestError::UnknownVc(spec.vc.clone()))?;

        if let Some(res_id) = &spec.reservation_id {
            if !vc.reservations.contains_key(res_id) {
                return Err(RequestError::UnknownReservation(res_id.clone(), spec.vc.clone()));
            }
            if spec.priority < self.config.min_guaranteed_priority {
                return Err(RequestError::OpportunisticWithReservation);
            }
        }

        if let Some(gpu_type) = &spec.gpu_type {
            let chains_for_type = self
                .config
                .gpu_type_index
                .get(gpu_type)
                .ok_or_else(|| RequestError::UnknownGpuType(gpu_type.clone()))?;
            if spec.priority >= self.config.min_guaranteed_priority {
                let has_quota = chains_for_type.iter().any(|c| {
                    vc.quota.get(c).map(|by_level| by_level.values().any(|&n| n > 0)).unwrap_or(false)
                        || vc.reservations.values().any(|r| &r.chain == c)
                });
                if !has_quota {
                    return Err(RequestError::GuaranteedTypeNotInVc(spec.vc.clone(), gpu_type.clone()));
                }
            }
        }
        Ok(())
    }

    fn candidate_chains(&self, spec: &PodSchedulingSpec) -> Result<Vec<String>, RequestError> {
        if let Some(res_id) = &spec.reservation_id {
            let vc = &self.config.vcs[&spec.vc];
            return Ok(vec![vc.reservations[res_id].chain.clone()]);
        }
        if let Some(gpu_type) = &spec.gpu_type {
            return Ok(self.config.gpu_type_index.get(gpu_type).cloned().unwrap_or_default());
        }
        Ok(self.config.chains.keys().cloned().collect())
    }

    fn try_chain(
        &mut self,
        spec: &PodSchedulingSpec,
        chain_name: &str,
        priority: CellPriority,
        now: SystemTime,
    ) -> Option<mapper::MapOutcome> {
        if priority.is_guaranteed() {
            let reservation = spec.reservation_id.as_ref().and_then(|res_id| {
                self.graph
                    .virtual_forest(&spec.vc, chain_name)
                    .and_then(|f| f.reservation_roots.get(res_id))
                    .copied()
            });
            let placement = {
                let chain = self.graph.chain(chain_name)?;
                let forest = self.graph.virtual_forest(&spec.vc, chain_name)?;
                self.intra_vc.schedule(chain, forest, &spec.pod_numbers, reservation)?
            };
            mapper::map(
                &mut self.graph,
                &mut self.freelist,
                &mut self.groups,
                &spec.vc,
                chain_name,
                &spec.group,
                priority,
                now,
                &placement,
            )
        } else {
            let physical = {
                let chain = self.graph.chain(chain_name)?;
                let free = self.freelist.chain(chain_name)?;
                self.opportunistic.schedule(chain, free, &spec.pod_numbers)?
            };
            for pods in physical.values() {
                for cells in pods {
                    for &cell_id in cells {
                        self.freelist.take(chain_name, &self.graph, cell_id);
                    }
                }
            }
            for pods in physical.values() {
                for cells in pods {
                    for &cell_id in cells {
                        self.graph
                            .chain_mut(chain_name)
                            .unwrap()
                            .assign_used(cell_id, spec.group.clone(), priority);
                    }
                }
            }
            Some(mapper::MapOutcome { physical, victims: BTreeMap::new(), has_victims: false })
        }
    }

    fn commit_new_group(
        &mut self,
        spec: &PodSchedulingSpec,
        pod: &str,
        chain_name: &str,
        priority: CellPriority,
        outcome: mapper::MapOutcome,
    ) -> PodScheduleResult {
        let mut group = AffinityGroup::new_allocated(
            spec.group.clone(),
            spec.vc.clone(),
            chain_name.to_string(),
            priority,
            spec.gang_release,
            spec.lazy_preemption_enable,
            spec.pod_numbers.clone(),
        );
        group.physical_placement = outcome.physical.clone();
        if outcome.has_victims {
            group.state = GroupState::Preempting;
            group.victims = outcome.victims.clone();
        }

        let index = group.first_open_slot(spec.gpu_count).unwrap_or(0);
        group.bind_slot(spec.gpu_count, index, pod.to_string());
        if outcome.has_victims {
            group.preemptor_pods.insert(pod.to_string());
        }

        let cells = group
            .physical_placement
            .get(&spec.gpu_count)
            .and_then(|v| v.get(index))
            .cloned()
            .unwrap_or_default();
        let placement = self.placement_from_cells(chain_name, &cells);
        let victims = self.victims_by_node(chain_name, &outcome.victims);

        self.groups.insert(spec.group.clone(), group);

        PodScheduleResult {
            placement,
            slot_index: Some(index),
            priority: Some(priority),
            victims,
        }
    }

    fn placement_from_cells(&self, chain_name: &str, cells: &[PhysicalCellId]) -> Option<PodPlacement> {
        let chain = self.graph.chain(chain_name)?;
        let first = cells.first()?;
        let node = chain.cell(*first).leaves.first()?.node.clone();
        let mut gpu_indices = Vec::with_capacity(cells.len());
        let mut preassigned_cell_types = Vec::with_capacity(cells.len());
        for &id in cells {
            let cell = chain.cell(id);
            if let Some(addr) = cell.leaves.first() {
                gpu_indices.push(addr.index);
            }
            preassigned_cell_types.push(cell.level);
        }
        Some(PodPlacement { node, gpu_indices, preassigned_cell_types })
    }

    /// Reports, per victim node, every pod id currently bound in a victim
    /// group that has a cell on that node. An approximation of pod
    /// identity at the granularity this crate tracks it.
    fn victims_by_node(
        &self,
        chain_name: &str,
        victims: &BTreeMap<GroupName, Vec<PhysicalCellId>>,
    ) -> BTreeMap<String, Vec<PodId>> {
        let mut out: BTreeMap<String, Vec<PodId>> = BTreeMap::new();
        let Some(chain) = self.graph.chain(chain_name) else {
            return out;
        };
        for (victim_group, cells) in victims {
            let Some(group) = self.groups.get(victim_group) else {
                continue;
            };
            for &cell_id in cells {
                let Some(addr) = chain.cell(cell_id).leaves.first() else {
                    continue;
                };
                for pod_id in group.allocated_pods.values().flatten().flatten() {
                    out.entry(addr.node.clone()).or_default().push(pod_id.clone());
                }
            }
        }
        for pods in out.values_mut() {
            pods.sort();
            pods.dedup();
        }
        out
    }

    fn add_allocated_pod(&mut self, info: &PodBindInfo) {
        let Some(cell_id) = self.graph.leaf_at(&info.chain, &info.node, info.gpu_index) else {
            log::warn!(
                "AddAllocatedPod: unknown address {}/{} on chain '{}' (external drift, ignored)",
                info.node,
                info.gpu_index,
                info.chain
            );
            return;
        };
        let priority = priority_from(info.priority, self.config.min_guaranteed_priority);

        if !self.groups.contains_key(&info.group) {
            let mut pod_numbers = BTreeMap::new();
            pod_numbers.insert(info.gpu_count, 1);
            self.groups.insert(
                info.group.clone(),
                AffinityGroup::new_allocated(
                    info.group.clone(),
                    info.vc.clone(),
                    info.chain.clone(),
                    priority,
                    info.gang_release,
                    info.lazy_preemption_enable,
                    pod_numbers,
                ),
            );
        }

        let was_preempting;
        {
            let group = self.groups.get_mut(&info.group).unwrap();
            was_preempting = group.state == GroupState::Preempting;
            let slots = group.allocated_pods.entry(info.gpu_count).or_default();
            let slot_index = match slots.iter().position(|s| s.as_deref() == Some(info.pod.as_str())) {
                Some(i) => i,
                None => match slots.iter().position(Option::is_none) {
                    Some(i) => i,
                    None => {
                        slots.push(None);
                        slots.len() - 1
                    }
                },
            };
            slots[slot_index] = Some(info.pod.clone());
            let cells = group.physical_placement.entry(info.gpu_count).or_default();
            while cells.len() <= slot_index {
                cells.push(Vec::new());
            }
            if !cells[slot_index].contains(&cell_id) {
                cells[slot_index].push(cell_id);
            }
            if was_preempting {
                group.preemptor_pods.remove(&info.pod);
            }
        }

        let currently_free = self
            .graph
            .chain(&info.chain)
            .map(|c| c.cell(cell_id).state() == CellState::Free)
            .unwrap_or(false);
        if currently_free {
            self.freelist.take(&info.chain, &self.graph, cell_id);
            self.graph.chain_mut(&info.chain).unwrap().assign_used(cell_id, info.group.clone(), priority);
        }

        if was_preempting {
            let group = self.groups.get_mut(&info.group).unwrap();
            if group.preemptor_pods.is_empty() {
                group.state = GroupState::Allocated;
            }
        }
    }

    fn delete_allocated_pod(&mut self, group_name: &str, gpu_count: u32, pod: &str) {
        let Some(group) = self.groups.get_mut(group_name) else {
            return;
        };
        let Some(idx) = group
            .allocated_pods
            .get(&gpu_count)
            .and_then(|slots| slots.iter().position(|s| s.as_deref() == Some(pod)))
        else {
            return;
        };
        let all_cells: Vec<PhysicalCellId> = group.all_cells().collect();
        let chain_name = group.chain.clone();
        group.clear_slot(gpu_count, idx);
        if !group.is_empty() {
            return;
        }

        for cell_id in all_cells {
            let Some(chain) = self.graph.chain(&chain_name) else {
                continue;
            };
            match chain.cell(cell_id).state() {
                CellState::Used => {
                    self.graph.chain_mut(&chain_name).unwrap().release(cell_id);
                    self.freelist.release(&chain_name, &mut self.graph, cell_id);
                }
                CellState::Acquiring => {
                    let acquiring = chain.cell(cell_id).acquiring_group().cloned();
                    let new_priority = acquiring
                        .as_ref()
                        .and_then(|g| self.groups.get(g))
                        .map(|g| g.priority)
                        .unwrap_or(CellPriority::Opportunistic);
                    self.graph.chain_mut(&chain_name).unwrap().settle_acquired(cell_id, new_priority);
                }
                _ => {}
            }
        }
        self.groups.remove(group_name);
    }

    fn delete_unallocated_pod(&mut self, group_name: &str, pod: &str) {
        let Some(group) = self.groups.get_mut(group_name) else {
            return;
        };
        if group.state != GroupState::Preempting {
            return;
        }
        group.preemptor_pods.remove(pod);
        if group.preemptor_pods.is_empty() {
            let chain_name = group.chain.clone();
            group::cancel_preemptor(&mut self.groups, &mut self.graph, &chain_name, group_name);
        }
    }

    fn set_node_healthy(&mut self, chain_name: &str, node: &str, healthy: bool) {
        if healthy {
            self.health.set_healthy_node(&mut self.graph, &mut self.freelist, chain_name, node);
        } else {
            self.health.set_bad_node(&mut self.graph, &mut self.freelist, chain_name, node);
        }
    }

    fn cluster_status(&self) -> ClusterStatus {
        let mut cells = Vec::new();
        for (chain_name, chain) in self.graph.chains() {
            for id in chain.ids() {
                let node = chain.cell(id);
                cells.push(CellStatus {
                    chain: chain_name.clone(),
                    level: node.level,
                    leaves: node.leaves.clone(),
                    healthy: node.healthy,
                    vc: node.bound_virtual.as_ref().map(|(vc, _)| vc.clone()),
                    priority: node.priority,
                    histogram: node.histogram.clone(),
                });
            }
        }
        ClusterStatus { cells }
    }

    fn vc_status(&self, vc: &str) -> VcStatus {
        let mut placements = Vec::new();
        for chain_name in self.config.chains.keys() {
            let (Some(forest), Some(chain)) =
                (self.graph.virtual_forest(vc, chain_name), self.graph.chain(chain_name))
            else {
                continue;
            };
            let roots = forest
                .quota_roots
                .values()
                .flatten()
                .copied()
                .chain(forest.reservation_roots.values().copied());
            for root in roots {
                let node = forest.cell(root);
                placements.push(VcCellPlacement {
                    chain: chain_name.clone(),
                    level: node.level,
                    bound_physical: node.bound_physical.map(|p| chain.cell(p).leaves.clone()),
                    healthy: node.healthy,
                });
            }
        }

        let lazy_preemptions = self
            .groups
            .iter()
            .filter(|(_, g)| g.vc == vc)
            .filter_map(|(name, g)| g.lazy_preemption.clone().map(|r| (name.clone(), r)))
            .collect();

        VcStatus { placements, lazy_preemptions }
    }
}
