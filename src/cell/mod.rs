//! The cell graph: the static and dynamic topology. A forest of chains,
//! each chain a tree of cells from GPU (level 1) up to the chain root.
//! Physical and virtual variants share only structural fields (chain,
//! level, parent, children) and a healthiness read-out, so they are
//! modeled as separate node types rather than one inheritance hierarchy.
//!
//! Cells live in per-chain arenas (`Vec<_>`), addressed by index
//! (`PhysicalCellId` / `VirtualCellId`), never by pointer — the binding
//! between a virtual and a physical cell is two plain `Option` fields
//! rather than a cyclic reference.

mod graph;
mod physical;
mod priority;
mod state;
mod virtual_cell;

pub use graph::{CellGraph, PhysicalChain, VirtualForest};
pub use physical::PhysicalCellNode;
pub use priority::CellPriority;
pub use state::CellState;
pub use virtual_cell::VirtualCellNode;

/// A chain level. Level 1 is the GPU leaf; levels increase toward the
/// chain root.
pub type Level = u32;

/// Index of a physical cell within one chain's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalCellId(pub u32);

/// Index of a virtual cell within one (VC, chain) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualCellId(pub u32);
