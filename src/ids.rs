//! Shared name-based identifiers used across modules.
//!
//! Groups, VCs, chains, and reservations are all named by the host
//! configuration or request, so they are addressed by `String` rather than
//! through another arena — only the cell graph itself needs index-stable
//! arena ids (`cell::PhysicalCellId` / `cell::VirtualCellId`).

/// Name of an affinity group. Unique across the engine.
pub type GroupName = String;

/// Name of a virtual cluster (tenant).
pub type VcName = String;

/// Name of a hardware chain.
pub type ChainName = String;

/// Name of a reservation, unique within a VC.
pub type ReservationId = String;

/// Name of a physical node.
pub type NodeName = String;
