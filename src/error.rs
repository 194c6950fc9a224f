//! The three error taxonomies this engine distinguishes: request errors are
//! returned here; placement soft failures are ordinary `PodScheduleResult`
//! values (see `result`), not errors; invariant violations are fatal and
//! returned from `Algorithm::new` only.

use thiserror::Error;

/// Caller-supplied input violates the contract. Rejected synchronously;
/// no state is mutated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("unknown vc '{0}'")]
    UnknownVc(String),
    #[error("unknown reservation '{0}' in vc '{1}'")]
    UnknownReservation(String, String),
    #[error("opportunistic priority may not use a reservation")]
    OpportunisticWithReservation,
    #[error("unknown gpu type '{0}'")]
    UnknownGpuType(String),
    #[error("vc '{0}' has no guaranteed quota for gpu type '{1}'")]
    GuaranteedTypeNotInVc(String, String),
    #[error("group '{0}' has no open slot for gpu-count {1} (too many pods)")]
    TooManyPods(String, u32),
    #[error("unknown group '{0}'")]
    UnknownGroup(String),
}

/// Insufficient physical cells to back configured VC quota, or some other
/// condition the engine cannot continue past.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("illegal state transition: {0}")]
    IllegalTransition(String),
}
