//! # Witnessed main-chain consensus
//!
//! Orders the DAG of units into one main chain and decides which prefix of it
//! is final, using a 12-address witness committee.
//!
//! ## How It Works
//!
//! ```text
//! unit arrives
//!   1. level          = 1 + max(parent levels)
//!   2. best parent    = max by (witnessed level, level, smallest hash)
//!   3. witnessed level= walk best parents from the best parent until 7 distinct
//!                       committee members are seen; take the lowest level seen
//!   4. main chain     = best-parent path from the best free unit to genesis
//!   5. stability      = the first unstable MC unit is stable once the lowest
//!                       witnessed level on the majority-witnessed MC above it is
//!                       at least the highest level of any competing branch
//!   6. advance        = for each newly stable index, give every unit that index,
//!                       sort by (level, hash) and assign balls
//!   7. skiplist       = MC unit at index m also commits to MC units at m - 2^k
//! ```
//!
//! Every decision is a pure function of DAG content and already-stable state.
//! Nothing node-local (arrival order, pending pools) reaches the decision surface.

pub mod dag;
pub mod main_chain;
pub mod skiplist;
pub mod stability;
pub mod witnessed_level;
pub mod witnesses;

use crate::consensus::dag::{UnitError, UnitId};
use crate::storage::StorageError;

/// Where an error sits in the consensus error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input. Rejected, never repaired.
    Structural,
    /// Something is not known or not stable locally yet. Fetch and retry.
    Transient,
    /// A programming-contract violation. Reported, state left untouched.
    Invariant,
}

/// Errors returned by the consensus core.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("invalid unit: {0}")]
    InvalidUnit(#[from] UnitError),
    #[error("committee resolved {resolved} distinct witnesses, expected {expected}")]
    IncompleteCommittee { resolved: usize, expected: usize },
    #[error("last ball unit does not match the stable main chain at index {mci}")]
    LastBallMismatch { mci: u64 },
    #[error("last ball index {mci} retreats below parent's last ball index {parent_mci}")]
    LastBallRetreats { mci: u64, parent_mci: u64 },
    #[error("parent {parent} meets the stable main chain at index {anchor}, below last ball index {last_ball_mci}")]
    StaleParent {
        parent: UnitId,
        anchor: u64,
        last_ball_mci: u64,
    },
    #[error("requested range {low}..={high} is empty or reversed")]
    InvalidRange { low: u64, high: u64 },
    #[error("unit {0} cannot be archived: {1}")]
    NotArchivable(UnitId, &'static str),

    #[error("unit not known locally: {0}")]
    MissingUnit(UnitId),
    #[error("main chain index {requested} is not stable yet (stable point {stable_point})")]
    NotYetStable { requested: u64, stable_point: u64 },
    #[error("main chain index {0} has no assigned units")]
    EmptyMainChainIndex(u64),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("consensus invariant violated: {0}")]
    InvariantViolation(String),
}

impl ConsensusError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ConsensusError::InvalidUnit(UnitError::MissingParent(_)) => ErrorClass::Transient,
            ConsensusError::InvalidUnit(_)
            | ConsensusError::IncompleteCommittee { .. }
            | ConsensusError::LastBallMismatch { .. }
            | ConsensusError::LastBallRetreats { .. }
            | ConsensusError::StaleParent { .. }
            | ConsensusError::InvalidRange { .. }
            | ConsensusError::NotArchivable(..) => ErrorClass::Structural,
            ConsensusError::MissingUnit(_)
            | ConsensusError::NotYetStable { .. }
            | ConsensusError::EmptyMainChainIndex(_)
            | ConsensusError::Storage(_) => ErrorClass::Transient,
            ConsensusError::InvariantViolation(_) => ErrorClass::Invariant,
        }
    }

    /// Whether the caller should back off and retry later.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Report a broken invariant.
///
/// Panics in debug builds. In release builds the violation is logged and
/// returned so the caller can skip the operation without halting the node.
pub(crate) fn invariant_violation(detail: impl Into<String>) -> ConsensusError {
    let detail = detail.into();
    tracing::error!(detail = %detail, "Consensus invariant violated");
    debug_assert!(false, "consensus invariant violated: {detail}");
    ConsensusError::InvariantViolation(detail)
}
