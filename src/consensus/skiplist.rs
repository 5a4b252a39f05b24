//! Skiplists and proof chains over the stable main chain.
//!
//! The main chain unit at index `m` commits, through its ball, to the balls of
//! the main chain units at `m - 2^k` for every `k >= 1` with `2^k` dividing `m`.
//! A proof chain walks from a high index down to a low one using the largest
//! jump that does not overshoot, which needs at most about `2 * log2(range)`
//! links: jumps grow while the index picks up trailing zero bits, then shrink
//! as the low end gets close.

use serde::{Deserialize, Serialize};

use crate::consensus::dag::{Ball, Dag, UnitId};
use crate::consensus::{invariant_violation, ConsensusError};

/// Indices the main chain unit at `mci` points back to, nearest first.
///
/// Position `k - 1` holds `mci - 2^k`.
pub fn skiplist_targets(mci: u64) -> Vec<u64> {
    if mci == 0 {
        return Vec::new();
    }
    (1..=mci.trailing_zeros())
        .map(|k| mci - (1u64 << k))
        .collect()
}

/// Next index on the way from `current` down to `low`.
///
/// Takes the longest skiplist jump that stays at or above `low`, or the best
/// parent edge (a jump of one) when there is none.
pub fn next_jump(current: u64, low: u64) -> u64 {
    debug_assert!(current > low);
    let mut k = current.trailing_zeros();
    while k >= 1 {
        let hop = 1u64 << k;
        if current - hop >= low {
            return current - hop;
        }
        k -= 1;
    }
    current - 1
}

/// Indices visited from `high` down to `low`, both included.
pub fn jump_path(low: u64, high: u64) -> Vec<u64> {
    let mut path = vec![high];
    let mut current = high;
    while current > low {
        current = next_jump(current, low);
        path.push(current);
    }
    path
}

/// One main chain unit in a proof chain, with everything needed to recompute
/// its ball.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofLink {
    pub mci: u64,
    pub unit: UnitId,
    pub ball: Ball,
    /// Balls of all parents, ascending
    pub parent_balls: Vec<Ball>,
    /// Skiplist balls, position `k - 1` for the unit `2^k` indices back
    pub skiplist_balls: Vec<Ball>,
}

/// A chain of stable main chain units, highest index first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofChain {
    pub links: Vec<ProofLink>,
}

impl ProofChain {
    /// The balls of the chain, highest index first.
    pub fn balls(&self) -> Vec<Ball> {
        self.links.iter().map(|l| l.ball).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

fn stable_ball(dag: &Dag, id: &UnitId) -> Result<Ball, ConsensusError> {
    let record = dag.get(id).ok_or(ConsensusError::MissingUnit(*id))?;
    record
        .ball
        .ok_or_else(|| invariant_violation(format!("stable ancestry of {id} has no ball")))
}

/// Build the proof chain from `high` down to `low` over the stable main chain.
pub fn build_proof_chain(dag: &Dag, low: u64, high: u64) -> Result<ProofChain, ConsensusError> {
    if low > high {
        return Err(ConsensusError::InvalidRange { low, high });
    }
    let stable_point = dag.stable_point();
    if high > stable_point {
        return Err(ConsensusError::NotYetStable {
            requested: high,
            stable_point,
        });
    }

    let mut links = Vec::new();
    for mci in jump_path(low, high) {
        let unit = *dag
            .stable_main_chain_unit(mci)
            .ok_or(ConsensusError::EmptyMainChainIndex(mci))?;
        let record = dag.get(&unit).ok_or(ConsensusError::MissingUnit(unit))?;
        let ball = stable_ball(dag, &unit)?;
        let mut parent_balls = record
            .unit
            .parents
            .iter()
            .map(|p| stable_ball(dag, p))
            .collect::<Result<Vec<_>, _>>()?;
        parent_balls.sort();
        let skiplist_balls = record
            .skiplist_units
            .iter()
            .map(|s| stable_ball(dag, s))
            .collect::<Result<Vec<_>, _>>()?;
        links.push(ProofLink {
            mci,
            unit,
            ball,
            parent_balls,
            skiplist_balls,
        });
    }
    Ok(ProofChain { links })
}

/// Errors found while verifying a proof chain.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("proof chain is empty")]
    Empty,
    #[error("ball at index {mci} does not match its contents")]
    BallMismatch { mci: u64 },
    #[error("proof chain does not descend at index {mci}")]
    NotDescending { mci: u64 },
    #[error("index {mci} does not reference the previous link as a parent")]
    BrokenParentLink { mci: u64 },
    #[error("index {mci} has no skiplist entry for a jump of {hop}")]
    BrokenSkiplistLink { mci: u64, hop: u64 },
    #[error("jump of {hop} from index {mci} is not a power of two")]
    InvalidHop { mci: u64, hop: u64 },
    #[error("proof chain ends at index 0 with a ball other than genesis")]
    GenesisMismatch,
}

/// Check a proof chain, holding only the genesis ball.
///
/// Every ball is recomputed from its contents, and every link must be
/// referenced by the one above it, either as a parent (a jump of one) or
/// through the skiplist (a jump of `2^k`).
pub fn verify_proof_chain(chain: &ProofChain, genesis_ball: &Ball) -> Result<(), ProofError> {
    let last = chain.links.last().ok_or(ProofError::Empty)?;
    for link in &chain.links {
        if Ball::compute(&link.unit, &link.parent_balls, &link.skiplist_balls) != link.ball {
            return Err(ProofError::BallMismatch { mci: link.mci });
        }
    }
    for pair in chain.links.windows(2) {
        let (upper, lower) = (&pair[0], &pair[1]);
        if lower.mci >= upper.mci {
            return Err(ProofError::NotDescending { mci: upper.mci });
        }
        let hop = upper.mci - lower.mci;
        if hop == 1 {
            if !upper.parent_balls.contains(&lower.ball) {
                return Err(ProofError::BrokenParentLink { mci: upper.mci });
            }
            continue;
        }
        if !hop.is_power_of_two() {
            return Err(ProofError::InvalidHop { mci: upper.mci, hop });
        }
        let position = (hop.trailing_zeros() - 1) as usize;
        if upper.skiplist_balls.get(position) != Some(&lower.ball) {
            return Err(ProofError::BrokenSkiplistLink { mci: upper.mci, hop });
        }
    }
    if last.mci == 0 && last.ball != *genesis_ball {
        return Err(ProofError::GenesisMismatch);
    }
    Ok(())
}
