//! Best-parent selection and the main chain view.
//!
//! The best parent of a unit is the parent with the highest witnessed level,
//! then the highest level, then the smallest hash. The main chain is the
//! best-parent path from the best free unit down to genesis. Its stable prefix
//! is owned by the DAG; the unstable tail above it is recomputed from the
//! current tip whenever it is needed, so tentative indices never get persisted.

use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

use crate::consensus::dag::{Dag, UnitError, UnitId, UnitRecord};
use crate::consensus::{invariant_violation, ConsensusError};

/// Ranking key: larger is better.
fn rank(record: &UnitRecord) -> (Option<u64>, u64, Reverse<UnitId>) {
    (record.witnessed_level, record.level, Reverse(record.id()))
}

/// Compare two candidates. `Ordering::Greater` means `a` is the better one.
pub fn compare_candidates(a: &UnitRecord, b: &UnitRecord) -> Ordering {
    rank(a).cmp(&rank(b))
}

fn best_of<'a, I>(dag: &Dag, candidates: I) -> Result<Option<UnitId>, ConsensusError>
where
    I: IntoIterator<Item = &'a UnitId>,
{
    let mut best: Option<&UnitRecord> = None;
    for id in candidates {
        let record = dag.get(id).ok_or(ConsensusError::MissingUnit(*id))?;
        best = match best {
            Some(current) if compare_candidates(current, record) != Ordering::Less => Some(current),
            _ => Some(record),
        };
    }
    Ok(best.map(UnitRecord::id))
}

/// Pick the best parent among `parents`.
pub fn select_best_parent(dag: &Dag, parents: &[UnitId]) -> Result<UnitId, ConsensusError> {
    for parent in parents {
        if !dag.contains(parent) {
            return Err(UnitError::MissingParent(*parent).into());
        }
    }
    best_of(dag, parents)?.ok_or(ConsensusError::InvalidUnit(UnitError::NoParents))
}

/// Pick the best unit among `candidates`, e.g. a set of later units.
pub fn select_best_unit(dag: &Dag, candidates: &[UnitId]) -> Result<Option<UnitId>, ConsensusError> {
    best_of(dag, candidates)
}

/// The tip the main chain is built from: the best free unit whose best-parent
/// path reaches the top of the stable main chain.
pub fn select_best_tip(dag: &Dag) -> Result<UnitId, ConsensusError> {
    Ok(MainChain::build(dag)?.tip())
}

/// Index at which the best-parent path from `id` first meets the stable main
/// chain.
///
/// The path always ends at genesis. A unit may only be cited by units whose
/// last ball index is at most the anchor index of every parent; the result
/// is the same on every node whose stable point has reached that last ball.
pub fn anchor_index(dag: &Dag, id: &UnitId) -> Result<u64, ConsensusError> {
    let mut cursor = *id;
    loop {
        let record = dag.get(&cursor).ok_or(ConsensusError::MissingUnit(cursor))?;
        if record.is_stable && record.is_on_main_chain {
            return record
                .main_chain_index
                .ok_or_else(|| invariant_violation(format!("stable main chain unit {cursor} has no index")));
        }
        cursor = record
            .best_parent
            .ok_or_else(|| invariant_violation(format!("unit {cursor} has no best parent")))?;
    }
}

/// The main chain as seen from one tip.
///
/// Indices up to the DAG's stable point come from the stable main chain; the
/// tail holds the unstable best-parent path above it, lowest first.
#[derive(Clone, Debug)]
pub struct MainChain<'a> {
    dag: &'a Dag,
    tail: Vec<UnitId>,
    tail_index: HashMap<UnitId, u64>,
}

impl<'a> MainChain<'a> {
    /// The main chain from the best free unit that can still carry it.
    ///
    /// Free units whose best-parent path meets the stable part of the DAG
    /// below the stable main chain top are skipped, however well they rank.
    /// When no free unit qualifies the chain ends at the stable point.
    pub fn build(dag: &'a Dag) -> Result<Self, ConsensusError> {
        let mut candidates = dag
            .free_units()
            .map(|id| dag.get(id).ok_or(ConsensusError::MissingUnit(*id)))
            .collect::<Result<Vec<_>, _>>()?;
        candidates.sort_by(|a, b| compare_candidates(b, a));
        for candidate in candidates {
            let tip = candidate.id();
            if let Some(mc) = Self::walk(dag, &tip)? {
                return Ok(mc);
            }
            tracing::trace!(unit = %tip, "Free unit left the stable main chain");
        }
        let top = dag
            .stable_main_chain()
            .last()
            .copied()
            .unwrap_or(*dag.genesis());
        Self::walk(dag, &top)?
            .ok_or_else(|| invariant_violation(format!("stable main chain top {top} is not on the stable main chain")))
    }

    /// The main chain from an arbitrary tip.
    ///
    /// Returns `None` when the tip's best-parent path meets the stable part of
    /// the DAG anywhere but the top of the stable main chain; such a tip can
    /// never carry the main chain.
    pub fn from_tip(dag: &'a Dag, tip: &UnitId) -> Result<Option<Self>, ConsensusError> {
        Self::walk(dag, tip)
    }

    fn walk(dag: &'a Dag, tip: &UnitId) -> Result<Option<Self>, ConsensusError> {
        let mut path = Vec::new();
        let mut cursor = *tip;
        loop {
            let record = dag.get(&cursor).ok_or(ConsensusError::MissingUnit(cursor))?;
            if record.is_stable {
                let on_stable_chain = record
                    .main_chain_index
                    .and_then(|mci| dag.stable_main_chain_unit(mci))
                    .is_some_and(|mc_unit| *mc_unit == cursor);
                if !on_stable_chain {
                    return Ok(None);
                }
                if record.main_chain_index != Some(dag.stable_point()) {
                    // joins below the top and skips stable indices
                    return Ok(None);
                }
                break;
            }
            path.push(cursor);
            cursor = match record.best_parent {
                Some(bp) => bp,
                None => return Err(invariant_violation(format!("unstable unit {cursor} has no best parent"))),
            };
        }

        path.reverse();
        let base = dag.stable_point() + 1;
        let tail_index = path
            .iter()
            .enumerate()
            .map(|(offset, id)| (*id, base + offset as u64))
            .collect();
        Ok(Some(MainChain {
            dag,
            tail: path,
            tail_index,
        }))
    }

    /// Highest index of this main chain.
    pub fn last_mci(&self) -> u64 {
        self.dag.stable_point() + self.tail.len() as u64
    }

    /// Highest stable index.
    pub fn stable_point(&self) -> u64 {
        self.dag.stable_point()
    }

    /// The unit at the top of the chain.
    pub fn tip(&self) -> UnitId {
        *self
            .tail
            .last()
            .or_else(|| self.dag.stable_main_chain().last())
            .unwrap_or(self.dag.genesis())
    }

    /// The main chain unit at `mci`, stable or tentative.
    pub fn unit_at(&self, mci: u64) -> Option<UnitId> {
        let stable_point = self.dag.stable_point();
        if mci <= stable_point {
            return self.dag.stable_main_chain_unit(mci).copied();
        }
        self.tail.get((mci - stable_point - 1) as usize).copied()
    }

    /// Main chain index of `id` if it is on this chain.
    pub fn mci_of(&self, id: &UnitId) -> Option<u64> {
        if let Some(mci) = self.tail_index.get(id) {
            return Some(*mci);
        }
        let record = self.dag.get(id)?;
        if record.is_stable && record.is_on_main_chain {
            record.main_chain_index
        } else {
            None
        }
    }

    /// The unstable part of the chain, lowest index first.
    pub fn unstable_tail(&self) -> &[UnitId] {
        &self.tail
    }

    /// Main chain units with index in `from..=to`.
    pub fn path(&self, from: u64, to: u64) -> Result<Vec<UnitId>, ConsensusError> {
        if from > to {
            return Err(ConsensusError::InvalidRange { low: from, high: to });
        }
        if to > self.last_mci() {
            return Err(ConsensusError::EmptyMainChainIndex(to));
        }
        (from..=to)
            .map(|mci| self.unit_at(mci).ok_or(ConsensusError::EmptyMainChainIndex(mci)))
            .collect()
    }

    pub fn dag(&self) -> &'a Dag {
        self.dag
    }
}
