//! Witnessed level: how deep a unit's history is confirmed by the committee.
//!
//! Starting from a unit's best parent, follow best parents toward genesis and
//! collect the distinct committee members that authored the visited units.
//! When a majority has been collected, the witnessed level is the lowest level
//! among the units that contributed a witness, which is the level of the unit
//! where the walk stopped.
//!
//! Each step strictly decreases the level, so the walk is bounded by the
//! DAG depth and ends at genesis at the latest.

use std::collections::BTreeSet;

use crate::consensus::dag::{Address, Dag, UnitId};
use crate::consensus::witnesses::Committee;
use crate::consensus::ConsensusError;
use crate::constants::MAJORITY_OF_WITNESSES;

/// Result of a witnessed-level walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WitnessedLevel {
    Level(u64),
    /// Genesis was passed before a majority of the committee was seen.
    NotComputable,
}

impl WitnessedLevel {
    pub fn as_option(self) -> Option<u64> {
        match self {
            WitnessedLevel::Level(level) => Some(level),
            WitnessedLevel::NotComputable => None,
        }
    }
}

/// The details of one walk, kept for diagnostics and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WitnessWalk {
    pub witnessed_level: WitnessedLevel,
    /// Distinct committee members collected, ascending
    pub witnesses: Vec<Address>,
    /// Units visited, starting unit first
    pub steps: usize,
}

/// Walk best parents from `start` until a majority of `committee` is seen.
pub fn walk_witnesses(
    dag: &Dag,
    start: &UnitId,
    committee: &Committee,
) -> Result<WitnessWalk, ConsensusError> {
    let mut collected: BTreeSet<Address> = BTreeSet::new();
    let mut min_level = u64::MAX;
    let mut steps = 0usize;
    let mut cursor = Some(*start);

    while let Some(uid) = cursor {
        let record = dag.get(&uid).ok_or(ConsensusError::MissingUnit(uid))?;
        steps += 1;
        let mut contributed = false;
        for author in &record.unit.authors {
            if committee.contains(author) && collected.insert(*author) {
                contributed = true;
            }
        }
        if contributed {
            min_level = min_level.min(record.level);
        }
        if collected.len() >= MAJORITY_OF_WITNESSES {
            return Ok(WitnessWalk {
                witnessed_level: WitnessedLevel::Level(min_level),
                witnesses: collected.into_iter().collect(),
                steps,
            });
        }
        cursor = record.best_parent;
    }

    Ok(WitnessWalk {
        witnessed_level: WitnessedLevel::NotComputable,
        witnesses: collected.into_iter().collect(),
        steps,
    })
}

/// Witnessed level of a new unit whose best parent is `best_parent`.
pub fn compute_witnessed_level(
    dag: &Dag,
    best_parent: &UnitId,
    committee: &Committee,
) -> Result<WitnessedLevel, ConsensusError> {
    Ok(walk_witnesses(dag, best_parent, committee)?.witnessed_level)
}
