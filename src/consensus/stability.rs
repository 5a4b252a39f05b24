//! Stability: which prefix of the main chain can never change again.
//!
//! The first unstable main chain index `m` is stable in the view of a tip when
//! both hold:
//!
//! 1. walking the main chain down from the tip, a majority of the committee is
//!    collected before reaching `m`; `min_mc_wl` is the lowest witnessed level
//!    among the units that contributed a witness
//! 2. `min_mc_wl` is at least the highest level of any competing branch
//!    rooted next to `m` (best children of `m - 1` other than the main chain
//!    unit); with no competing branch the bar is the level of the main chain
//!    unit at `m` itself
//!
//! The node's own advancement counts every competing unit it knows, whether
//! or not the tip includes it. A query on behalf of later units counts only
//! what those units include.
//!
//! Indices are proven one at a time from the stable point upward. A batch
//! then gives every newly stable index its units, sorted by (level, hash),
//! and computes their balls.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::consensus::dag::{Ball, Dag, UnitId, UnitRecord};
use crate::consensus::main_chain::{select_best_unit, MainChain};
use crate::consensus::skiplist::skiplist_targets;
use crate::consensus::witnesses::{ChangeEvent, Committee};
use crate::consensus::{invariant_violation, ConsensusError};
use crate::constants::MAJORITY_OF_WITNESSES;
use crate::storage::StabilityBatch;

/// Consensus state of one unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitState {
    /// Not yet included by the current main chain.
    Unstable,
    /// Holds a tentative main chain index that may still change.
    PendingStable { mci: u64 },
    /// Final.
    Stable { mci: u64, ball: Ball },
}

/// Result of the witness walk down the main chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MajorityWalk {
    /// Lowest witnessed level among units that contributed a witness
    pub min_wl: u64,
    /// Index at which the majority was complete
    pub majority_mci: u64,
}

/// Walk the unstable main chain down from its tip until a committee majority
/// is collected.
///
/// `None` when the walk reaches the stable point first, or when a
/// contributing unit has no witnessed level.
pub fn min_mc_witnessed_level(
    mc: &MainChain<'_>,
    committee: &Committee,
) -> Result<Option<MajorityWalk>, ConsensusError> {
    let dag = mc.dag();
    let floor = mc.stable_point();
    let mut collected = BTreeSet::new();
    let mut min_wl = u64::MAX;
    let mut mci = mc.last_mci();
    while mci > floor {
        let id = mc.unit_at(mci).ok_or(ConsensusError::EmptyMainChainIndex(mci))?;
        let record = dag.get(&id).ok_or(ConsensusError::MissingUnit(id))?;
        let mut contributed = false;
        for author in &record.unit.authors {
            if committee.contains(author) && collected.insert(*author) {
                contributed = true;
            }
        }
        if contributed {
            match record.witnessed_level {
                Some(wl) => min_wl = min_wl.min(wl),
                None => return Ok(None),
            }
        }
        if collected.len() >= MAJORITY_OF_WITNESSES {
            return Ok(Some(MajorityWalk {
                min_wl,
                majority_mci: mci,
            }));
        }
        mci -= 1;
    }
    Ok(None)
}

/// Every unit included by `later`, above the top of the stable main chain.
pub fn included_by(dag: &Dag, later: &[UnitId]) -> HashSet<UnitId> {
    let floor_level = dag
        .stable_main_chain()
        .last()
        .and_then(|id| dag.get(id))
        .map_or(0, |r| r.level);
    let mut included = HashSet::new();
    for id in later {
        included.extend(dag.ancestors_above_level(id, floor_level));
    }
    included
}

/// Highest level on branches competing with the main chain unit at `mci`.
///
/// Branches are followed through best children and pruned at the first unit
/// `included` does not contain.
pub fn max_alt_level(
    mc: &MainChain<'_>,
    included: &HashSet<UnitId>,
    mci: u64,
) -> Result<Option<u64>, ConsensusError> {
    if mci == 0 {
        return Ok(None);
    }
    let dag = mc.dag();
    let below = mc.unit_at(mci - 1).ok_or(ConsensusError::EmptyMainChainIndex(mci - 1))?;
    let on_chain = mc.unit_at(mci).ok_or(ConsensusError::EmptyMainChainIndex(mci))?;

    let mut stack: Vec<UnitId> = dag
        .best_children(&below)
        .iter()
        .filter(|c| **c != on_chain && included.contains(*c))
        .copied()
        .collect();
    let mut max_level = None;
    while let Some(id) = stack.pop() {
        let record = dag.get(&id).ok_or(ConsensusError::MissingUnit(id))?;
        max_level = Some(max_level.map_or(record.level, |l: u64| l.max(record.level)));
        stack.extend(
            dag.best_children(&id)
                .iter()
                .filter(|c| included.contains(*c))
                .copied(),
        );
    }
    Ok(max_level)
}

/// Is main chain index `mci` stable in the view described by `walk` and
/// `included`? Indices below `mci` are assumed stable.
pub fn is_index_stable(
    mc: &MainChain<'_>,
    included: &HashSet<UnitId>,
    walk: Option<&MajorityWalk>,
    mci: u64,
) -> Result<bool, ConsensusError> {
    if mci <= mc.stable_point() {
        return Ok(true);
    }
    let Some(walk) = walk else {
        return Ok(false);
    };
    if walk.majority_mci <= mci {
        return Ok(false);
    }
    let id = mc.unit_at(mci).ok_or(ConsensusError::EmptyMainChainIndex(mci))?;
    let level = mc
        .dag()
        .get(&id)
        .ok_or(ConsensusError::MissingUnit(id))?
        .level;
    let bar = max_alt_level(mc, included, mci)?.unwrap_or(level);
    tracing::trace!(mci, min_wl = walk.min_wl, bar, "Checking index stability");
    Ok(walk.min_wl >= bar)
}

/// The highest index that is stable along `mc`, with every branch the DAG
/// holds counted as competition.
pub fn last_stable_index(mc: &MainChain<'_>, committee: &Committee) -> Result<u64, ConsensusError> {
    let walk = min_mc_witnessed_level(mc, committee)?;
    let Some(walk) = walk else {
        return Ok(mc.stable_point());
    };
    let free: Vec<UnitId> = mc.dag().free_units().copied().collect();
    let included = included_by(mc.dag(), &free);
    let mut mci = mc.stable_point();
    while mci < walk.majority_mci && is_index_stable(mc, &included, Some(&walk), mci + 1)? {
        mci += 1;
    }
    Ok(mci)
}

/// Unstable ancestors of `start` (inclusive) that are not in `assigned` yet.
/// Newly found units are added to `assigned`.
fn collect_unassigned(
    dag: &Dag,
    start: &UnitId,
    assigned: &mut HashSet<UnitId>,
) -> Result<Vec<UnitId>, ConsensusError> {
    let mut found = Vec::new();
    let mut stack = vec![*start];
    while let Some(id) = stack.pop() {
        if assigned.contains(&id) {
            continue;
        }
        let record = dag.get(&id).ok_or(ConsensusError::MissingUnit(id))?;
        if record.is_stable {
            continue;
        }
        assigned.insert(id);
        found.push(id);
        stack.extend(record.unit.parents.iter().copied());
    }
    Ok(found)
}

/// Tentative main chain index of `id`: the lowest index whose main chain unit
/// includes it.
pub fn tentative_index(mc: &MainChain<'_>, id: &UnitId) -> Result<Option<u64>, ConsensusError> {
    if let Some(mci) = mc.mci_of(id) {
        return Ok(Some(mci));
    }
    let dag = mc.dag();
    let mut assigned = HashSet::new();
    for mci in mc.stable_point() + 1..=mc.last_mci() {
        let mc_unit = mc.unit_at(mci).ok_or(ConsensusError::EmptyMainChainIndex(mci))?;
        collect_unassigned(dag, &mc_unit, &mut assigned)?;
        if assigned.contains(id) {
            return Ok(Some(mci));
        }
    }
    Ok(None)
}

/// Current state of a unit in the view of `mc`.
pub fn unit_state(mc: &MainChain<'_>, id: &UnitId) -> Result<UnitState, ConsensusError> {
    let record = mc.dag().get(id).ok_or(ConsensusError::MissingUnit(*id))?;
    if record.is_stable {
        return match (record.main_chain_index, record.ball) {
            (Some(mci), Some(ball)) => Ok(UnitState::Stable { mci, ball }),
            _ => Err(invariant_violation(format!("stable unit {id} without index or ball"))),
        };
    }
    Ok(match tentative_index(mc, id)? {
        Some(mci) => UnitState::PendingStable { mci },
        None => UnitState::Unstable,
    })
}

/// Is `earlier` stable in the view of the `later` units?
///
/// Pure query: the view's main chain is built from the best of `later`, and
/// only units `later` include count as competing branches.
pub fn determine_if_stable_in_later_units(
    dag: &Dag,
    earlier: &UnitId,
    later: &[UnitId],
    committee: &Committee,
) -> Result<Option<u64>, ConsensusError> {
    let record = dag.get(earlier).ok_or(ConsensusError::MissingUnit(*earlier))?;
    if record.is_stable {
        return Ok(record.main_chain_index);
    }
    let Some(tip) = select_best_unit(dag, later)? else {
        return Ok(None);
    };
    let Some(mc) = MainChain::from_tip(dag, &tip)? else {
        return Ok(None);
    };
    let Some(target) = tentative_index(&mc, earlier)? else {
        return Ok(None);
    };

    let walk = min_mc_witnessed_level(&mc, committee)?;
    let included = included_by(dag, later);
    for mci in mc.stable_point() + 1..=target {
        if !is_index_stable(&mc, &included, walk.as_ref(), mci)? {
            return Ok(None);
        }
    }
    Ok(Some(target))
}

fn ball_of(dag: &Dag, fresh: &HashMap<UnitId, Ball>, id: &UnitId) -> Result<Ball, ConsensusError> {
    if let Some(ball) = fresh.get(id) {
        return Ok(*ball);
    }
    dag.get(id)
        .and_then(|r| r.ball)
        .ok_or_else(|| invariant_violation(format!("unit {id} has no ball when its child is stabilized")))
}

/// Build the batch that makes `stable_point + 1 ..= to` stable along `mc`.
///
/// Fails with `EmptyMainChainIndex` (retryable) if any index in the range has
/// no main chain unit, leaving nothing half done.
pub fn build_stability_batch(mc: &MainChain<'_>, to: u64) -> Result<StabilityBatch, ConsensusError> {
    let dag = mc.dag();
    let from = mc.stable_point() + 1;
    if to < from {
        return Err(ConsensusError::InvalidRange { low: from, high: to });
    }

    let mut assigned = HashSet::new();
    let mut fresh: HashMap<UnitId, Ball> = HashMap::new();
    let mut units: Vec<UnitRecord> = Vec::new();
    let mut change_events: Vec<ChangeEvent> = Vec::new();

    for mci in from..=to {
        let mc_unit = mc.unit_at(mci).ok_or(ConsensusError::EmptyMainChainIndex(mci))?;
        let mut ids = collect_unassigned(dag, &mc_unit, &mut assigned)?;
        if ids.is_empty() {
            return Err(ConsensusError::EmptyMainChainIndex(mci));
        }
        let mut records: Vec<&UnitRecord> = ids
            .drain(..)
            .map(|id| dag.get(&id).ok_or(ConsensusError::MissingUnit(id)))
            .collect::<Result<_, _>>()?;
        records.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id().cmp(&b.id())));

        for current in records {
            let id = current.id();
            let on_main_chain = id == mc_unit;
            let parent_balls = current
                .unit
                .parents
                .iter()
                .map(|p| ball_of(dag, &fresh, p))
                .collect::<Result<Vec<_>, _>>()?;
            let (skiplist_units, skiplist_balls) = if on_main_chain {
                let mut skiplist_units = Vec::new();
                let mut skiplist_balls = Vec::new();
                for target in skiplist_targets(mci) {
                    let unit = mc
                        .unit_at(target)
                        .ok_or(ConsensusError::EmptyMainChainIndex(target))?;
                    skiplist_balls.push(ball_of(dag, &fresh, &unit)?);
                    skiplist_units.push(unit);
                }
                (skiplist_units, skiplist_balls)
            } else {
                (Vec::new(), Vec::new())
            };
            let ball = Ball::compute(&id, &parent_balls, &skiplist_balls);
            fresh.insert(id, ball);

            let mut record = current.clone();
            record.main_chain_index = Some(mci);
            record.is_on_main_chain = on_main_chain;
            record.is_stable = true;
            record.ball = Some(ball);
            record.skiplist_units = skiplist_units;
            change_events.extend(ChangeEvent::from_record(&record, mci)?);
            units.push(record);
        }
    }

    Ok(StabilityBatch {
        from_mci: from,
        to_mci: to,
        units,
        change_events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::dag::{Address, Unit, UnitMessage};
    use crate::consensus::main_chain::{anchor_index, compare_candidates, select_best_parent};
    use crate::consensus::witnessed_level::compute_witnessed_level;
    use crate::consensus::witnesses::tests::{test_committee, witness};

    struct Builder {
        dag: Dag,
        committee: Committee,
        nonce: u64,
    }

    impl Builder {
        fn new() -> Self {
            let committee = test_committee();
            let dag = Dag::new(Dag::genesis_unit("test", &committee)).unwrap();
            Builder {
                dag,
                committee,
                nonce: 0,
            }
        }

        fn genesis(&self) -> UnitId {
            *self.dag.genesis()
        }

        fn tip(&self) -> UnitId {
            crate::consensus::main_chain::select_best_tip(&self.dag).unwrap()
        }

        fn add(&mut self, parents: &[UnitId], author: Address) -> UnitId {
            let mut parents = parents.to_vec();
            parents.sort();
            self.nonce += 1;
            let unit = Unit::new(
                parents.clone(),
                vec![author],
                Some(self.genesis()),
                0,
                vec![UnitMessage::Data(self.nonce.to_le_bytes().to_vec())],
            );
            let best = select_best_parent(&self.dag, &parents).unwrap();
            let level = self.dag.level_for(&parents).unwrap();
            let wl = compute_witnessed_level(&self.dag, &best, &self.committee)
                .unwrap()
                .as_option();
            let id = unit.id;
            self.dag
                .insert(UnitRecord::unstable(unit, level, Some(best), wl))
                .unwrap();
            id
        }

        /// Extend `from` with one unit per level, authored by `witness(level % 12)`.
        fn chain(&mut self, from: UnitId, count: u64) -> Vec<UnitId> {
            let mut ids = Vec::new();
            let mut tip = from;
            for _ in 0..count {
                let level = self.dag.get(&tip).unwrap().level + 1;
                tip = self.add(&[tip], witness((level % 12) as u8));
                ids.push(tip);
            }
            ids
        }

        fn last_stable(&self) -> u64 {
            let mc = MainChain::build(&self.dag).unwrap();
            last_stable_index(&mc, &self.committee).unwrap()
        }

        fn advance(&mut self) -> u64 {
            let batch = {
                let mc = MainChain::build(&self.dag).unwrap();
                let to = last_stable_index(&mc, &self.committee).unwrap();
                if to == mc.stable_point() {
                    return to;
                }
                build_stability_batch(&mc, to).unwrap()
            };
            self.dag.apply_stability_batch(&batch).unwrap();
            self.dag.stable_point()
        }
    }

    #[test]
    fn linear_chain_stabilizes_thirteen_below_tip() {
        let mut b = Builder::new();
        let g = b.genesis();
        b.chain(g, 13);
        assert_eq!(b.last_stable(), 0);
        let tip = b.tip();
        let more = b.chain(tip, 7);
        assert_eq!(b.last_stable(), 7);
        assert_eq!(b.advance(), 7);
        assert_eq!(b.dag.stable_point(), 7);

        // tip at 20: witnessed levels of the top seven are 7..13
        let tip = *more.last().unwrap();
        assert_eq!(b.dag.get(&tip).unwrap().witnessed_level, Some(13));
    }

    #[test]
    fn batch_assigns_balls_and_skiplists() {
        let mut b = Builder::new();
        let g = b.genesis();
        let chain = b.chain(g, 30);
        assert_eq!(b.advance(), 17);

        for (offset, id) in chain.iter().take(17).enumerate() {
            let record = b.dag.get(id).unwrap();
            assert!(record.is_stable);
            assert!(record.is_on_main_chain);
            assert_eq!(record.main_chain_index, Some(offset as u64 + 1));
            assert!(record.ball.is_some());
        }
        let eight = b.dag.get(&chain[7]).unwrap();
        assert_eq!(eight.skiplist_units, vec![chain[5], chain[3], g]);
        let parent_ball = b.dag.get(&chain[6]).unwrap().ball.unwrap();
        let skip_balls: Vec<Ball> = eight
            .skiplist_units
            .iter()
            .map(|id| b.dag.get(id).unwrap().ball.unwrap())
            .collect();
        assert_eq!(
            eight.ball,
            Some(Ball::compute(&chain[7], &[parent_ball], &skip_balls))
        );
        assert!(!b.dag.get(&chain[17]).unwrap().is_stable);
    }

    #[test]
    fn included_competing_branch_raises_the_bar() {
        let mut b = Builder::new();
        let g = b.genesis();
        let outsider = Address([0xee; 32]);
        let main = b.chain(g, 11);
        let mut side = vec![b.add(&[g], outsider)];
        for _ in 1..10 {
            let top = *side.last().unwrap();
            side.push(b.add(&[top], outsider));
        }
        // level 12 merges the side branch into the main chain
        let merge = b.add(&[main[10], side[9]], witness(0));
        assert_eq!(b.dag.get(&merge).unwrap().best_parent, Some(main[10]));
        let top = b.chain(merge, 10);
        assert_eq!(b.dag.get(top.last().unwrap()).unwrap().level, 22);
        assert_eq!(b.last_stable(), 0, "side branch reaches level 10");

        b.chain(*top.last().unwrap(), 1);
        assert_eq!(b.last_stable(), 10);

        let tip = b.tip();
        b.chain(tip, 2);
        assert_eq!(b.advance(), 12);
        let at_merge = b.dag.units_at_mci(12);
        assert_eq!(at_merge.len(), 11);
        assert_eq!(at_merge[0], side[0]);
        assert_eq!(*at_merge.last().unwrap(), merge);
        for id in &side {
            let record = b.dag.get(id).unwrap();
            assert_eq!(record.main_chain_index, Some(12));
            assert!(!record.is_on_main_chain);
        }
    }

    #[test]
    fn unreferenced_branch_blocks_until_outgrown() {
        let mut b = Builder::new();
        let g = b.genesis();
        let outsider = Address([0xee; 32]);
        let mut top = b.add(&[g], outsider);
        for _ in 1..10 {
            top = b.add(&[top], outsider);
        }
        let main = b.chain(g, 14);
        assert_eq!(b.tip(), *main.last().unwrap());
        assert_eq!(b.last_stable(), 0, "known side branch reaches level 10");

        // at level 24 the lowest witnessed level on the walk is 11
        b.chain(*main.last().unwrap(), 10);
        assert_eq!(b.advance(), 11);
        assert!(!b.dag.get(&top).unwrap().is_stable);
    }

    #[test]
    fn branch_cannot_overtake_after_finalization() {
        let mut b = Builder::new();
        let g = b.genesis();
        let main = b.chain(g, 14);
        let side = b.chain(g, 10);
        assert_eq!(b.advance(), 0);

        // the side branch outgrows the main branch before anything is final
        let side_top = b.chain(*side.last().unwrap(), 20);
        assert_eq!(b.tip(), *side_top.last().unwrap());
        assert_eq!(b.advance(), 17);
        let mc = MainChain::build(&b.dag).unwrap();
        assert_eq!(mc.unit_at(1), Some(side[0]));

        // the abandoned branch keeps growing but joins below the stable top
        let late = b.chain(*main.last().unwrap(), 30);
        let late_tip = *late.last().unwrap();
        let best_free = b
            .dag
            .free_units()
            .map(|id| b.dag.get(id).unwrap())
            .max_by(|x, y| compare_candidates(x, y))
            .unwrap();
        assert_eq!(best_free.id(), late_tip);
        assert_eq!(b.tip(), *side_top.last().unwrap());
        assert_eq!(anchor_index(&b.dag, &late_tip).unwrap(), 0);
        assert_eq!(b.advance(), 17);
        let mc = MainChain::build(&b.dag).unwrap();
        assert_eq!(unit_state(&mc, &late_tip).unwrap(), UnitState::Unstable);
    }

    #[test]
    fn missing_main_chain_index_is_retryable() {
        let mut b = Builder::new();
        let g = b.genesis();
        b.chain(g, 5);
        let mc = MainChain::build(&b.dag).unwrap();
        let err = build_stability_batch(&mc, 6).unwrap_err();
        assert!(matches!(err, ConsensusError::EmptyMainChainIndex(6)));
        assert!(err.is_retryable());
        assert!(matches!(
            build_stability_batch(&mc, 0),
            Err(ConsensusError::InvalidRange { .. })
        ));
    }

    #[test]
    fn stability_in_later_units() {
        let mut b = Builder::new();
        let g = b.genesis();
        let chain = b.chain(g, 30);
        let five = chain[4];
        let committee = b.committee.clone();
        assert_eq!(
            determine_if_stable_in_later_units(&b.dag, &five, &[chain[16]], &committee).unwrap(),
            None
        );
        assert_eq!(
            determine_if_stable_in_later_units(&b.dag, &five, &[chain[17]], &committee).unwrap(),
            Some(5)
        );
        assert_eq!(
            determine_if_stable_in_later_units(&b.dag, &five, &[chain[2], chain[17]], &committee).unwrap(),
            Some(5)
        );
    }

    #[test]
    fn unit_states_progress() {
        let mut b = Builder::new();
        let g = b.genesis();
        let chain = b.chain(g, 20);
        let outsider = Address([0xee; 32]);
        let loose = b.add(&[chain[2]], outsider);
        {
            let mc = MainChain::build(&b.dag).unwrap();
            assert_eq!(unit_state(&mc, &chain[9]).unwrap(), UnitState::PendingStable { mci: 10 });
            assert_eq!(unit_state(&mc, &loose).unwrap(), UnitState::Unstable);
        }
        b.advance();
        let mc = MainChain::build(&b.dag).unwrap();
        assert!(matches!(
            unit_state(&mc, &chain[0]).unwrap(),
            UnitState::Stable { mci: 1, .. }
        ));
    }
}
