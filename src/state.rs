//! Ledger state management.
//!
//! Tracks:
//! - The unit graph with its structural and consensus fields
//! - The witness committee and address definitions, as of every stable index
//! - The persisted copy of both, through a `Storage` backend
//!
//! `Ledger` is the single writer of consensus fields. Every mutation goes
//! through `add_unit`, `advance_stability`, `mark_stable_by_later_units` or
//! `archive_unit`, and a stability batch is persisted before it becomes
//! visible in memory.

use crate::consensus::dag::{Address, Ball, Dag, Unit, UnitError, UnitId, UnitMessage, UnitRecord};
use crate::consensus::main_chain::{anchor_index, select_best_parent, select_best_tip, select_best_unit, MainChain};
use crate::consensus::skiplist::{self, ProofChain};
use crate::consensus::stability::{self, UnitState};
use crate::consensus::witnessed_level::compute_witnessed_level;
use crate::consensus::witnesses::{ChangeEvent, Committee, CommitteeTracker};
use crate::consensus::{invariant_violation, ConsensusError};
use crate::storage::{StabilityBatch, Storage};
use crate::Hash;

/// Stable point before and after one committed stability batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StabilityAdvance {
    pub old_mci: u64,
    pub new_mci: u64,
}

/// The consensus state of one node.
pub struct Ledger<S: Storage> {
    dag: Dag,
    committees: CommitteeTracker,
    storage: S,
}

impl<S: Storage> Ledger<S> {
    /// Open a ledger on `storage`.
    ///
    /// An empty store is initialized with the network's genesis unit; otherwise
    /// the unit graph, the stable main chain and the committee history are
    /// rebuilt from what was stored.
    pub fn open(storage: S, network: &str, genesis_committee: Committee) -> Result<Self, ConsensusError> {
        let Some(stable_point) = storage.stable_point()? else {
            let dag = Dag::new(Dag::genesis_unit(network, &genesis_committee))?;
            let genesis = dag
                .get(dag.genesis())
                .cloned()
                .ok_or_else(|| invariant_violation("new DAG has no genesis record"))?;
            storage.append_stability_batch(&StabilityBatch {
                from_mci: 0,
                to_mci: 0,
                units: vec![genesis],
                change_events: Vec::new(),
            })?;
            tracing::info!(network, genesis = %dag.genesis(), "Initialized ledger at genesis");
            return Ok(Ledger {
                dag,
                committees: CommitteeTracker::new(genesis_committee),
                storage,
            });
        };

        let dag = Dag::restore(storage.get_all_units()?)?;
        if dag.stable_point() != stable_point {
            return Err(invariant_violation(format!(
                "stored stable point {stable_point} but stored main chain reaches {}",
                dag.stable_point()
            )));
        }
        let events = storage.get_committee_change_events(stable_point)?;
        let committees = CommitteeTracker::restore(genesis_committee, events, stable_point)?;
        tracing::info!(
            stable_point,
            units = dag.len(),
            genesis = %dag.genesis(),
            "Restored ledger from storage"
        );
        Ok(Ledger {
            dag,
            committees,
            storage,
        })
    }

    /// Validate a unit against the DAG and insert it.
    ///
    /// Does not advance stability; call `advance_stability` afterwards.
    pub fn add_unit(&mut self, unit: Unit) -> Result<UnitId, ConsensusError> {
        unit.validate_structure()?;
        let id = unit.id;
        if unit.is_genesis() {
            return Err(UnitError::NoParents.into());
        }
        if self.dag.contains(&id) {
            return Err(UnitError::DuplicateUnit.into());
        }
        for parent in &unit.parents {
            if !self.dag.contains(parent) {
                return Err(UnitError::MissingParent(*parent).into());
            }
        }
        self.check_last_ball(&unit)?;
        for message in &unit.messages {
            if let UnitMessage::CommitteeProposal(addresses) = message {
                Committee::new(addresses.clone())?;
            }
        }

        let level = self.dag.level_for(&unit.parents)?;
        let best_parent = select_best_parent(&self.dag, &unit.parents)?;
        let committee = self.committees.resolve_committee(unit.last_ball_mci)?;
        let witnessed_level = compute_witnessed_level(&self.dag, &best_parent, committee)?.as_option();

        let record = UnitRecord::unstable(unit, level, Some(best_parent), witnessed_level);
        self.storage.put_unit(&record)?;
        self.dag.insert(record)?;
        tracing::debug!(unit = %id, level, witnessed_level = ?witnessed_level, "Unit added");
        Ok(id)
    }

    fn check_last_ball(&self, unit: &Unit) -> Result<(), ConsensusError> {
        let stable_point = self.dag.stable_point();
        if unit.last_ball_mci > stable_point {
            return Err(ConsensusError::NotYetStable {
                requested: unit.last_ball_mci,
                stable_point,
            });
        }
        let expected = self.dag.stable_main_chain_unit(unit.last_ball_mci);
        if unit.last_ball_unit.as_ref() != expected {
            return Err(ConsensusError::LastBallMismatch {
                mci: unit.last_ball_mci,
            });
        }
        for parent in &unit.parents {
            let parent_mci = self
                .dag
                .get(parent)
                .map_or(0, |p| p.unit.last_ball_mci);
            if parent_mci > unit.last_ball_mci {
                return Err(ConsensusError::LastBallRetreats {
                    mci: unit.last_ball_mci,
                    parent_mci,
                });
            }
            let anchor = anchor_index(&self.dag, parent)?;
            if anchor < unit.last_ball_mci {
                return Err(ConsensusError::StaleParent {
                    parent: *parent,
                    anchor,
                    last_ball_mci: unit.last_ball_mci,
                });
            }
        }
        Ok(())
    }

    /// Advance stability as far as the current best tip proves.
    ///
    /// Returns `None` when nothing new became stable. A failed attempt leaves
    /// every previously stable index as it was and can simply be retried.
    pub fn advance_stability(&mut self) -> Result<Option<StabilityAdvance>, ConsensusError> {
        let batch = {
            let mc = MainChain::build(&self.dag)?;
            let committee = self.committee_for_view(&mc.tip())?;
            let to = stability::last_stable_index(&mc, committee)?;
            if to <= mc.stable_point() {
                return Ok(None);
            }
            stability::build_stability_batch(&mc, to)?
        };
        self.commit(batch).map(Some)
    }

    /// The committee a view rooted at `tip` is judged with.
    fn committee_for_view(&self, tip: &UnitId) -> Result<&Committee, ConsensusError> {
        let record = self.dag.get(tip).ok_or(ConsensusError::MissingUnit(*tip))?;
        self.committees.resolve_committee(record.unit.last_ball_mci)
    }

    /// Is `earlier` stable in the view of the `later` units?
    pub fn determine_if_stable_in_later_units(
        &self,
        earlier: &UnitId,
        later: &[UnitId],
    ) -> Result<bool, ConsensusError> {
        Ok(self.stable_target_in_later_units(earlier, later)?.is_some())
    }

    fn stable_target_in_later_units(
        &self,
        earlier: &UnitId,
        later: &[UnitId],
    ) -> Result<Option<(UnitId, u64)>, ConsensusError> {
        let Some(tip) = select_best_unit(&self.dag, later)? else {
            return Ok(None);
        };
        let committee = self.committee_for_view(&tip)?;
        let target =
            stability::determine_if_stable_in_later_units(&self.dag, earlier, later, committee)?;
        Ok(target.map(|mci| (tip, mci)))
    }

    /// Make `earlier` stable if the `later` units prove it.
    ///
    /// Every index up to `earlier`'s is stabilized in one batch along the
    /// main chain of the best later unit.
    pub fn mark_stable_by_later_units(
        &mut self,
        earlier: &UnitId,
        later: &[UnitId],
    ) -> Result<Option<StabilityAdvance>, ConsensusError> {
        let Some((tip, target)) = self.stable_target_in_later_units(earlier, later)? else {
            return Ok(None);
        };
        if target <= self.dag.stable_point() {
            return Ok(None);
        }
        let batch = {
            let mc = MainChain::from_tip(&self.dag, &tip)?
                .ok_or_else(|| invariant_violation(format!("view tip {tip} left the stable main chain")))?;
            stability::build_stability_batch(&mc, target)?
        };
        self.commit(batch).map(Some)
    }

    fn commit(&mut self, mut batch: StabilityBatch) -> Result<StabilityAdvance, ConsensusError> {
        let old_mci = self.dag.stable_point();
        batch.change_events = self.committees.admit(std::mem::take(&mut batch.change_events))?;
        self.storage.append_stability_batch(&batch)?;
        self.dag.apply_stability_batch(&batch)?;
        self.committees.record(&batch.change_events, batch.to_mci)?;
        tracing::info!(
            old_mci,
            new_mci = batch.to_mci,
            units = batch.units.len(),
            changes = batch.change_events.len(),
            "Advanced stability"
        );
        Ok(StabilityAdvance {
            old_mci,
            new_mci: batch.to_mci,
        })
    }

    /// Delete an unstable unit that is permanently off the main chain.
    ///
    /// The unit must have no children and its best-parent path must meet the
    /// stable main chain below the stable point. Such a unit can never carry
    /// the main chain, and no unit with the current last ball may cite it.
    pub fn archive_unit(&mut self, id: &UnitId) -> Result<(), ConsensusError> {
        let record = self.dag.get(id).ok_or(ConsensusError::MissingUnit(*id))?;
        if record.is_stable {
            return Err(ConsensusError::NotArchivable(*id, "unit is stable"));
        }
        if !self.dag.children(id).is_empty() {
            return Err(ConsensusError::NotArchivable(*id, "unit has children"));
        }
        if anchor_index(&self.dag, id)? >= self.dag.stable_point() {
            return Err(ConsensusError::NotArchivable(*id, "unit can still join the main chain"));
        }
        self.storage.remove_unit(id)?;
        if self.dag.remove(id).is_none() {
            return Err(invariant_violation(format!("unit {id} vanished while archiving")));
        }
        tracing::info!(unit = %id, "Archived unit");
        Ok(())
    }

    /// Compose a unit on top of the current free units, referencing the
    /// current stable main chain top as its last ball.
    ///
    /// Free units that left the stable main chain are not cited. With no free
    /// unit left to cite, the unit builds on the last ball unit itself.
    pub fn compose_unit(&self, authors: Vec<Address>, messages: Vec<UnitMessage>) -> Unit {
        let (last_ball_unit, last_ball_mci) = self.last_ball();
        let mut parents: Vec<UnitId> = self
            .dag
            .free_units()
            .filter(|id| matches!(anchor_index(&self.dag, id), Ok(anchor) if anchor >= last_ball_mci))
            .copied()
            .collect();
        if parents.is_empty() {
            parents.push(last_ball_unit);
        }
        parents.truncate(crate::constants::MAX_PARENTS_PER_UNIT);
        let mut authors = authors;
        authors.sort();
        authors.dedup();
        Unit::new(parents, authors, Some(last_ball_unit), last_ball_mci, messages)
    }

    /// The top of the stable main chain and its index.
    pub fn last_ball(&self) -> (UnitId, u64) {
        let mci = self.dag.stable_point();
        let unit = self
            .dag
            .stable_main_chain_unit(mci)
            .copied()
            .unwrap_or(*self.dag.genesis());
        (unit, mci)
    }

    pub fn is_stable(&self, id: &UnitId) -> bool {
        self.dag.get(id).is_some_and(|r| r.is_stable)
    }

    pub fn stable_point(&self) -> u64 {
        self.dag.stable_point()
    }

    pub fn unit_state(&self, id: &UnitId) -> Result<UnitState, ConsensusError> {
        let mc = MainChain::build(&self.dag)?;
        stability::unit_state(&mc, id)
    }

    /// Main chain units with index in `from..=to`, stable or tentative.
    pub fn main_chain_path(&self, from: u64, to: u64) -> Result<Vec<UnitId>, ConsensusError> {
        MainChain::build(&self.dag)?.path(from, to)
    }

    pub fn main_chain(&self) -> Result<MainChain<'_>, ConsensusError> {
        MainChain::build(&self.dag)
    }

    pub fn best_tip(&self) -> Result<UnitId, ConsensusError> {
        select_best_tip(&self.dag)
    }

    pub fn build_proof_chain(&self, low: u64, high: u64) -> Result<ProofChain, ConsensusError> {
        skiplist::build_proof_chain(&self.dag, low, high)
    }

    pub fn genesis_ball(&self) -> Result<Ball, ConsensusError> {
        self.dag
            .get(self.dag.genesis())
            .and_then(|r| r.ball)
            .ok_or_else(|| invariant_violation("genesis has no ball"))
    }

    pub fn resolve_committee(&self, mci: u64) -> Result<&Committee, ConsensusError> {
        self.committees.resolve_committee(mci)
    }

    pub fn pending_committee_change(&self, mci: u64) -> Result<Option<&ChangeEvent>, ConsensusError> {
        self.committees.pending_committee_change(mci)
    }

    pub fn resolve_definition(&self, address: &Address, mci: u64) -> Result<Hash, ConsensusError> {
        self.committees.resolve_definition(address, mci)
    }

    pub fn pending_definition_change(
        &self,
        address: &Address,
        mci: u64,
    ) -> Result<Option<&ChangeEvent>, ConsensusError> {
        self.committees.pending_definition_change(address, mci)
    }

    pub fn get_unit(&self, id: &UnitId) -> Option<&UnitRecord> {
        self.dag.get(id)
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.dag.contains(id)
    }

    /// Stable units at `mci`, in ball order.
    pub fn units_at_mci(&self, mci: u64) -> &[UnitId] {
        self.dag.units_at_mci(mci)
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }
}
