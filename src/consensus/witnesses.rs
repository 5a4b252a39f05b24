//! Witness committee and address definition tracking.
//!
//! Committee replacements and definition changes are recorded only when the
//! unit carrying them becomes stable, anchored at that unit's main chain
//! index. A change recorded at index `c` is effective for every query at
//! `mci >= c`.
//!
//! Every query goes through one boundary check (`mci <= stable_point`) and one
//! resolver (`effective_as_of`). "What is effective at M" and "is a change
//! pending after M" therefore can never disagree about which changes exist.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::consensus::dag::{Address, UnitId, UnitMessage, UnitRecord};
use crate::consensus::{invariant_violation, ConsensusError};
use crate::constants::COMMITTEE_SIZE;
use crate::Hash;

/// The witness committee: exactly `COMMITTEE_SIZE` distinct addresses, ascending.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Address>", into = "Vec<Address>")]
pub struct Committee {
    addresses: Vec<Address>,
}

impl Committee {
    /// Build a committee, rejecting anything but 12 distinct addresses.
    pub fn new(addresses: Vec<Address>) -> Result<Self, ConsensusError> {
        let mut addresses = addresses;
        addresses.sort();
        addresses.dedup();
        if addresses.len() != COMMITTEE_SIZE {
            return Err(ConsensusError::IncompleteCommittee {
                resolved: addresses.len(),
                expected: COMMITTEE_SIZE,
            });
        }
        Ok(Committee { addresses })
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.addresses.binary_search(address).is_ok()
    }
}

impl TryFrom<Vec<Address>> for Committee {
    type Error = ConsensusError;

    fn try_from(addresses: Vec<Address>) -> Result<Self, Self::Error> {
        Committee::new(addresses)
    }
}

impl From<Committee> for Vec<Address> {
    fn from(committee: Committee) -> Self {
        committee.addresses
    }
}

/// What a change event changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    CommitteeReplacement(Committee),
    DefinitionChange {
        address: Address,
        definition_chash: Hash,
    },
}

/// A stable committee or definition change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Main chain index the change is anchored to
    pub mci: u64,
    /// Level of the carrying unit (orders changes within one index)
    pub level: u64,
    /// The carrying unit
    pub unit: UnitId,
    /// Position of the message inside the unit
    pub seq: u32,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    fn order_key(&self) -> (u64, u64, UnitId, u32) {
        (self.mci, self.level, self.unit, self.seq)
    }

    /// The address a definition change applies to.
    pub fn address(&self) -> Option<&Address> {
        match &self.kind {
            ChangeKind::DefinitionChange { address, .. } => Some(address),
            ChangeKind::CommitteeReplacement(_) => None,
        }
    }

    /// Extract the change events a unit carries, anchored at `mci`.
    pub fn from_record(record: &UnitRecord, mci: u64) -> Result<Vec<ChangeEvent>, ConsensusError> {
        let mut events = Vec::new();
        for (seq, message) in record.unit.messages.iter().enumerate() {
            let kind = match message {
                UnitMessage::Data(_) => continue,
                UnitMessage::CommitteeProposal(addresses) => {
                    ChangeKind::CommitteeReplacement(Committee::new(addresses.clone())?)
                }
                UnitMessage::DefinitionChange {
                    address,
                    definition_chash,
                } => ChangeKind::DefinitionChange {
                    address: *address,
                    definition_chash: *definition_chash,
                },
            };
            events.push(ChangeEvent {
                mci,
                level: record.level,
                unit: record.id(),
                seq: seq as u32,
                kind,
            });
        }
        Ok(events)
    }
}

/// The latest entry at or below `mci`.
fn effective_as_of<T>(history: &BTreeMap<u64, T>, mci: u64) -> Option<&T> {
    history.range(..=mci).next_back().map(|(_, v)| v)
}

/// The first entry strictly above `mci`.
fn first_after<T>(history: &BTreeMap<u64, T>, mci: u64) -> Option<&T> {
    history
        .range((Bound::Excluded(mci), Bound::Unbounded))
        .next()
        .map(|(_, v)| v)
}

/// Resolves committees and address definitions from stable change events.
#[derive(Clone, Debug)]
pub struct CommitteeTracker {
    genesis_committee: Committee,
    /// Committee replacements by anchoring index (one per index)
    committees: BTreeMap<u64, ChangeEvent>,
    /// Definition changes per address by anchoring index (one per index)
    definitions: HashMap<Address, BTreeMap<u64, ChangeEvent>>,
    /// Highest index whose changes have been recorded
    stable_point: u64,
}

impl CommitteeTracker {
    pub fn new(genesis_committee: Committee) -> Self {
        CommitteeTracker {
            genesis_committee,
            committees: BTreeMap::new(),
            definitions: HashMap::new(),
            stable_point: 0,
        }
    }

    /// Rebuild from persisted, already admitted events.
    pub fn restore(
        genesis_committee: Committee,
        events: Vec<ChangeEvent>,
        stable_point: u64,
    ) -> Result<Self, ConsensusError> {
        let mut tracker = CommitteeTracker::new(genesis_committee);
        let mut events = events;
        events.sort_by_key(ChangeEvent::order_key);
        for event in events {
            if event.mci > stable_point {
                return Err(invariant_violation(format!(
                    "stored change at index {} above stable point {stable_point}",
                    event.mci
                )));
            }
            tracker.insert(event);
        }
        tracker.stable_point = stable_point;
        Ok(tracker)
    }

    pub fn stable_point(&self) -> u64 {
        self.stable_point
    }

    pub fn genesis_committee(&self) -> &Committee {
        &self.genesis_committee
    }

    fn check_boundary(&self, mci: u64) -> Result<(), ConsensusError> {
        if mci > self.stable_point {
            return Err(ConsensusError::NotYetStable {
                requested: mci,
                stable_point: self.stable_point,
            });
        }
        Ok(())
    }

    /// The committee effective at `mci`.
    pub fn resolve_committee(&self, mci: u64) -> Result<&Committee, ConsensusError> {
        self.check_boundary(mci)?;
        let committee = match effective_as_of(&self.committees, mci).map(|e| &e.kind) {
            Some(ChangeKind::CommitteeReplacement(committee)) => committee,
            Some(ChangeKind::DefinitionChange { .. }) => {
                return Err(invariant_violation("definition change stored as committee change"));
            }
            None => &self.genesis_committee,
        };
        if committee.addresses().len() != COMMITTEE_SIZE {
            return Err(ConsensusError::IncompleteCommittee {
                resolved: committee.addresses().len(),
                expected: COMMITTEE_SIZE,
            });
        }
        Ok(committee)
    }

    /// The first recorded committee replacement that is not yet effective at `mci`.
    pub fn pending_committee_change(&self, mci: u64) -> Result<Option<&ChangeEvent>, ConsensusError> {
        self.check_boundary(mci)?;
        Ok(first_after(&self.committees, mci))
    }

    /// The definition hash behind `address` at `mci`.
    ///
    /// An address that never changed its definition is the hash of its
    /// initial definition.
    pub fn resolve_definition(&self, address: &Address, mci: u64) -> Result<Hash, ConsensusError> {
        self.check_boundary(mci)?;
        let change = self
            .definitions
            .get(address)
            .and_then(|history| effective_as_of(history, mci));
        match change.map(|e| &e.kind) {
            Some(ChangeKind::DefinitionChange {
                definition_chash, ..
            }) => Ok(*definition_chash),
            Some(ChangeKind::CommitteeReplacement(_)) => {
                Err(invariant_violation("committee change stored as definition change"))
            }
            None => Ok(address.0),
        }
    }

    /// The first recorded definition change of `address` not yet effective at `mci`.
    pub fn pending_definition_change(
        &self,
        address: &Address,
        mci: u64,
    ) -> Result<Option<&ChangeEvent>, ConsensusError> {
        self.check_boundary(mci)?;
        Ok(self
            .definitions
            .get(address)
            .and_then(|history| first_after(history, mci)))
    }

    /// Decide which candidate events take effect.
    ///
    /// Candidates are ordered by (index, level, unit, position). At one
    /// index the first committee replacement wins, and per address the first
    /// definition change wins; later competitors at the same index are dropped.
    /// The outcome depends only on the events, not on how stabilization was
    /// batched.
    pub fn admit(&self, candidates: Vec<ChangeEvent>) -> Result<Vec<ChangeEvent>, ConsensusError> {
        let mut candidates = candidates;
        candidates.sort_by_key(ChangeEvent::order_key);
        let mut admitted: Vec<ChangeEvent> = Vec::with_capacity(candidates.len());
        for event in candidates {
            if event.mci <= self.stable_point {
                return Err(invariant_violation(format!(
                    "change at index {} is not above stable point {}",
                    event.mci, self.stable_point
                )));
            }
            let taken = admitted.iter().any(|prior| {
                prior.mci == event.mci
                    && match (&prior.kind, &event.kind) {
                        (ChangeKind::CommitteeReplacement(_), ChangeKind::CommitteeReplacement(_)) => true,
                        (
                            ChangeKind::DefinitionChange { address: a, .. },
                            ChangeKind::DefinitionChange { address: b, .. },
                        ) => a == b,
                        _ => false,
                    }
            });
            if taken {
                tracing::warn!(
                    mci = event.mci,
                    unit = %event.unit,
                    "Dropping change superseded by an earlier change at the same index"
                );
                continue;
            }
            admitted.push(event);
        }
        Ok(admitted)
    }

    /// Record admitted events and move the boundary to `new_stable_point`.
    pub fn record(&mut self, admitted: &[ChangeEvent], new_stable_point: u64) -> Result<(), ConsensusError> {
        if new_stable_point < self.stable_point {
            return Err(invariant_violation(format!(
                "committee boundary would retreat from {} to {new_stable_point}",
                self.stable_point
            )));
        }
        if let Some(bad) = admitted
            .iter()
            .find(|e| e.mci <= self.stable_point || e.mci > new_stable_point)
        {
            return Err(invariant_violation(format!(
                "change at index {} outside {}..={new_stable_point}",
                bad.mci,
                self.stable_point + 1
            )));
        }
        for event in admitted {
            if let ChangeKind::CommitteeReplacement(_) = event.kind {
                tracing::info!(mci = event.mci, unit = %event.unit, "Witness committee replaced");
            }
            self.insert(event.clone());
        }
        self.stable_point = new_stable_point;
        Ok(())
    }

    fn insert(&mut self, event: ChangeEvent) {
        let mci = event.mci;
        match &event.kind {
            ChangeKind::CommitteeReplacement(_) => {
                self.committees.entry(mci).or_insert(event);
            }
            ChangeKind::DefinitionChange { address, .. } => {
                self.definitions
                    .entry(*address)
                    .or_default()
                    .entry(mci)
                    .or_insert(event);
            }
        }
    }
}
