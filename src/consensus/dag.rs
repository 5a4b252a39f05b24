//! The unit graph: units, their structural metadata, and the stable main chain.
//!
//! A unit references one or more parents that must already be known. Its
//! structural fields (`level`, `best_parent`, `witnessed_level`) are fixed when
//! it is inserted. Its consensus fields (`main_chain_index`, `is_stable`,
//! `ball`) are written exactly once, by a stability batch.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::consensus::witnesses::Committee;
use crate::consensus::{invariant_violation, ConsensusError};
use crate::storage::StabilityBatch;
use crate::Hash;

/// Unique identifier of a unit: the hash of its content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub Hash);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// An author address. The address is the hash of its initial definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub Hash);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Content hash binding a stable unit to its stable ancestry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ball(pub Hash);

impl Ball {
    /// Compute the ball of a unit.
    ///
    /// Parent balls are hashed in ascending order whatever order they are
    /// passed in. Skiplist balls keep their order: position `k - 1` is the
    /// ball `2^k` main chain indices back.
    pub fn compute(unit: &UnitId, parent_balls: &[Ball], skiplist_balls: &[Ball]) -> Ball {
        let mut sorted: Vec<&Ball> = parent_balls.iter().collect();
        sorted.sort();
        let mut hasher = blake3::Hasher::new_derive_key("keel.ball");
        hasher.update(&unit.0);
        hasher.update(&(sorted.len() as u64).to_le_bytes());
        for b in sorted {
            hasher.update(&b.0);
        }
        hasher.update(&(skiplist_balls.len() as u64).to_le_bytes());
        for b in skiplist_balls {
            hasher.update(&b.0);
        }
        Ball(*hasher.finalize().as_bytes())
    }
}

impl fmt::Display for Ball {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A message carried by a unit.
///
/// Only the messages the consensus core acts on are typed. Everything else
/// (payments, data feeds, AA triggers) travels as opaque `Data`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitMessage {
    /// Opaque application payload.
    Data(Vec<u8>),
    /// Governance proposal replacing the whole witness committee.
    CommitteeProposal(Vec<Address>),
    /// An author changes the definition behind its address.
    DefinitionChange {
        address: Address,
        definition_chash: Hash,
    },
}

impl UnitMessage {
    fn digest(&self) -> Hash {
        match self {
            UnitMessage::Data(bytes) => crate::hash_concat(&[b"data".as_slice(), bytes.as_slice()]),
            UnitMessage::CommitteeProposal(addresses) => {
                let flat: Vec<u8> = addresses.iter().flat_map(|a| a.0).collect();
                crate::hash_concat(&[b"committee".as_slice(), flat.as_slice()])
            }
            UnitMessage::DefinitionChange {
                address,
                definition_chash,
            } => crate::hash_concat(&[
                b"definition".as_slice(),
                address.0.as_slice(),
                definition_chash.as_slice(),
            ]),
        }
    }
}

/// A unit of the DAG.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Content hash of all other fields
    pub id: UnitId,
    /// Parent unit IDs, strictly ascending
    pub parents: Vec<UnitId>,
    /// Author addresses, strictly ascending
    pub authors: Vec<Address>,
    /// The stable main chain unit this unit builds on. `None` only for genesis.
    pub last_ball_unit: Option<UnitId>,
    /// Main chain index of `last_ball_unit`
    pub last_ball_mci: u64,
    /// Payload
    pub messages: Vec<UnitMessage>,
}

impl Unit {
    /// Build a unit and compute its id.
    pub fn new(
        parents: Vec<UnitId>,
        authors: Vec<Address>,
        last_ball_unit: Option<UnitId>,
        last_ball_mci: u64,
        messages: Vec<UnitMessage>,
    ) -> Self {
        let id = Self::compute_id(&parents, &authors, last_ball_unit.as_ref(), last_ball_mci, &messages);
        Unit {
            id,
            parents,
            authors,
            last_ball_unit,
            last_ball_mci,
            messages,
        }
    }

    /// Compute the unit ID from its content.
    pub fn compute_id(
        parents: &[UnitId],
        authors: &[Address],
        last_ball_unit: Option<&UnitId>,
        last_ball_mci: u64,
        messages: &[UnitMessage],
    ) -> UnitId {
        let mut hasher = blake3::Hasher::new_derive_key("keel.unit.id");
        hasher.update(&(parents.len() as u64).to_le_bytes());
        for p in parents {
            hasher.update(&p.0);
        }
        hasher.update(&(authors.len() as u64).to_le_bytes());
        for a in authors {
            hasher.update(&a.0);
        }
        match last_ball_unit {
            Some(lb) => {
                hasher.update(&[1u8]);
                hasher.update(&lb.0);
            }
            None => {
                hasher.update(&[0u8]);
            }
        }
        hasher.update(&last_ball_mci.to_le_bytes());
        hasher.update(&(messages.len() as u64).to_le_bytes());
        for m in messages {
            hasher.update(&m.digest());
        }
        UnitId(*hasher.finalize().as_bytes())
    }

    pub fn is_genesis(&self) -> bool {
        self.parents.is_empty()
    }

    /// Check everything that can be checked without the rest of the DAG.
    pub fn validate_structure(&self) -> Result<(), UnitError> {
        if self.is_genesis() {
            if self.last_ball_unit.is_some() || self.last_ball_mci != 0 {
                return Err(UnitError::GenesisLastBall);
            }
        } else if self.last_ball_unit.is_none() {
            return Err(UnitError::MissingLastBall);
        }
        if self.parents.len() > crate::constants::MAX_PARENTS_PER_UNIT {
            return Err(UnitError::TooManyParents);
        }
        for pair in self.parents.windows(2) {
            if pair[0] == pair[1] {
                return Err(UnitError::DuplicateParent);
            }
            if pair[0] > pair[1] {
                return Err(UnitError::UnorderedParents);
            }
        }

        if self.authors.is_empty() {
            return Err(UnitError::NoAuthors);
        }
        if self.authors.len() > crate::constants::MAX_AUTHORS_PER_UNIT {
            return Err(UnitError::TooManyAuthors);
        }
        for pair in self.authors.windows(2) {
            if pair[0] == pair[1] {
                return Err(UnitError::DuplicateAuthor);
            }
            if pair[0] > pair[1] {
                return Err(UnitError::UnorderedAuthors);
            }
        }

        if self.messages.len() > crate::constants::MAX_MESSAGES_PER_UNIT {
            return Err(UnitError::TooManyMessages);
        }
        for message in &self.messages {
            match message {
                UnitMessage::Data(bytes) if bytes.len() > crate::constants::MAX_DATA_MESSAGE_SIZE => {
                    return Err(UnitError::DataTooLarge);
                }
                UnitMessage::DefinitionChange { address, .. }
                    if self.authors.binary_search(address).is_err() =>
                {
                    return Err(UnitError::ForeignDefinitionChange(*address));
                }
                _ => {}
            }
        }

        let expected_id = Self::compute_id(
            &self.parents,
            &self.authors,
            self.last_ball_unit.as_ref(),
            self.last_ball_mci,
            &self.messages,
        );
        if expected_id != self.id {
            return Err(UnitError::InvalidId);
        }
        Ok(())
    }
}

/// A unit together with everything the consensus core derives for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub unit: Unit,
    /// 1 + max parent level; 0 for genesis
    pub level: u64,
    /// `None` only for genesis
    pub best_parent: Option<UnitId>,
    /// `None` when no witness majority was reachable
    pub witnessed_level: Option<u64>,
    /// Set once, together with `ball`, when the unit becomes stable
    pub main_chain_index: Option<u64>,
    /// Meaningful once stable; the tentative main chain lives in `MainChain`
    pub is_on_main_chain: bool,
    pub is_stable: bool,
    pub ball: Option<Ball>,
    /// Main chain units this unit's ball commits to, nearest first
    #[serde(default)]
    pub skiplist_units: Vec<UnitId>,
}

impl UnitRecord {
    /// A freshly validated, unstable unit.
    pub fn unstable(
        unit: Unit,
        level: u64,
        best_parent: Option<UnitId>,
        witnessed_level: Option<u64>,
    ) -> Self {
        UnitRecord {
            unit,
            level,
            best_parent,
            witnessed_level,
            main_chain_index: None,
            is_on_main_chain: false,
            is_stable: false,
            ball: None,
            skiplist_units: Vec::new(),
        }
    }

    pub fn id(&self) -> UnitId {
        self.unit.id
    }
}

/// The in-memory unit graph.
#[derive(Debug)]
pub struct Dag {
    /// All units indexed by their ID
    units: HashMap<UnitId, UnitRecord>,
    /// Children of each unit (reverse edges)
    children: HashMap<UnitId, Vec<UnitId>>,
    /// Children whose best parent is the key
    best_children: HashMap<UnitId, Vec<UnitId>>,
    /// Units with no children
    free: BTreeSet<UnitId>,
    genesis: UnitId,
    /// Stable main chain units; position = main chain index
    stable_main_chain: Vec<UnitId>,
    /// Stable units per main chain index, in ball order
    units_by_mci: Vec<Vec<UnitId>>,
}

impl Dag {
    /// Create a DAG holding only the genesis unit, stable at index 0.
    pub fn new(genesis: Unit) -> Result<Self, UnitError> {
        genesis.validate_structure()?;
        if !genesis.is_genesis() {
            return Err(UnitError::NotGenesis);
        }
        let id = genesis.id;
        let record = UnitRecord {
            unit: genesis,
            level: 0,
            best_parent: None,
            witnessed_level: Some(0),
            main_chain_index: Some(0),
            is_on_main_chain: true,
            is_stable: true,
            ball: Some(Ball::compute(&id, &[], &[])),
            skiplist_units: Vec::new(),
        };

        let mut units = HashMap::new();
        units.insert(id, record);
        let mut free = BTreeSet::new();
        free.insert(id);

        Ok(Dag {
            units,
            children: HashMap::new(),
            best_children: HashMap::new(),
            free,
            genesis: id,
            stable_main_chain: vec![id],
            units_by_mci: vec![vec![id]],
        })
    }

    /// Create the genesis unit of a network, authored by its initial committee.
    pub fn genesis_unit(network: &str, committee: &Committee) -> Unit {
        let tag = crate::constants::network_tag(network);
        Unit::new(
            vec![],
            committee.addresses().to_vec(),
            None,
            0,
            vec![UnitMessage::Data(tag.to_vec())],
        )
    }

    /// Rebuild a DAG from persisted records.
    pub fn restore(records: Vec<UnitRecord>) -> Result<Self, ConsensusError> {
        let mut records = records;
        records.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id().cmp(&b.id())));
        let mut iter = records.into_iter();
        let genesis = iter
            .next()
            .ok_or_else(|| invariant_violation("no units to restore"))?;
        if !genesis.unit.is_genesis() || !genesis.is_stable {
            return Err(invariant_violation("lowest stored unit is not a stable genesis"));
        }
        let mut dag = Dag::new(genesis.unit)?;

        let mut stable: Vec<(u64, u64, UnitId, bool)> = Vec::new();
        for record in iter {
            let id = record.id();
            for parent in &record.unit.parents {
                if !dag.units.contains_key(parent) {
                    return Err(UnitError::MissingParent(*parent).into());
                }
            }
            if record.is_stable {
                let mci = record
                    .main_chain_index
                    .ok_or_else(|| invariant_violation(format!("stable unit {id} without index")))?;
                stable.push((mci, record.level, id, record.is_on_main_chain));
            }
            dag.link(record);
        }

        stable.sort();
        for (mci, _, id, on_mc) in stable {
            let slot = mci as usize;
            if slot > dag.units_by_mci.len() {
                return Err(ConsensusError::EmptyMainChainIndex(dag.units_by_mci.len() as u64));
            }
            if slot == dag.units_by_mci.len() {
                dag.units_by_mci.push(Vec::new());
            }
            dag.units_by_mci[slot].push(id);
            if on_mc {
                if dag.stable_main_chain.len() != slot {
                    return Err(invariant_violation(format!(
                        "stored main chain has two units at index {mci}"
                    )));
                }
                dag.stable_main_chain.push(id);
            }
        }
        if dag.stable_main_chain.len() != dag.units_by_mci.len() {
            return Err(invariant_violation("stored main chain is shorter than its index"));
        }
        Ok(dag)
    }

    /// Compute the level a unit with these parents must have.
    pub fn level_for(&self, parents: &[UnitId]) -> Result<u64, UnitError> {
        let mut max_level = None;
        for parent_id in parents {
            let parent = self
                .units
                .get(parent_id)
                .ok_or(UnitError::MissingParent(*parent_id))?;
            max_level = Some(max_level.map_or(parent.level, |l: u64| l.max(parent.level)));
        }
        max_level.map(|l| l + 1).ok_or(UnitError::NoParents)
    }

    /// Insert a new, unstable unit.
    ///
    /// The record's structural fields must already be computed; this checks
    /// they are consistent with the graph.
    pub fn insert(&mut self, record: UnitRecord) -> Result<(), UnitError> {
        let id = record.id();
        if self.units.contains_key(&id) {
            return Err(UnitError::DuplicateUnit);
        }
        if record.is_stable || record.main_chain_index.is_some() || record.ball.is_some() {
            return Err(UnitError::PrematureStability);
        }
        let level = self.level_for(&record.unit.parents)?;
        if level != record.level {
            return Err(UnitError::LevelMismatch);
        }
        match record.best_parent {
            Some(bp) if record.unit.parents.binary_search(&bp).is_ok() => {}
            _ => return Err(UnitError::BestParentNotAParent),
        }
        self.link(record);
        Ok(())
    }

    fn link(&mut self, record: UnitRecord) {
        let id = record.id();
        for parent_id in &record.unit.parents {
            self.children.entry(*parent_id).or_default().push(id);
            self.free.remove(parent_id);
        }
        if let Some(bp) = record.best_parent {
            self.best_children.entry(bp).or_default().push(id);
        }
        self.free.insert(id);
        self.units.insert(id, record);
    }

    /// Remove a childless unit and every index entry that references it.
    ///
    /// Parents left without children become free again.
    pub(crate) fn remove(&mut self, id: &UnitId) -> Option<UnitRecord> {
        if self.children.get(id).is_some_and(|c| !c.is_empty()) {
            return None;
        }
        let record = self.units.remove(id)?;
        for parent_id in &record.unit.parents {
            let now_childless = match self.children.get_mut(parent_id) {
                Some(children) => {
                    children.retain(|c| c != id);
                    children.is_empty()
                }
                None => true,
            };
            if now_childless {
                self.children.remove(parent_id);
                if self.units.contains_key(parent_id) {
                    self.free.insert(*parent_id);
                }
            }
        }
        if let Some(bp) = record.best_parent {
            if let Some(siblings) = self.best_children.get_mut(&bp) {
                siblings.retain(|c| c != id);
                if siblings.is_empty() {
                    self.best_children.remove(&bp);
                }
            }
        }
        self.children.remove(id);
        self.best_children.remove(id);
        self.free.remove(id);
        Some(record)
    }

    /// Write a stability batch into the graph.
    ///
    /// The whole batch is checked before anything changes, so a rejected
    /// batch leaves the graph as it was.
    pub(crate) fn apply_stability_batch(&mut self, batch: &StabilityBatch) -> Result<(), ConsensusError> {
        let stable_point = self.stable_point();
        if batch.from_mci != stable_point + 1 || batch.to_mci < batch.from_mci {
            return Err(invariant_violation(format!(
                "batch {}..={} does not continue stable point {stable_point}",
                batch.from_mci, batch.to_mci
            )));
        }

        let span = (batch.to_mci - batch.from_mci + 1) as usize;
        let mut per_mci: Vec<Vec<UnitId>> = vec![Vec::new(); span];
        let mut mc_units: Vec<Option<UnitId>> = vec![None; span];
        for record in &batch.units {
            let id = record.id();
            let current = self
                .units
                .get(&id)
                .ok_or(ConsensusError::MissingUnit(id))?;
            if current.is_stable {
                return Err(invariant_violation(format!("unit {id} is already stable")));
            }
            let (Some(mci), Some(_), true) = (record.main_chain_index, record.ball, record.is_stable) else {
                return Err(invariant_violation(format!("batch record {id} is not marked stable")));
            };
            if mci < batch.from_mci || mci > batch.to_mci {
                return Err(invariant_violation(format!("unit {id} index {mci} outside batch")));
            }
            let slot = (mci - batch.from_mci) as usize;
            per_mci[slot].push(id);
            if record.is_on_main_chain {
                if mc_units[slot].is_some() {
                    return Err(invariant_violation(format!("two main chain units at index {mci}")));
                }
                mc_units[slot] = Some(id);
            }
        }
        for (offset, units) in per_mci.iter().enumerate() {
            if units.is_empty() || mc_units[offset].is_none() {
                return Err(ConsensusError::EmptyMainChainIndex(batch.from_mci + offset as u64));
            }
        }

        for record in &batch.units {
            self.units.insert(record.id(), record.clone());
        }
        for (units, mc_unit) in per_mci.into_iter().zip(mc_units) {
            self.units_by_mci.push(units);
            if let Some(id) = mc_unit {
                self.stable_main_chain.push(id);
            }
        }
        Ok(())
    }

    /// Get a unit by ID.
    pub fn get(&self, id: &UnitId) -> Option<&UnitRecord> {
        self.units.get(id)
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.units.contains_key(id)
    }

    /// Children of a unit.
    pub fn children(&self, id: &UnitId) -> &[UnitId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Children that chose this unit as their best parent.
    pub fn best_children(&self, id: &UnitId) -> &[UnitId] {
        self.best_children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Units nobody references yet, in ascending ID order.
    pub fn free_units(&self) -> impl Iterator<Item = &UnitId> {
        self.free.iter()
    }

    pub fn is_free(&self, id: &UnitId) -> bool {
        self.free.contains(id)
    }

    pub fn genesis(&self) -> &UnitId {
        &self.genesis
    }

    /// Highest stable main chain index.
    pub fn stable_point(&self) -> u64 {
        (self.stable_main_chain.len() - 1) as u64
    }

    /// The stable main chain, genesis first.
    pub fn stable_main_chain(&self) -> &[UnitId] {
        &self.stable_main_chain
    }

    /// The stable main chain unit at `mci`.
    pub fn stable_main_chain_unit(&self, mci: u64) -> Option<&UnitId> {
        self.stable_main_chain.get(mci as usize)
    }

    /// Stable units at `mci`, in ball order. Empty above the stable point.
    pub fn units_at_mci(&self, mci: u64) -> &[UnitId] {
        self.units_by_mci
            .get(mci as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ancestors of `id` (inclusive) whose level is above `floor_level`.
    pub fn ancestors_above_level(&self, id: &UnitId, floor_level: u64) -> HashSet<UnitId> {
        let mut result = HashSet::new();
        let mut stack = vec![*id];
        while let Some(uid) = stack.pop() {
            let Some(record) = self.units.get(&uid) else {
                continue;
            };
            if record.level <= floor_level || !result.insert(uid) {
                continue;
            }
            stack.extend(record.unit.parents.iter().copied());
        }
        result
    }

    /// Get the total number of units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Structural errors of a single unit.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    #[error("unit has no parents (non-genesis)")]
    NoParents,
    #[error("unit is not a genesis unit")]
    NotGenesis,
    #[error("unit has too many parents")]
    TooManyParents,
    #[error("duplicate parent reference")]
    DuplicateParent,
    #[error("parents are not in ascending order")]
    UnorderedParents,
    #[error("parent unit not found: {0}")]
    MissingParent(UnitId),
    #[error("unit has no authors")]
    NoAuthors,
    #[error("unit has too many authors")]
    TooManyAuthors,
    #[error("duplicate author")]
    DuplicateAuthor,
    #[error("authors are not in ascending order")]
    UnorderedAuthors,
    #[error("unit has too many messages")]
    TooManyMessages,
    #[error("data message too large")]
    DataTooLarge,
    #[error("definition change for {0} not authored by that address")]
    ForeignDefinitionChange(Address),
    #[error("genesis unit must not reference a last ball")]
    GenesisLastBall,
    #[error("non-genesis unit has no last ball")]
    MissingLastBall,
    #[error("unit ID does not match computed content hash")]
    InvalidId,
    #[error("duplicate unit ID")]
    DuplicateUnit,
    #[error("unit level is not one above its highest parent")]
    LevelMismatch,
    #[error("best parent is not one of the parents")]
    BestParentNotAParent,
    #[error("new unit already carries stability fields")]
    PrematureStability,
}
