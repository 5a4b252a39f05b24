//! Persistent storage for the unit graph.
//!
//! Provides a `Storage` trait and a sled-backed implementation for persisting
//! unit records, the per-index unit lists, skiplists, and stable committee
//! and definition changes.
//!
//! Stability batches are written in a single sled transaction spanning every
//! tree they touch, so a reader never sees an index without its balls.

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use crate::consensus::dag::{UnitId, UnitRecord};
use crate::consensus::witnesses::{ChangeEvent, ChangeKind};
use crate::Hash;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("stability batch {from}..={to} does not continue stored stable point {stored:?}")]
    Discontinuous {
        from: u64,
        to: u64,
        stored: Option<u64>,
    },
}

/// Everything that changes when a contiguous range of main chain indices
/// becomes stable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityBatch {
    pub from_mci: u64,
    pub to_mci: u64,
    /// Newly stable units, grouped by index and in ball order within one index
    pub units: Vec<UnitRecord>,
    /// Committee and definition changes carried by those units
    pub change_events: Vec<ChangeEvent>,
}

/// The persistence contract of the consensus core.
pub trait Storage {
    fn put_unit(&self, record: &UnitRecord) -> Result<(), StorageError>;
    fn get_unit(&self, id: &UnitId) -> Result<Option<UnitRecord>, StorageError>;
    fn has_unit(&self, id: &UnitId) -> Result<bool, StorageError>;
    /// Delete an unstable unit. Stable units are never removed.
    fn remove_unit(&self, id: &UnitId) -> Result<(), StorageError>;
    fn get_all_units(&self) -> Result<Vec<UnitRecord>, StorageError>;

    /// Stable units at `mci`, in ball order.
    fn get_units_at_mci(&self, mci: u64) -> Result<Vec<UnitRecord>, StorageError>;
    /// Skiplist of the main chain unit at `mci`, nearest first.
    fn get_skiplist(&self, mci: u64) -> Result<Option<Vec<UnitId>>, StorageError>;
    /// Stable committee and definition changes anchored at or below `up_to_mci`.
    fn get_committee_change_events(&self, up_to_mci: u64) -> Result<Vec<ChangeEvent>, StorageError>;
    /// Highest stored stable index, `None` for an empty store.
    fn stable_point(&self) -> Result<Option<u64>, StorageError>;

    /// Write a stability batch atomically.
    ///
    /// The batch must start right above the stored stable point (at 0 for an
    /// empty store).
    fn append_stability_batch(&self, batch: &StabilityBatch) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}

const STABLE_POINT_KEY: &[u8] = b"stable_point";

/// Sled-backed storage implementation.
pub struct SledStorage {
    db: sled::Db,
    units: sled::Tree,
    mci_index: sled::Tree,
    skiplist: sled::Tree,
    change_events: sled::Tree,
    chain_meta: sled::Tree,
    flush_after_batch: bool,
}

impl SledStorage {
    /// Open or create a sled database at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory sled database (for testing).
    pub fn open_temporary() -> Result<Self, StorageError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StorageError::Io(e.to_string()))?;
        Self::from_db(db)
    }

    /// Whether to flush to disk after every stability batch (default on).
    pub fn with_flush_after_batch(mut self, flush_after_batch: bool) -> Self {
        self.flush_after_batch = flush_after_batch;
        self
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let units = db
            .open_tree("units")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let mci_index = db
            .open_tree("mci_index")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let skiplist = db
            .open_tree("skiplist")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let change_events = db
            .open_tree("change_events")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let chain_meta = db
            .open_tree("chain_meta")
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(SledStorage {
            db,
            units,
            mci_index,
            skiplist,
            change_events,
            chain_meta,
            flush_after_batch: true,
        })
    }
}

// Big-endian keys so sled's lexicographic order matches numeric order.

fn mci_index_key(mci: u64, position: u32) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..8].copy_from_slice(&mci.to_be_bytes());
    key[8..].copy_from_slice(&position.to_be_bytes());
    key
}

/// Change events are keyed by (address, mci, unit, seq). Committee
/// replacements use the all-zero address.
fn change_event_key(event: &ChangeEvent) -> [u8; 76] {
    let address: Hash = match &event.kind {
        ChangeKind::DefinitionChange { address, .. } => address.0,
        ChangeKind::CommitteeReplacement(_) => [0u8; 32],
    };
    let mut key = [0u8; 76];
    key[..32].copy_from_slice(&address);
    key[32..40].copy_from_slice(&event.mci.to_be_bytes());
    key[40..72].copy_from_slice(&event.unit.0);
    key[72..].copy_from_slice(&event.seq.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8], what: &str) -> Result<u64, StorageError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Serialization(format!("bad {what}")))?;
    Ok(u64::from_be_bytes(array))
}

impl Storage for SledStorage {
    fn put_unit(&self, record: &UnitRecord) -> Result<(), StorageError> {
        let value =
            crate::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.units
            .insert(record.id().0, value)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get_unit(&self, id: &UnitId) -> Result<Option<UnitRecord>, StorageError> {
        match self
            .units
            .get(id.0)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let record = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn has_unit(&self, id: &UnitId) -> Result<bool, StorageError> {
        self.units
            .contains_key(id.0)
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    fn remove_unit(&self, id: &UnitId) -> Result<(), StorageError> {
        self.units
            .remove(id.0)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }

    fn get_all_units(&self) -> Result<Vec<UnitRecord>, StorageError> {
        let mut results = Vec::with_capacity(self.units.len());
        for entry in self.units.iter() {
            let (_, bytes) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let record = crate::deserialize(&bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            results.push(record);
        }
        Ok(results)
    }

    fn get_units_at_mci(&self, mci: u64) -> Result<Vec<UnitRecord>, StorageError> {
        let mut results = Vec::new();
        for entry in self.mci_index.scan_prefix(mci.to_be_bytes()) {
            let (_, id_bytes) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let id: Hash = id_bytes
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Serialization("bad unit id".into()))?;
            let record = self.get_unit(&UnitId(id))?.ok_or_else(|| {
                StorageError::Serialization(format!("index {mci} references a missing unit"))
            })?;
            results.push(record);
        }
        Ok(results)
    }

    fn get_skiplist(&self, mci: u64) -> Result<Option<Vec<UnitId>>, StorageError> {
        match self
            .skiplist
            .get(mci.to_be_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => {
                let units = crate::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(units))
            }
            None => Ok(None),
        }
    }

    fn get_committee_change_events(&self, up_to_mci: u64) -> Result<Vec<ChangeEvent>, StorageError> {
        let mut results = Vec::new();
        for entry in self.change_events.iter() {
            let (_, bytes) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let event: ChangeEvent = crate::deserialize(&bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            if event.mci <= up_to_mci {
                results.push(event);
            }
        }
        results.sort_by_key(|e| (e.mci, e.level, e.unit, e.seq));
        Ok(results)
    }

    fn stable_point(&self) -> Result<Option<u64>, StorageError> {
        match self
            .chain_meta
            .get(STABLE_POINT_KEY)
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            Some(bytes) => Ok(Some(decode_u64(&bytes, "stable point")?)),
            None => Ok(None),
        }
    }

    fn append_stability_batch(&self, batch: &StabilityBatch) -> Result<(), StorageError> {
        // Encode everything up front; the transaction closure may run more than once.
        let mut unit_rows = Vec::with_capacity(batch.units.len());
        let mut index_rows = Vec::with_capacity(batch.units.len());
        let mut skiplist_rows = Vec::new();
        let mut position = 0u32;
        let mut current_mci = None;
        for record in &batch.units {
            let mci = record.main_chain_index.ok_or_else(|| {
                StorageError::Serialization(format!("batch unit {} has no index", record.id()))
            })?;
            if current_mci != Some(mci) {
                current_mci = Some(mci);
                position = 0;
            }
            let value =
                crate::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
            unit_rows.push((record.id().0, value));
            index_rows.push((mci_index_key(mci, position), record.id().0));
            position += 1;
            if record.is_on_main_chain {
                let skiplist = crate::serialize(&record.skiplist_units)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                skiplist_rows.push((mci.to_be_bytes(), skiplist));
            }
        }
        let mut event_rows = Vec::with_capacity(batch.change_events.len());
        for event in &batch.change_events {
            let value =
                crate::serialize(event).map_err(|e| StorageError::Serialization(e.to_string()))?;
            event_rows.push((change_event_key(event), value));
        }

        let result = (
            &self.units,
            &self.mci_index,
            &self.skiplist,
            &self.change_events,
            &self.chain_meta,
        )
            .transaction(|(units, mci_index, skiplist, change_events, chain_meta)| {
                let stored = match chain_meta.get(STABLE_POINT_KEY)? {
                    Some(bytes) => Some(
                        decode_u64(&bytes, "stable point").map_err(ConflictableTransactionError::Abort)?,
                    ),
                    None => None,
                };
                let expected_from = stored.map_or(0, |s| s + 1);
                if batch.from_mci != expected_from || batch.to_mci < batch.from_mci {
                    return Err(ConflictableTransactionError::Abort(StorageError::Discontinuous {
                        from: batch.from_mci,
                        to: batch.to_mci,
                        stored,
                    }));
                }

                for (id, value) in &unit_rows {
                    units.insert(id.as_slice(), value.as_slice())?;
                }
                for (key, id) in &index_rows {
                    mci_index.insert(key.as_slice(), id.as_slice())?;
                }
                for (key, value) in &skiplist_rows {
                    skiplist.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &event_rows {
                    change_events.insert(key.as_slice(), value.as_slice())?;
                }
                chain_meta.insert(STABLE_POINT_KEY, batch.to_mci.to_be_bytes().as_slice())?;
                Ok(())
            });

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(StorageError::Io(e.to_string())),
        }

        if self.flush_after_batch {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::dag::{Address, Ball, Dag, Unit, UnitMessage};
    use crate::consensus::witnesses::tests::{test_committee, witness};
    use crate::consensus::witnesses::Committee;

    fn temp_storage() -> SledStorage {
        SledStorage::open_temporary().unwrap()
    }

    fn genesis_record() -> UnitRecord {
        let dag = Dag::new(Dag::genesis_unit("test", &test_committee())).unwrap();
        dag.get(dag.genesis()).unwrap().clone()
    }

    fn genesis_batch() -> StabilityBatch {
        StabilityBatch {
            from_mci: 0,
            to_mci: 0,
            units: vec![genesis_record()],
            change_events: vec![],
        }
    }

    fn child_of(parent: &UnitRecord, nonce: u8) -> UnitRecord {
        let unit = Unit::new(
            vec![parent.id()],
            vec![Address([nonce; 32])],
            Some(parent.id()),
            0,
            vec![UnitMessage::Data(vec![nonce])],
        );
        UnitRecord::unstable(unit, parent.level + 1, Some(parent.id()), Some(0))
    }

    fn stabilize(mut record: UnitRecord, mci: u64, on_mc: bool) -> UnitRecord {
        record.main_chain_index = Some(mci);
        record.is_on_main_chain = on_mc;
        record.is_stable = true;
        record.ball = Some(Ball::compute(&record.id(), &[], &[]));
        record
    }

    #[test]
    fn unit_put_get_roundtrip() {
        let storage = temp_storage();
        let record = genesis_record();
        storage.put_unit(&record).unwrap();
        assert!(storage.has_unit(&record.id()).unwrap());
        assert_eq!(storage.get_unit(&record.id()).unwrap(), Some(record));
    }

    #[test]
    fn unit_not_found() {
        let storage = temp_storage();
        assert!(storage.get_unit(&UnitId([9u8; 32])).unwrap().is_none());
        assert!(!storage.has_unit(&UnitId([9u8; 32])).unwrap());
    }

    #[test]
    fn remove_unit_deletes_row() {
        let storage = temp_storage();
        let genesis = genesis_record();
        let child = child_of(&genesis, 1);
        storage.put_unit(&child).unwrap();
        storage.remove_unit(&child.id()).unwrap();
        assert!(!storage.has_unit(&child.id()).unwrap());
    }

    #[test]
    fn empty_store_has_no_stable_point() {
        let storage = temp_storage();
        assert_eq!(storage.stable_point().unwrap(), None);
        storage.append_stability_batch(&genesis_batch()).unwrap();
        assert_eq!(storage.stable_point().unwrap(), Some(0));
        assert_eq!(storage.get_units_at_mci(0).unwrap().len(), 1);
    }

    #[test]
    fn batch_keeps_ball_order_and_skiplists() {
        let storage = temp_storage();
        storage.append_stability_batch(&genesis_batch()).unwrap();
        let genesis = genesis_record();
        let side = stabilize(child_of(&genesis, 1), 1, false);
        let mut main = stabilize(child_of(&genesis, 2), 1, true);
        main.skiplist_units = vec![];
        let batch = StabilityBatch {
            from_mci: 1,
            to_mci: 1,
            units: vec![side.clone(), main.clone()],
            change_events: vec![],
        };
        storage.append_stability_batch(&batch).unwrap();

        let at_one = storage.get_units_at_mci(1).unwrap();
        assert_eq!(at_one, vec![side, main]);
        assert_eq!(storage.get_skiplist(1).unwrap(), Some(vec![]));
        assert_eq!(storage.get_skiplist(0).unwrap(), Some(vec![]));
        assert!(storage.get_skiplist(2).unwrap().is_none());
        assert_eq!(storage.stable_point().unwrap(), Some(1));
    }

    #[test]
    fn discontinuous_batch_is_rejected_without_writes() {
        let storage = temp_storage();
        storage.append_stability_batch(&genesis_batch()).unwrap();
        let genesis = genesis_record();
        let orphan = stabilize(child_of(&genesis, 3), 5, true);
        let batch = StabilityBatch {
            from_mci: 5,
            to_mci: 5,
            units: vec![orphan.clone()],
            change_events: vec![],
        };
        let err = storage.append_stability_batch(&batch).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Discontinuous {
                from: 5,
                stored: Some(0),
                ..
            }
        ));
        assert!(!storage.has_unit(&orphan.id()).unwrap());
        assert!(storage.get_units_at_mci(5).unwrap().is_empty());
        assert_eq!(storage.stable_point().unwrap(), Some(0));
    }

    #[test]
    fn change_events_filtered_by_index() {
        let storage = temp_storage();
        storage.append_stability_batch(&genesis_batch()).unwrap();
        let genesis = genesis_record();
        let committee = Committee::new((20..32).map(witness).collect()).unwrap();
        let carrier = stabilize(child_of(&genesis, 4), 1, true);
        let events = vec![
            ChangeEvent {
                mci: 1,
                level: 1,
                unit: carrier.id(),
                seq: 0,
                kind: ChangeKind::CommitteeReplacement(committee),
            },
            ChangeEvent {
                mci: 1,
                level: 1,
                unit: carrier.id(),
                seq: 1,
                kind: ChangeKind::DefinitionChange {
                    address: Address([4u8; 32]),
                    definition_chash: [1u8; 32],
                },
            },
        ];
        let batch = StabilityBatch {
            from_mci: 1,
            to_mci: 1,
            units: vec![carrier],
            change_events: events.clone(),
        };
        storage.append_stability_batch(&batch).unwrap();
        assert!(storage.get_committee_change_events(0).unwrap().is_empty());
        assert_eq!(storage.get_committee_change_events(1).unwrap(), events);
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let record = genesis_record();
        {
            let storage = SledStorage::open(dir.path()).unwrap();
            storage.append_stability_batch(&genesis_batch()).unwrap();
        }
        let storage = SledStorage::open(dir.path()).unwrap();
        assert_eq!(storage.stable_point().unwrap(), Some(0));
        assert_eq!(storage.get_unit(&record.id()).unwrap(), Some(record));
        assert_eq!(storage.get_all_units().unwrap().len(), 1);
    }
}
