//! Node orchestrator around the ledger.
//!
//! `ConsensusNode` owns the ledger behind one async `RwLock`: unit ingestion
//! and stability advancement take the write side, queries take the read side,
//! so readers never see half of a stability batch. Every committed batch is
//! announced on a `stabilized` broadcast channel.
//!
//! Units rejected for a transient reason (an unknown parent, a last ball that
//! is not stable here yet) are parked in a bounded pool and retried after
//! every unit that does get in and after every stability advance. The pool
//! only changes when units are tried; it never feeds into consensus decisions.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, KeelConfig};
use crate::consensus::dag::{Ball, Unit, UnitId};
use crate::consensus::skiplist::ProofChain;
use crate::consensus::stability::UnitState;
use crate::consensus::witnesses::Committee;
use crate::consensus::ConsensusError;
use crate::state::{Ledger, StabilityAdvance};
use crate::storage::{SledStorage, Storage, StorageError};

/// Errors that can occur while starting a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Units waiting for a missing dependency, oldest first.
#[derive(Debug)]
pub struct PendingPool {
    units: VecDeque<Unit>,
    ids: HashSet<UnitId>,
    capacity: usize,
}

impl PendingPool {
    pub fn new(capacity: usize) -> Self {
        PendingPool {
            units: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    /// Park a unit. Evicts the oldest unit when the pool is full.
    ///
    /// Returns `false` if the unit was already parked.
    pub fn park(&mut self, unit: Unit) -> bool {
        if self.capacity == 0 || self.ids.contains(&unit.id) {
            return false;
        }
        if self.units.len() >= self.capacity {
            if let Some(evicted) = self.units.pop_front() {
                self.ids.remove(&evicted.id);
                tracing::warn!(unit = %evicted.id, capacity = self.capacity, "Pending pool full, evicted oldest unit");
            }
        }
        self.ids.insert(unit.id);
        self.units.push_back(unit);
        true
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    fn take_all(&mut self) -> Vec<Unit> {
        self.ids.clear();
        self.units.drain(..).collect()
    }
}

/// A ledger shared between one writer and many readers.
pub struct ConsensusNode<S: Storage> {
    ledger: Arc<RwLock<Ledger<S>>>,
    stabilized: broadcast::Sender<StabilityAdvance>,
    pending: Mutex<PendingPool>,
}

impl ConsensusNode<SledStorage> {
    /// Open (or initialize) the sled database under the configured data
    /// directory and wrap the ledger in a node.
    pub fn open(config: &KeelConfig) -> Result<Self, NodeError> {
        let committee = config.parse_genesis_committee()?;
        let storage = SledStorage::open(&config.storage.data_dir.join("db"))?
            .with_flush_after_batch(config.storage.flush_after_batch);
        let ledger = Ledger::open(storage, &config.consensus.network, committee)?;
        Ok(Self::new(
            ledger,
            config.consensus.event_channel_capacity,
            config.consensus.max_pending_units,
        ))
    }
}

impl<S: Storage> ConsensusNode<S> {
    pub fn new(ledger: Ledger<S>, event_capacity: usize, max_pending: usize) -> Self {
        let (stabilized, _) = broadcast::channel(event_capacity.max(1));
        ConsensusNode {
            ledger: Arc::new(RwLock::new(ledger)),
            stabilized,
            pending: Mutex::new(PendingPool::new(max_pending)),
        }
    }

    /// Subscribe to `stabilized(old_mci, new_mci)` events, one per batch.
    pub fn subscribe(&self) -> broadcast::Receiver<StabilityAdvance> {
        self.stabilized.subscribe()
    }

    /// Shared handle to the ledger.
    pub fn ledger(&self) -> Arc<RwLock<Ledger<S>>> {
        Arc::clone(&self.ledger)
    }

    /// Add a unit and advance stability as far as it allows.
    ///
    /// Errors are returned as-is; nothing is parked.
    pub async fn submit_unit(&self, unit: Unit) -> Result<UnitId, ConsensusError> {
        let mut ledger = self.ledger.write().await;
        let id = ledger.add_unit(unit)?;
        self.advance_locked(&mut ledger);
        Ok(id)
    }

    /// Submit a unit, parking it on a transient rejection and retrying the
    /// parked units once it gets in.
    pub async fn ingest(&self, unit: Unit) -> Result<UnitId, ConsensusError> {
        let mut pending = self.pending.lock().await;
        let id = unit.id;
        match self.submit_unit(unit.clone()).await {
            Ok(id) => {
                self.retry_pending(&mut pending).await;
                Ok(id)
            }
            Err(e) if e.is_retryable() => {
                tracing::debug!(unit = %id, error = %e, "Parked unit until its dependencies arrive");
                pending.park(unit);
                Err(e)
            }
            Err(e) => {
                tracing::debug!(unit = %id, error = %e, "Rejected unit");
                Err(e)
            }
        }
    }

    async fn retry_pending(&self, pending: &mut PendingPool) {
        loop {
            let mut progressed = false;
            for unit in pending.take_all() {
                let id = unit.id;
                match self.submit_unit(unit.clone()).await {
                    Ok(_) => {
                        tracing::debug!(unit = %id, "Accepted parked unit");
                        progressed = true;
                    }
                    Err(e) if e.is_retryable() => {
                        pending.park(unit);
                    }
                    Err(e) => {
                        tracing::debug!(unit = %id, error = %e, "Dropped parked unit");
                    }
                }
            }
            if !progressed || pending.is_empty() {
                break;
            }
        }
    }

    /// Advance stability until the current tip proves nothing more.
    ///
    /// Returns whether the stable point moved.
    fn advance_locked(&self, ledger: &mut Ledger<S>) -> bool {
        let mut advanced = false;
        loop {
            match ledger.advance_stability() {
                Ok(Some(advance)) => {
                    self.announce(advance);
                    advanced = true;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retryable = e.is_retryable(),
                        "Stability advancement failed, will retry on the next unit"
                    );
                    break;
                }
            }
        }
        advanced
    }

    fn announce(&self, advance: StabilityAdvance) {
        // No subscribers is fine.
        let _ = self.stabilized.send(advance);
    }

    /// Run stability advancement now, e.g. after a failed attempt.
    ///
    /// Parked units are retried if the stable point moved.
    pub async fn advance_stability(&self) {
        let mut pending = self.pending.lock().await;
        let advanced = {
            let mut ledger = self.ledger.write().await;
            self.advance_locked(&mut ledger)
        };
        if advanced {
            self.retry_pending(&mut pending).await;
        }
    }

    /// Stabilize `earlier` if the `later` units prove it, then retry the
    /// parked units.
    pub async fn mark_stable_by_later_units(
        &self,
        earlier: &UnitId,
        later: &[UnitId],
    ) -> Result<Option<StabilityAdvance>, ConsensusError> {
        let mut pending = self.pending.lock().await;
        let advance = self
            .ledger
            .write()
            .await
            .mark_stable_by_later_units(earlier, later)?;
        if let Some(advance) = advance {
            self.announce(advance);
            self.retry_pending(&mut pending).await;
        }
        Ok(advance)
    }

    pub async fn archive_unit(&self, id: &UnitId) -> Result<(), ConsensusError> {
        self.ledger.write().await.archive_unit(id)
    }

    pub async fn is_stable(&self, id: &UnitId) -> bool {
        self.ledger.read().await.is_stable(id)
    }

    pub async fn stable_point(&self) -> u64 {
        self.ledger.read().await.stable_point()
    }

    pub async fn unit_state(&self, id: &UnitId) -> Result<UnitState, ConsensusError> {
        self.ledger.read().await.unit_state(id)
    }

    pub async fn main_chain_path(&self, from: u64, to: u64) -> Result<Vec<UnitId>, ConsensusError> {
        self.ledger.read().await.main_chain_path(from, to)
    }

    pub async fn build_proof_chain(&self, low: u64, high: u64) -> Result<ProofChain, ConsensusError> {
        self.ledger.read().await.build_proof_chain(low, high)
    }

    pub async fn genesis_ball(&self) -> Result<Ball, ConsensusError> {
        self.ledger.read().await.genesis_ball()
    }

    pub async fn resolve_committee(&self, mci: u64) -> Result<Committee, ConsensusError> {
        self.ledger.read().await.resolve_committee(mci).cloned()
    }

    /// Number of units parked for a missing dependency.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Ingest units from `units` until the channel closes or `shutdown` fires.
    pub async fn run(&self, mut units: mpsc::Receiver<Unit>, shutdown: CancellationToken) {
        tracing::info!("Consensus node started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                unit = units.recv() => match unit {
                    Some(unit) => {
                        // Rejections are logged by `ingest`.
                        let _ = self.ingest(unit).await;
                    }
                    None => {
                        tracing::info!("Unit channel closed");
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// Flush storage before exit.
    pub async fn shutdown(&self) {
        if let Err(e) = self.ledger.read().await.storage().flush() {
            tracing::error!(error = %e, "Failed to flush storage on shutdown");
        }
        tracing::info!("Node shutdown complete");
    }
}
