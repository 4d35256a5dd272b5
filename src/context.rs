//! Replica context ties all the pieces together. It owns the RUV of a replica, its CSN
//! generator and its storage, and it's the only way through which writes are applied, so that
//! the RUV always reflects what the storage actually contains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use thiserror::Error;

use crate::apply::{settle_naming, ApplyError, ApplyOutcome};
use crate::config::ReplicaConfig;
use crate::conflict::{Change, ConflictError, Resolution};
use crate::csn::Csn;
use crate::csngen::{CsnGenerator, GeneratorError};
use crate::csnpl::CsnplError;
use crate::ruv::wire::{LAST_MODIFIED_ATTRIBUTE, RUV_ATTRIBUTE};
use crate::ruv::{compare_ruv, missing_ranges, Admission, Ruv, RuvComparison, RuvError, UpdateRange};
use crate::store::{EntryStore, StorageError};
use crate::{Clock, ReplicaId, Timestamp};

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Ruv(#[from] RuvError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error("change rejected: {0}")]
    Rejected(#[from] ConflictError),
    #[error("CSN {csn} doesn't originate from replica {origin}")]
    ForeignCsn { csn: Csn, origin: ReplicaId },
    #[error("local replica {0} can't be cleaned")]
    CleanLocal(ReplicaId),
    #[error("replica generation is missing")]
    NoGeneration,
}

impl From<ApplyError> for ReplicaError {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Storage(e) => ReplicaError::Storage(e),
            ApplyError::Rejected(e) => ReplicaError::Rejected(e),
        }
    }
}

/// Notifications about state changes of a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// RUV has changed, either because of an applied update (carrying its CSN) or a merge.
    RuvUpdated { csn: Option<Csn> },
    ConflictResolved { uniqueid: String, csn: Csn, resolution: Resolution },
    ReplicaCleaned { replica_id: ReplicaId },
    GenerationChanged { generation: String },
}

pub trait ReplicaObserver: Send + Sync {
    fn on_event(&self, event: &ReplicaEvent);
}

/// An update originated by another replica, received through replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedOperation {
    pub csn: Csn,
    /// Unique id of the entry being changed.
    pub target: String,
    pub change: Change,
    pub origin_replica_id: ReplicaId,
}

pub type ReplayOutcome = ApplyOutcome;

/// A CSN of an operation being applied right now. Dropping it without calling `commit`
/// cancels the CSN, so that a failed operation never holds back the RUV.
pub struct InProgressCsn<'a> {
    ctx: &'a ReplicaContext,
    csn: Csn,
    is_local: bool,
    done: bool,
}

impl<'a> InProgressCsn<'a> {
    pub fn csn(&self) -> Csn { self.csn }

    /// Records the operation as applied.
    pub fn commit(mut self) -> Result<Csn, ReplicaError> {
        let rid = self.csn.replica_id();
        {
            let mut ruv = self.ctx.ruv.write();
            let url = if self.is_local { self.ctx.config.supplier_url.as_str() } else { "" };
            ruv.update_ruv(&self.csn, url, self.is_local)?;
            if !self.is_local {
                // the first update received from a replica opens its range
                if let (Err(_), Ok(max)) = (ruv.get_min_csn(rid), ruv.get_max_csn(rid)) {
                    if self.csn <= max {
                        ruv.set_min_csn(rid, &self.csn)?;
                    }
                }
            }
        }
        self.done = true;
        self.ctx.dirty.store(true, Ordering::Release);
        self.ctx.notify(&ReplicaEvent::RuvUpdated { csn: Some(self.csn) });
        Ok(self.csn)
    }
}

impl<'a> Drop for InProgressCsn<'a> {
    fn drop(&mut self) {
        if !self.done {
            debug!("cancelling in-progress csn {}", self.csn);
            if let Err(e) = self.ctx.ruv.write().cancel_csn_inprogress(&self.csn) {
                warn!("failed to cancel csn {}: {}", self.csn, e);
            }
        }
    }
}

pub struct ReplicaContext {
    config: ReplicaConfig,
    ruv: RwLock<Ruv>,
    generator: CsnGenerator,
    store: Arc<dyn EntryStore>,
    clock: Arc<dyn Clock>,
    observers: RwLock<Vec<Arc<dyn ReplicaObserver>>>,
    dirty: AtomicBool,
}

impl ReplicaContext {
    /// Opens a replica on top of a given store. A RUV persisted by the previous run is loaded,
    /// otherwise a new one is created together with a fresh replica generation.
    pub fn open(config: ReplicaConfig, store: Arc<dyn EntryStore>, clock: Arc<dyn Clock>) -> crate::Result<Self> {
        config.validate()?;
        let rid = config.replica_id;
        let values = store.read_ruv_attribute(&config.replica_name, RUV_ATTRIBUTE)?;
        let fresh = values.is_empty();
        let mut ruv = if fresh {
            let generation = Ruv::mint_generation(clock.as_ref());
            info!("replica {}: creating RUV with new generation {}", rid, generation);
            Ruv::init_new(&generation, rid, &config.supplier_url)
        } else {
            let parsed = Ruv::from_values_lenient(&values);
            if parsed.skipped > 0 {
                warn!("replica {}: {} RUV values could not be loaded", rid, parsed.skipped);
            }
            parsed.ruv
        };
        let mut ruv_changed = fresh;
        if ruv.replica_generation().is_none() {
            let generation = Ruv::mint_generation(clock.as_ref());
            warn!("replica {}: stored RUV has no generation, minting {}", rid, generation);
            ruv.set_replica_generation(&generation);
            ruv_changed = true;
        }
        let last_modified = store.read_ruv_attribute(&config.replica_name, LAST_MODIFIED_ATTRIBUTE)?;
        ruv.apply_last_modified_values(&last_modified);
        if !ruv.contains_replica(rid) {
            ruv.add_index_replica(rid, &config.supplier_url, 0)?;
            ruv_changed = true;
        }
        ruv.move_local_supplier_to_first(rid)?;
        let ruv = ruv.with_clock(clock.clone());

        let generator = CsnGenerator::new(rid, clock.clone(), config.max_clock_skew);
        if let Some(max) = ruv.global_max_csn() {
            generator.seed(&max);
        }
        ruv.dump("open");

        Ok(ReplicaContext {
            config,
            ruv: RwLock::new(ruv),
            generator,
            store,
            clock,
            observers: RwLock::new(Vec::new()),
            dirty: AtomicBool::new(ruv_changed),
        })
    }

    pub fn config(&self) -> &ReplicaConfig { &self.config }

    pub fn replica_id(&self) -> ReplicaId { self.config.replica_id }

    pub fn store(&self) -> &Arc<dyn EntryStore> { &self.store }

    /// Returns a copy of the current RUV.
    pub fn ruv_snapshot(&self) -> Ruv { self.ruv.read().clone() }

    pub fn subscribe(&self, observer: Arc<dyn ReplicaObserver>) {
        self.observers.write().push(observer);
    }

    fn notify(&self, event: &ReplicaEvent) {
        for observer in self.observers.read().iter() {
            observer.on_event(event);
        }
    }

    fn report(&self, uniqueid: &str, csn: Csn, outcome: &ApplyOutcome) {
        if let ApplyOutcome::Conflict(resolution) = outcome {
            self.notify(&ReplicaEvent::ConflictResolved {
                uniqueid: uniqueid.to_string(),
                csn,
                resolution: resolution.clone(),
            });
        }
    }

    /// Allocates a CSN for a new local operation and registers it as in progress. Both happen
    /// under the RUV lock, so no later local CSN can be committed before this one is pending.
    pub fn begin(&self) -> Result<InProgressCsn<'_>, ReplicaError> {
        let mut ruv = self.ruv.write();
        let csn = self.generator.new_csn();
        match ruv.add_csn_inprogress(&csn)? {
            Admission::Pending => {}
            Admission::Covered => {
                return Err(RuvError::BadData(format!("new local csn {} is already covered by RUV", csn)).into())
            }
        }
        drop(ruv);
        Ok(InProgressCsn { ctx: self, csn, is_local: true, done: false })
    }

    /// Applies a change requested by a local client.
    pub fn apply_local(&self, uniqueid: &str, change: &Change) -> Result<(Csn, ApplyOutcome), ReplicaError> {
        let op = self.begin()?;
        let csn = op.csn();
        let outcome = self.store.apply_write(uniqueid, change, &csn)?;
        self.report(uniqueid, csn, &outcome);
        if outcome == ApplyOutcome::Duplicate {
            // nothing has been written, the csn is dropped
            return Ok((csn, outcome));
        }
        op.commit()?;
        Ok((csn, outcome))
    }

    /// Applies an update received from another replica. Updates already covered by the RUV, or
    /// being applied concurrently, are reported as duplicates and skipped.
    pub fn apply_replayed(&self, op: &ReplayedOperation) -> Result<ReplayOutcome, ReplicaError> {
        if op.csn.replica_id() != op.origin_replica_id {
            return Err(ReplicaError::ForeignCsn { csn: op.csn, origin: op.origin_replica_id });
        }
        if self.ruv.read().covers_csn_cleaned(&op.csn) {
            debug!("skipping replayed csn {}, already seen", op.csn);
            return Ok(ReplayOutcome::Duplicate);
        }
        self.generator.adjust(&op.csn)?;

        let admission = self.ruv.write().add_csn_inprogress(&op.csn);
        match admission {
            Ok(Admission::Pending) => {}
            Ok(Admission::Covered) | Err(RuvError::Pending(CsnplError::DuplicateCsn(_))) => {
                debug!("skipping replayed csn {}, already seen", op.csn);
                return Ok(ReplayOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }
        let guard = InProgressCsn { ctx: self, csn: op.csn, is_local: false, done: false };
        let outcome = self.store.apply_write(&op.target, &op.change, &op.csn)?;
        self.report(&op.target, op.csn, &outcome);
        guard.commit()?;
        Ok(outcome)
    }

    /// Checks if an update has already been applied here.
    pub fn covers_csn(&self, csn: &Csn) -> bool { self.ruv.read().covers_csn(csn) }

    /// Compares the local RUV with the RUV of a peer.
    pub fn compare_with(&self, remote: &Ruv) -> RuvComparison {
        let result = compare_ruv(&self.ruv.read(), remote, self.config.strict_compare);
        if result.is_fatal() {
            warn!("replica {}: RUV of a peer is incompatible: {:?}", self.config.replica_id, result);
        }
        result
    }

    /// Computes which updates a peer with a given RUV is missing.
    pub fn updates_for(&self, remote: &Ruv) -> Vec<UpdateRange> { missing_ranges(&self.ruv.read(), remote) }

    /// Merges RUV of a peer into the local one. Returns true if the local RUV has changed.
    pub fn merge_remote(&self, remote: &Ruv) -> Result<bool, ReplicaError> {
        let changed = self.ruv.write().try_merge(remote)?;
        if changed {
            self.dirty.store(true, Ordering::Release);
            self.notify(&ReplicaEvent::RuvUpdated { csn: None });
        }
        Ok(changed)
    }

    /// Removes a decommissioned replica from the RUV. Updates of that replica which arrive
    /// later are skipped as duplicates.
    pub fn clean_replica(&self, rid: ReplicaId) -> Result<(), ReplicaError> {
        if rid == self.config.replica_id {
            return Err(ReplicaError::CleanLocal(rid));
        }
        match self.ruv.write().clean_replica(rid) {
            Some(removed) if !removed.pending().is_empty() => {
                warn!("replica {} removed with {} operations in progress", rid, removed.pending().len());
            }
            Some(_) => {}
            None => debug!("replica {} to clean is not in RUV", rid),
        }
        info!("replica {}: cleaned replica {} from RUV", self.config.replica_id, rid);
        self.dirty.store(true, Ordering::Release);
        self.notify(&ReplicaEvent::ReplicaCleaned { replica_id: rid });
        Ok(())
    }

    /// Replaces the local RUV with the one of a supplier, which has just sent its whole
    /// dataset. The supplier's generation is adopted.
    pub fn reinitialize(&self, supplier: &Ruv) -> Result<(), ReplicaError> {
        let generation = supplier.replica_generation().ok_or(ReplicaError::NoGeneration)?.to_string();
        let rid = self.config.replica_id;
        let mut ruv = supplier.clone().with_clock(self.clock.clone());
        let cleaned: Vec<ReplicaId> = self.ruv.read().cleaned_replicas().collect();
        for cleaned_rid in cleaned {
            ruv.clean_replica(cleaned_rid);
        }
        if !ruv.contains_replica(rid) {
            ruv.add_index_replica(rid, &self.config.supplier_url, 0)?;
        }
        ruv.move_local_supplier_to_first(rid)?;
        if let Some(max) = ruv.global_max_csn() {
            self.generator.seed(&max);
        }

        let previous = std::mem::replace(&mut *self.ruv.write(), ruv);
        self.dirty.store(true, Ordering::Release);
        if previous.replica_generation() != Some(generation.as_str()) {
            info!("replica {}: generation changed to {}", rid, generation);
            self.notify(&ReplicaEvent::GenerationChanged { generation });
        }
        Ok(())
    }

    /// Starts a new dataset: the RUV is reset and given a fresh generation, which makes every
    /// peer treat this replica as incompatible until reinitialized.
    pub fn new_generation(&self) -> Result<String, ReplicaError> {
        let generation = Ruv::mint_generation(self.clock.as_ref());
        let mut ruv = Ruv::init_new(&generation, self.config.replica_id, &self.config.supplier_url)
            .with_clock(self.clock.clone());
        let mut current = self.ruv.write();
        for rid in current.cleaned_replicas() {
            ruv.clean_replica(rid);
        }
        *current = ruv;
        drop(current);
        self.dirty.store(true, Ordering::Release);
        info!("replica {}: generation changed to {}", self.config.replica_id, generation);
        self.notify(&ReplicaEvent::GenerationChanged { generation: generation.clone() });
        Ok(generation)
    }

    /// Removes tombstones deleted before `horizon`. Tombstones which an update still in progress
    /// might need are kept. Entries moved aside by a purged tombstone get their DN back. Returns
    /// the number of removed tombstones.
    pub fn purge_tombstones(&self, horizon: Timestamp) -> Result<usize, ReplicaError> {
        let mut limit = Csn::new(horizon, 0, 0, 0);
        let oldest_pending = self
            .ruv
            .read()
            .iter()
            .filter_map(|e| e.pending().get_min_csn().map(|(csn, _)| csn))
            .min();
        if let Some(pending) = oldest_pending {
            limit = limit.min(pending);
        }

        let mut purged = 0;
        for entry in self.store.tombstones()? {
            if entry.tombstone_csn().map_or(false, |csn| csn < limit) {
                self.store.remove_entry(entry.uniqueid())?;
                settle_naming(self.store.as_ref(), entry.claimed_dn(), None)?;
                purged += 1;
            }
        }
        debug!("purged {} tombstones older than {}", purged, limit);
        Ok(purged)
    }

    /// Persists the RUV, if it has changed since it was last persisted.
    pub fn flush(&self) -> Result<(), ReplicaError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let (values, last_modified) = {
            let ruv = self.ruv.read();
            (ruv.to_values(), ruv.last_modified_values())
        };
        let name = &self.config.replica_name;
        let result = self
            .store
            .write_ruv_attribute(name, RUV_ATTRIBUTE, &values)
            .and_then(|_| self.store.write_ruv_attribute(name, LAST_MODIFIED_ATTRIBUTE, &last_modified))
            .and_then(|_| self.store.flush());
        if let Err(e) = result {
            error!("replica {}: failed to persist RUV: {}", self.config.replica_id, e);
            self.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    /// Persists the RUV and closes the replica.
    pub fn shutdown(self) -> Result<(), ReplicaError> {
        self.flush()?;
        info!("replica {} shut down", self.config.replica_id);
        Ok(())
    }
}
