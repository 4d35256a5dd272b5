pub mod compare;
pub mod wire;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use log::debug;
use smallvec::SmallVec;
use thiserror::Error;

use crate::csn::Csn;
use crate::csnpl::{CsnPendingList, CsnplError};
use crate::{Clock, ReplicaId, SystemClock, Timestamp, READ_ONLY_REPLICA_ID};

pub use compare::{compare_ruv, is_newer, missing_ranges, RuvComparison, UpdateRange};
pub use wire::ParsedRuv;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuvError {
    #[error("malformed RUV value: {0}")]
    BadFormat(String),
    #[error("inconsistent RUV data: {0}")]
    BadData(String),
    #[error("replica {0} not found in RUV")]
    NotFound(ReplicaId),
    #[error("replica {0} already exists in RUV")]
    AlreadyExists(ReplicaId),
    #[error("replica generation mismatch: local {local:?}, remote {remote:?}")]
    GenerationMismatch {
        local: Option<String>,
        remote: Option<String>,
    },
    #[error(transparent)]
    Pending(#[from] CsnplError),
}

/// Result of registering an in-progress CSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// CSN has been added to pending list of its replica.
    Pending,
    /// RUV already covers that CSN: it describes an update which has already been applied.
    Covered,
}

/// State of a single replica, as known by the RUV.
#[derive(Debug, Clone)]
pub struct RuvElement {
    replica_id: ReplicaId,
    supplier_url: String,
    min_csn: Option<Csn>,
    max_csn: Option<Csn>,
    last_modified: Timestamp,
    pending: CsnPendingList,
}

impl RuvElement {
    fn new(replica_id: ReplicaId, supplier_url: &str) -> Self {
        RuvElement {
            replica_id,
            supplier_url: supplier_url.to_string(),
            min_csn: None,
            max_csn: None,
            last_modified: 0,
            pending: CsnPendingList::new(),
        }
    }

    fn with_csns(replica_id: ReplicaId, supplier_url: &str, min: Csn, max: Csn) -> Self {
        let mut e = RuvElement::new(replica_id, supplier_url);
        e.min_csn = Some(min);
        e.max_csn = Some(max);
        e
    }

    pub fn replica_id(&self) -> ReplicaId { self.replica_id }

    pub fn supplier_url(&self) -> &str { &self.supplier_url }

    pub fn min_csn(&self) -> Option<Csn> { self.min_csn }

    pub fn max_csn(&self) -> Option<Csn> { self.max_csn }

    pub fn last_modified(&self) -> Timestamp { self.last_modified }

    /// CSNs of this replica which are currently being applied.
    pub fn pending(&self) -> &CsnPendingList { &self.pending }

    /// Checks if `csn` fits in `[min, max]` range of current element.
    pub fn covers(&self, csn: &Csn) -> bool {
        match (self.min_csn, self.max_csn) {
            (Some(min), Some(max)) => min <= *csn && *csn <= max,
            _ => false,
        }
    }

    fn update_url(&mut self, url: &str) {
        if !url.is_empty() && self.supplier_url != url {
            self.supplier_url = url.to_string();
        }
    }

    /// Moves max CSN forward. When `must_be_greater` is set, a CSN not greater than current
    /// max is ignored. Returns true if element has been changed.
    fn advance_max(&mut self, csn: Csn, must_be_greater: bool, now: Timestamp) -> Result<bool, RuvError> {
        if must_be_greater && self.max_csn.map_or(false, |max| csn <= max) {
            debug!("replica {}: ignoring max csn {}, current one is {:?}", self.replica_id, csn, self.max_csn);
            return Ok(false);
        }
        if let Some(min) = self.min_csn {
            if csn < min {
                return Err(RuvError::BadData(format!(
                    "max csn {} would precede min csn {} of replica {}",
                    csn, min, self.replica_id
                )));
            }
        }
        self.max_csn = Some(csn);
        self.last_modified = now;
        Ok(true)
    }
}

impl PartialEq for RuvElement {
    fn eq(&self, other: &Self) -> bool {
        self.replica_id == other.replica_id
            && self.supplier_url == other.supplier_url
            && self.min_csn == other.min_csn
            && self.max_csn == other.max_csn
    }
}

impl Eq for RuvElement {}

/// Replica update vector. For every replica known to the current one it keeps the range of
/// CSNs which have been originated by that replica and applied locally. Comparing RUVs of two
/// replicas tells which updates one of them is missing.
///
/// Elements are kept in order, with the local replica first. Each element owns a pending list
/// of CSNs that are being applied right now, so that the minimum CSN of a whole replica never
/// moves past an operation which is still in flight.
///
/// Replicas cleaned out of the topology are remembered for the lifetime of the RUV: their
/// CSNs count as covered, so that late updates of a decommissioned replica don't bring it back.
#[derive(Clone)]
pub struct Ruv {
    generation: Option<String>,
    elements: SmallVec<[RuvElement; 4]>,
    cleaned: BTreeSet<ReplicaId>,
    clock: Arc<dyn Clock>,
}

impl Ruv {
    /// Creates an empty RUV without any replicas.
    pub fn new(generation: Option<String>) -> Self {
        Ruv {
            generation,
            elements: SmallVec::new(),
            cleaned: BTreeSet::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Creates a RUV of a freshly initialized replica. It contains a single element describing
    /// that replica, with both min and max CSN set to its origin.
    pub fn init_new(generation: &str, replica_id: ReplicaId, supplier_url: &str) -> Self {
        let origin = Csn::origin(replica_id);
        let mut ruv = Ruv::new(Some(generation.to_string()));
        ruv.elements.push(RuvElement::with_csns(replica_id, supplier_url, origin, origin));
        ruv
    }

    /// Replaces a clock used to stamp last modification time of the elements.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Creates a new replica generation identifier.
    pub fn mint_generation(clock: &dyn Clock) -> String {
        format!("{:08x}{:08x}", clock.now(), rand::random::<u32>())
    }

    pub fn replica_generation(&self) -> Option<&str> { self.generation.as_deref() }

    pub fn set_replica_generation(&mut self, generation: &str) {
        self.generation = Some(generation.to_string());
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RuvElement> { self.elements.iter() }

    pub fn replica_count(&self) -> usize { self.elements.len() }

    pub fn contains_replica(&self, rid: ReplicaId) -> bool { self.position(rid).is_some() }

    pub fn element(&self, rid: ReplicaId) -> Option<&RuvElement> {
        self.elements.iter().find(|e| e.replica_id == rid)
    }

    fn position(&self, rid: ReplicaId) -> Option<usize> {
        self.elements.iter().position(|e| e.replica_id == rid)
    }

    fn element_mut(&mut self, rid: ReplicaId) -> Result<&mut RuvElement, RuvError> {
        self.elements
            .iter_mut()
            .find(|e| e.replica_id == rid)
            .ok_or(RuvError::NotFound(rid))
    }

    pub(crate) fn push_element(&mut self, element: RuvElement) -> Result<(), RuvError> {
        if self.contains_replica(element.replica_id) {
            return Err(RuvError::AlreadyExists(element.replica_id));
        }
        self.elements.push(element);
        Ok(())
    }

    pub fn add_replica(&mut self, rid: ReplicaId, url: &str) -> Result<(), RuvError> {
        self.push_element(RuvElement::new(rid, url))
    }

    /// Adds a replica without CSNs at a given position. Index past the end appends it.
    pub fn add_index_replica(&mut self, rid: ReplicaId, url: &str, index: usize) -> Result<(), RuvError> {
        if self.contains_replica(rid) {
            return Err(RuvError::AlreadyExists(rid));
        }
        let index = index.min(self.elements.len());
        self.elements.insert(index, RuvElement::new(rid, url));
        Ok(())
    }

    /// Removes a replica together with its whole history. This is the local part of cleaning a
    /// decommissioned replica out of the topology.
    pub fn delete_replica(&mut self, rid: ReplicaId) -> Result<RuvElement, RuvError> {
        let idx = self.position(rid).ok_or(RuvError::NotFound(rid))?;
        Ok(self.elements.remove(idx))
    }

    /// Removes a decommissioned replica and remembers its id as cleaned. Updates of a cleaned
    /// replica are treated as covered from now on. Returns the removed element, if the replica
    /// was known.
    pub fn clean_replica(&mut self, rid: ReplicaId) -> Option<RuvElement> {
        self.cleaned.insert(rid);
        self.position(rid).map(|idx| self.elements.remove(idx))
    }

    /// Checks if a replica has been cleaned out of this RUV.
    pub fn is_cleaned(&self, rid: ReplicaId) -> bool { self.cleaned.contains(&rid) }

    /// Ids of all cleaned replicas.
    pub fn cleaned_replicas(&self) -> impl Iterator<Item = ReplicaId> + '_ { self.cleaned.iter().copied() }

    /// Forgets that a replica has been cleaned, so that its id can be reused. Returns false if
    /// it wasn't cleaned.
    pub fn release_cleaned(&mut self, rid: ReplicaId) -> bool { self.cleaned.remove(&rid) }

    pub fn replace_replica_url(&mut self, rid: ReplicaId, url: &str) -> Result<(), RuvError> {
        let e = self.element_mut(rid)?;
        e.supplier_url = url.to_string();
        Ok(())
    }

    pub fn get_purl_for_replica(&self, rid: ReplicaId) -> Option<&str> {
        self.element(rid).map(|e| e.supplier_url.as_str())
    }

    pub fn get_max_csn(&self, rid: ReplicaId) -> Result<Csn, RuvError> {
        self.element(rid)
            .and_then(|e| e.max_csn)
            .ok_or(RuvError::NotFound(rid))
    }

    pub fn get_min_csn(&self, rid: ReplicaId) -> Result<Csn, RuvError> {
        self.element(rid)
            .and_then(|e| e.min_csn)
            .ok_or(RuvError::NotFound(rid))
    }

    fn check_origin(rid: ReplicaId, csn: &Csn) -> Result<(), RuvError> {
        if csn.replica_id() != rid {
            Err(RuvError::BadData(format!("csn {} doesn't belong to replica {}", csn, rid)))
        } else {
            Ok(())
        }
    }

    pub fn set_max_csn(&mut self, rid: ReplicaId, csn: &Csn, url: &str) -> Result<(), RuvError> {
        self.set_max_csn_ext(rid, csn, url, false).map(|_| ())
    }

    /// Sets the max CSN of a given replica, creating the replica if it wasn't known before.
    /// With `must_be_greater`, a CSN which doesn't exceed the current max is silently ignored,
    /// so that replayed or retransmitted updates can't move the RUV backwards. Returns true if
    /// the RUV has been changed.
    pub fn set_max_csn_ext(&mut self, rid: ReplicaId, csn: &Csn, url: &str, must_be_greater: bool) -> Result<bool, RuvError> {
        Self::check_origin(rid, csn)?;
        let now = self.clock.now();
        match self.element_mut(rid) {
            Ok(e) => {
                let changed = e.advance_max(*csn, must_be_greater, now)?;
                if changed {
                    e.update_url(url);
                }
                Ok(changed)
            }
            Err(_) => {
                let mut e = RuvElement::with_csns(rid, url, *csn, *csn);
                e.last_modified = now;
                self.elements.push(e);
                Ok(true)
            }
        }
    }

    /// Sets the min CSN of a given replica. It's used by purging, to move the oldest point of
    /// history known to the replica. A min CSN greater than the max one is rejected.
    pub fn set_min_csn(&mut self, rid: ReplicaId, csn: &Csn) -> Result<(), RuvError> {
        Self::check_origin(rid, csn)?;
        let e = self.element_mut(rid)?;
        match e.max_csn {
            Some(max) if *csn <= max => {
                e.min_csn = Some(*csn);
                Ok(())
            }
            Some(max) => Err(RuvError::BadData(format!(
                "min csn {} would exceed max csn {} of replica {}",
                csn, max, rid
            ))),
            None => Err(RuvError::BadData(format!("replica {} has no max csn", rid))),
        }
    }

    /// Widens the `[min, max]` range of the CSN's replica so that it includes `csn`.
    pub fn set_csns(&mut self, csn: &Csn, url: &str) -> Result<(), RuvError> {
        let rid = csn.replica_id();
        let now = self.clock.now();
        match self.element_mut(rid) {
            Ok(e) => {
                if e.max_csn.map_or(true, |max| *csn > max) {
                    e.max_csn = Some(*csn);
                    e.last_modified = now;
                }
                if e.min_csn.map_or(true, |min| *csn < min) {
                    e.min_csn = Some(*csn);
                }
                e.update_url(url);
            }
            Err(_) => {
                let mut e = RuvElement::with_csns(rid, url, *csn, *csn);
                e.last_modified = now;
                self.elements.push(e);
            }
        }
        Ok(())
    }

    /// Lowers max CSN of the CSN's replica, if `csn` is smaller than it. Used while rebuilding
    /// a RUV from a changelog which is scanned from the newest update backwards.
    pub fn set_csns_keep_smallest(&mut self, csn: &Csn) -> Result<(), RuvError> {
        let rid = csn.replica_id();
        let now = self.clock.now();
        match self.element_mut(rid) {
            Ok(e) => {
                if e.max_csn.map_or(true, |max| *csn < max) {
                    e.max_csn = Some(*csn);
                    e.last_modified = now;
                    if e.min_csn.map_or(false, |min| *csn < min) {
                        e.min_csn = Some(*csn);
                    }
                }
            }
            Err(_) => {
                let mut e = RuvElement::with_csns(rid, "", *csn, *csn);
                e.last_modified = now;
                self.elements.push(e);
            }
        }
        Ok(())
    }

    /// Registers a CSN of an operation which is about to be applied. Fails if that CSN is
    /// already in progress. If the RUV covers that CSN, nothing is registered and `Covered`
    /// is returned: the operation is a duplicate.
    pub fn add_csn_inprogress(&mut self, csn: &Csn) -> Result<Admission, RuvError> {
        if self.covers_csn_cleaned(csn) {
            debug!("csn {} is already covered by RUV", csn);
            return Ok(Admission::Covered);
        }
        let rid = csn.replica_id();
        match self.element_mut(rid) {
            Ok(e) => e.pending.insert(*csn)?,
            Err(_) => {
                let mut e = RuvElement::new(rid, "");
                e.pending.insert(*csn)?;
                self.elements.push(e);
            }
        }
        Ok(Admission::Pending)
    }

    /// Removes a CSN of an abandoned operation from the pending list. Committed CSNs which were
    /// held back only by the cancelled one are rolled up.
    pub fn cancel_csn_inprogress(&mut self, csn: &Csn) -> Result<(), RuvError> {
        let now = self.clock.now();
        let e = self
            .element_mut(csn.replica_id())
            .map_err(|_| RuvError::Pending(CsnplError::NotFound(*csn)))?;
        let mut pending = e.pending.clone();
        pending.remove(csn)?;
        if let Some(last) = pending.roll_up().last {
            e.advance_max(last, true, now)?;
        }
        e.pending = pending;
        Ok(())
    }

    /// Records a successfully applied update. If its CSN was registered in progress, it's
    /// committed and the pending list is rolled up, so the max CSN only moves as far as all
    /// preceding operations of that replica have been committed. For local updates, the first
    /// rolled up CSN also becomes the min CSN if it wasn't set yet.
    pub fn update_ruv(&mut self, csn: &Csn, url: &str, is_local: bool) -> Result<(), RuvError> {
        let rid = csn.replica_id();
        if self.is_cleaned(rid) {
            debug!("ignoring csn {} of cleaned replica {}", csn, rid);
            return Ok(());
        }
        let now = self.clock.now();
        let e = match self.element_mut(rid) {
            Ok(e) => e,
            Err(_) => {
                let mut e = RuvElement::with_csns(rid, url, *csn, *csn);
                e.last_modified = now;
                self.elements.push(e);
                return Ok(());
            }
        };

        if e.pending.contains(csn) {
            // roll up on a scratch copy, so a rejected max leaves the list untouched
            let mut pending = e.pending.clone();
            pending.commit(csn)?;
            let rolled = pending.roll_up();
            let (first, last) = match (rolled.first, rolled.last) {
                (Some(first), Some(last)) => (first, last),
                _ => {
                    e.pending = pending;
                    return Ok(());
                }
            };
            if e.advance_max(last, true, now)? {
                e.update_url(url);
            }
            if is_local && e.min_csn.is_none() {
                e.min_csn = Some(first);
            }
            e.pending = pending;
        } else {
            if e.advance_max(*csn, true, now)? {
                e.update_url(url);
            }
            if is_local && e.min_csn.is_none() {
                e.min_csn = Some(*csn);
            }
        }
        Ok(())
    }

    /// Forces max CSN of the CSN's replica forward, ignoring CSNs not greater than the current
    /// one.
    pub fn force_csn_update(&mut self, csn: &Csn) -> Result<bool, RuvError> {
        self.set_max_csn_ext(csn.replica_id(), csn, "", true)
    }

    /// Checks if update identified by `csn` fits within the `[min, max]` range of its replica.
    pub fn covers_csn(&self, csn: &Csn) -> bool {
        self.element(csn.replica_id())
            .map_or(false, |e| e.covers(csn))
    }

    /// Like `covers_csn`, but every CSN of a cleaned replica is considered as covered too.
    pub fn covers_csn_cleaned(&self, csn: &Csn) -> bool {
        self.is_cleaned(csn.replica_id()) || self.covers_csn(csn)
    }

    /// Like `covers_csn`, but the max CSN itself is not considered as covered.
    pub fn covers_csn_strict(&self, csn: &Csn) -> bool {
        self.element(csn.replica_id()).map_or(false, |e| match (e.min_csn, e.max_csn) {
            (Some(min), Some(max)) => min <= *csn && *csn < max,
            _ => false,
        })
    }

    /// Checks if current RUV has seen every update described by `other`.
    pub fn covers_ruv(&self, other: &Ruv) -> bool {
        other
            .elements
            .iter()
            .filter_map(|e| e.max_csn)
            .all(|max| self.element(max.replica_id()).map_or(false, |e| e.max_csn.map_or(false, |m| m >= max)))
    }

    /// Returns the oldest CSN the replica may still need: the smallest min CSN of all
    /// elements, or an older CSN which is still in progress.
    pub fn global_min_csn(&self) -> Option<Csn> {
        self.elements
            .iter()
            .filter(|e| e.replica_id != READ_ONLY_REPLICA_ID && !self.is_cleaned(e.replica_id))
            .flat_map(|e| e.min_csn.into_iter().chain(e.pending.get_min_csn().map(|(csn, _)| csn)))
            .min()
    }

    /// Returns the newest CSN known to the replica.
    pub fn global_max_csn(&self) -> Option<Csn> {
        self.elements
            .iter()
            .filter(|e| e.replica_id != READ_ONLY_REPLICA_ID && !self.is_cleaned(e.replica_id))
            .filter_map(|e| e.max_csn)
            .max()
    }

    pub fn move_local_supplier_to_first(&mut self, rid: ReplicaId) -> Result<(), RuvError> {
        let idx = self.position(rid).ok_or(RuvError::NotFound(rid))?;
        if idx > 0 {
            let e = self.elements.remove(idx);
            self.elements.insert(0, e);
        }
        Ok(())
    }

    pub fn first_id_and_purl(&self) -> Option<(ReplicaId, &str)> {
        self.elements.first().map(|e| (e.replica_id, e.supplier_url.as_str()))
    }

    /// Checks if a given replica has originated any update known to current RUV.
    pub fn local_contains_supplier(&self, rid: ReplicaId) -> bool {
        self.element(rid).map_or(false, |e| e.max_csn.is_some())
    }

    /// Returns the URLs of all known suppliers.
    pub fn referrals(&self) -> Vec<String> {
        self.elements
            .iter()
            .filter(|e| !e.supplier_url.is_empty())
            .map(|e| e.supplier_url.clone())
            .collect()
    }

    /// Checks if any replica has a max CSN.
    pub fn has_csns(&self) -> bool {
        self.elements.iter().any(|e| e.max_csn.is_some())
    }

    /// Checks if any replica has both min and max CSN.
    pub fn has_both_csns(&self) -> bool {
        self.elements.iter().any(|e| e.min_csn.is_some() && e.max_csn.is_some())
    }

    /// Gives a min CSN to every replica that only has a max one. The dummy min CSN precedes
    /// the max by one second.
    pub fn insert_dummy_min_csn(&mut self) {
        for e in self.elements.iter_mut() {
            if let (None, Some(max)) = (e.min_csn, e.max_csn) {
                let dummy = Csn::new(max.timestamp().saturating_sub(1), 0, e.replica_id, 0);
                debug!("replica {}: inserting dummy min csn {}", e.replica_id, dummy);
                e.min_csn = Some(dummy);
            }
        }
    }

    /// Writes current content of the RUV to debug log.
    pub fn dump(&self, name: &str) {
        debug!("{}: {}", name, self);
        for e in self.elements.iter() {
            e.pending.dump(name);
        }
    }
}

impl PartialEq for Ruv {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation && self.elements == other.elements
    }
}

impl Eq for Ruv {}

impl fmt::Debug for Ruv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ruv")
            .field("generation", &self.generation)
            .field("elements", &self.elements)
            .field("cleaned", &self.cleaned)
            .finish()
    }
}

impl fmt::Display for Ruv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_values().join(" | "))
    }
}
