//! The single path through which every change reaches the storage: local writes and updates
//! replayed from other replicas alike.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conflict::{naming_winner, Change, ConflictError, Entry, Resolution};
use crate::csn::Csn;
use crate::store::{EntryStore, StorageError};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("change rejected: {0}")]
    Rejected(#[from] ConflictError),
}

/// Outcome of applying a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Applied,
    /// The change has already been applied before.
    Duplicate,
    /// The change collided with a concurrent one and has been resolved.
    Conflict(Resolution),
}

/// Recomputes naming conflict markers of all entries, tombstones included, which claim `dn`.
/// `changed` is an updated entry not stored yet: it replaces its stored version and is always
/// stored. Entries moved aside are stored before the ones keeping their DN, so the DN index
/// ends up pointing at the owner.
///
/// Returns the naming conflict `changed` takes part in, either as a winner or as a loser.
pub fn settle_naming<S: EntryStore + ?Sized>(store: &S, dn: &str, changed: Option<Entry>) -> Result<Option<Resolution>, StorageError> {
    let subject = changed.as_ref().map(|e| e.uniqueid().to_string());
    let mut claims = store.entries_claiming(dn)?;
    if let Some(entry) = changed {
        claims.retain(|e| e.uniqueid() != entry.uniqueid());
        claims.push(entry);
    }
    claims.sort_by(|a, b| a.uniqueid().cmp(b.uniqueid()));
    let winners: Vec<Option<String>> = claims
        .iter()
        .map(|e| naming_winner(e, &claims).map(|w| w.uniqueid().to_string()))
        .collect();

    let is_subject = |uid: &str| subject.as_deref() == Some(uid);
    let mut resolution = None;
    let mut moved_aside = Vec::new();
    let mut keeping = Vec::new();
    for (mut entry, winner) in claims.into_iter().zip(winners) {
        let marker_changed = entry.set_naming_conflict(winner.is_some());
        if let Some(winner) = winner.as_deref() {
            if resolution.is_none() && (is_subject(entry.uniqueid()) || is_subject(winner)) {
                resolution = Some(Resolution::NamingConflict {
                    winner: winner.to_string(),
                    loser: entry.uniqueid().to_string(),
                    renamed_dn: entry.dn().into_owned(),
                });
            }
        }
        if marker_changed || is_subject(entry.uniqueid()) {
            if entry.is_naming_conflict() {
                moved_aside.push(entry);
            } else {
                keeping.push(entry);
            }
        }
    }
    for entry in moved_aside.iter().chain(keeping.iter()) {
        store.put_entry(entry)?;
    }
    if let Some(resolution) = resolution.as_ref() {
        warn!("naming conflict on '{}': {:?}", dn, resolution);
    }
    Ok(resolution)
}

/// Applies `change` of an entry identified by `uniqueid`, resolving conflicts with concurrent
/// updates.
pub fn apply_change<S: EntryStore + ?Sized>(store: &S, uniqueid: &str, change: &Change, csn: &Csn) -> Result<ApplyOutcome, ApplyError> {
    debug!("applying {:?} to {} at {}", change, uniqueid, csn);
    match change {
        Change::Add { dn, attributes } => {
            if store.get_entry(uniqueid)?.is_some() {
                return Ok(ApplyOutcome::Duplicate);
            }
            let entry = Entry::new(uniqueid, dn, *csn, attributes);
            Ok(match settle_naming(store, dn, Some(entry))? {
                Some(resolution) => ApplyOutcome::Conflict(resolution),
                None => ApplyOutcome::Applied,
            })
        }
        Change::Modify(mods) => {
            let mut entry = match store.get_entry(uniqueid)? {
                Some(entry) => entry,
                None => return Ok(ApplyOutcome::Conflict(Resolution::TargetMissing)),
            };
            // tombstones keep track of attribute state too, so they stay equal on all replicas
            let superseded = entry.apply_modifications(mods, csn)?;
            store.put_entry(&entry)?;
            if entry.is_tombstone() {
                Ok(ApplyOutcome::Conflict(Resolution::TargetDeleted))
            } else if !superseded.is_empty() {
                Ok(ApplyOutcome::Conflict(Resolution::ValuesSuperseded { attributes: superseded }))
            } else {
                Ok(ApplyOutcome::Applied)
            }
        }
        Change::Rename { new_dn } => {
            let mut entry = match store.get_entry(uniqueid)? {
                Some(entry) => entry,
                None => return Ok(ApplyOutcome::Conflict(Resolution::TargetMissing)),
            };
            let old_dn = entry.claimed_dn().to_string();
            if !entry.rename(new_dn, csn) {
                return Ok(ApplyOutcome::Conflict(Resolution::RenameSuperseded));
            }
            // a tombstone is renamed too, its DN state has to be the same everywhere
            let deleted = entry.is_tombstone();
            let resolution = settle_naming(store, new_dn, Some(entry))?;
            if !old_dn.eq_ignore_ascii_case(new_dn) {
                settle_naming(store, &old_dn, None)?;
            }
            Ok(match resolution {
                _ if deleted => ApplyOutcome::Conflict(Resolution::TargetDeleted),
                Some(resolution) => ApplyOutcome::Conflict(resolution),
                None => ApplyOutcome::Applied,
            })
        }
        Change::Delete => {
            let mut entry = match store.get_entry(uniqueid)? {
                Some(entry) => entry,
                None => return Ok(ApplyOutcome::Conflict(Resolution::TargetMissing)),
            };
            let was_tombstone = entry.is_tombstone();
            if entry.delete(csn) {
                let dn = entry.claimed_dn().to_string();
                settle_naming(store, &dn, Some(entry))?;
            }
            if was_tombstone {
                Ok(ApplyOutcome::Conflict(Resolution::TargetDeleted))
            } else {
                Ok(ApplyOutcome::Applied)
            }
        }
    }
}
