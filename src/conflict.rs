//! Deterministic resolution of concurrent updates. Every decision is made by comparing CSNs,
//! and since CSNs are totally ordered, every replica reaches the same decision no matter in
//! which order the updates arrived: the update with the later CSN wins, while the loser is
//! kept around (renamed or recorded as deleted) rather than discarded.
//!
//! State is tracked per attribute value, so concurrent updates touching different attributes
//! of the same entry don't conflict at all.
//!
//! Naming conflicts are decided from CSNs alone too. An entry is moved aside when another
//! entry claimed the same DN with a later CSN while the first one was still alive, that is
//! before its tombstone CSN. Tombstones take part in this, so the outcome doesn't depend on
//! whether a delete arrived before or after the competing claim.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::csn::Csn;

/// Operational attribute marking entries renamed because of a naming conflict.
pub const CONFLICT_ATTRIBUTE: &str = "nsds5ReplConflict";

/// Most modifications a single operation may carry: each of them takes one subsequence number
/// of the operation's CSN, and zero is reserved for the operation itself.
pub const MAX_MODIFICATIONS: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("operation carries {count} modifications, at most {max} are allowed")]
    TooManyModifications { count: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modification {
    Add { attribute: String, values: Vec<String> },
    /// Deletes given values, or a whole attribute when no values are given.
    Delete { attribute: String, values: Vec<String> },
    Replace { attribute: String, values: Vec<String> },
}

impl Modification {
    pub fn attribute(&self) -> &str {
        match self {
            Modification::Add { attribute, .. } => attribute,
            Modification::Delete { attribute, .. } => attribute,
            Modification::Replace { attribute, .. } => attribute,
        }
    }
}

/// A change applied to a single entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Add { dn: String, attributes: BTreeMap<String, Vec<String>> },
    Modify(Vec<Modification>),
    Rename { new_dn: String },
    Delete,
}

/// Which of two competing updates wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Existing,
    Incoming,
}

/// Later CSN wins. CSNs of different updates are never equal, so the outcome never depends on
/// which replica makes the decision.
pub fn later_wins(existing: &Csn, incoming: &Csn) -> Winner {
    if incoming > existing {
        Winner::Incoming
    } else {
        Winner::Existing
    }
}

/// The way a conflicting update has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Two entries claimed the same DN. The loser has been renamed to `renamed_dn`.
    NamingConflict {
        winner: String,
        loser: String,
        renamed_dn: String,
    },
    /// Some values carried by a modification lost to later updates of the same attributes.
    ValuesSuperseded { attributes: Vec<String> },
    /// The entry has been renamed by a later update.
    RenameSuperseded,
    /// The entry has been deleted.
    TargetDeleted,
    /// The entry doesn't exist.
    TargetMissing,
}

/// State of a single attribute: which values are present (and the CSN which added them
/// last), which have been deleted (and when), and when the whole attribute was last cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeState {
    present: BTreeMap<String, Csn>,
    deleted: BTreeMap<String, Csn>,
    cleared: Option<Csn>,
}

impl AttributeState {
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.present.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool { self.present.is_empty() }

    pub fn value_csn(&self, value: &str) -> Option<Csn> {
        self.present.get(value).copied()
    }

    /// Returns false if the value lost to a later delete.
    fn add_value(&mut self, value: &str, csn: Csn) -> bool {
        if self.cleared.map_or(false, |cleared| cleared > csn) {
            return false;
        }
        if self.deleted.get(value).map_or(false, |deleted| *deleted >= csn) {
            return false;
        }
        self.deleted.remove(value);
        let added = self.present.entry(value.to_string()).or_insert(csn);
        if *added < csn {
            *added = csn;
        }
        true
    }

    /// Returns false if the value has been added again, or the attribute cleared, by a later
    /// update.
    fn delete_value(&mut self, value: &str, csn: Csn) -> bool {
        if self.present.get(value).map_or(false, |added| *added > csn) {
            return false;
        }
        if self.cleared.map_or(false, |cleared| cleared >= csn) {
            // the attribute has been cleared since, nothing older than that is remembered
            return false;
        }
        self.present.remove(value);
        let deleted = self.deleted.entry(value.to_string()).or_insert(csn);
        if *deleted < csn {
            *deleted = csn;
        }
        true
    }

    /// Removes every value added before `csn`. Returns false if the attribute has been cleared
    /// by a later update or some values added later survived.
    fn clear(&mut self, csn: Csn) -> bool {
        if self.cleared.map_or(false, |cleared| cleared > csn) {
            return false;
        }
        self.cleared = Some(csn);
        self.present.retain(|_, added| *added > csn);
        self.deleted.retain(|_, deleted| *deleted > csn);
        self.present.is_empty()
    }
}

/// Replicated state of a directory entry. `dn` is the DN given to the entry by its last add or
/// rename; while the entry is moved aside by a naming conflict it's visible under a DN prefixed
/// with its unique id instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    uniqueid: String,
    dn: String,
    dn_csn: Csn,
    attributes: BTreeMap<String, AttributeState>,
    tombstone: Option<Csn>,
    conflict: Option<String>,
}

impl Entry {
    pub fn new(uniqueid: &str, dn: &str, csn: Csn, attributes: &BTreeMap<String, Vec<String>>) -> Self {
        let mut entry = Entry {
            uniqueid: uniqueid.to_string(),
            dn: dn.to_string(),
            dn_csn: csn,
            attributes: BTreeMap::new(),
            tombstone: None,
            conflict: None,
        };
        for (name, values) in attributes.iter() {
            let state = entry.attributes.entry(name.to_ascii_lowercase()).or_default();
            for value in values {
                state.add_value(value, csn);
            }
        }
        entry
    }

    pub fn uniqueid(&self) -> &str { &self.uniqueid }

    /// DN under which the entry is visible.
    pub fn dn(&self) -> Cow<'_, str> {
        if self.conflict.is_some() {
            Cow::Owned(format!("nsuniqueid={}+{}", self.uniqueid, self.dn))
        } else {
            Cow::Borrowed(&self.dn)
        }
    }

    /// DN the entry has been given, even if a naming conflict moved it aside.
    pub fn claimed_dn(&self) -> &str { &self.dn }

    /// CSN of the update which gave the entry its current DN.
    pub fn dn_csn(&self) -> Csn { self.dn_csn }

    pub fn is_tombstone(&self) -> bool { self.tombstone.is_some() }

    pub fn tombstone_csn(&self) -> Option<Csn> { self.tombstone }

    /// Value of the conflict marker, if the entry has been renamed because of a naming
    /// conflict.
    pub fn conflict(&self) -> Option<&str> { self.conflict.as_deref() }

    pub fn is_naming_conflict(&self) -> bool { self.conflict.is_some() }

    /// Checks if the entry was alive when `csn` happened.
    fn alive_at(&self, csn: &Csn) -> bool { self.tombstone.map_or(true, |deleted| *csn < deleted) }

    pub fn attribute(&self, name: &str) -> Option<&AttributeState> {
        self.attributes.get(&name.to_ascii_lowercase())
    }

    /// Returns present values of a given attribute.
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.attribute(name).map(|a| a.values().collect()).unwrap_or_default()
    }

    /// Applies modifications of a single operation. Each modification gets its own
    /// subsequence number, so later modifications of the same operation win over the earlier
    /// ones. Returns names of the attributes where some part of the operation lost to a later
    /// update. An operation with more modifications than there are subsequence numbers is
    /// rejected as a whole.
    pub fn apply_modifications(&mut self, mods: &[Modification], csn: &Csn) -> Result<Vec<String>, ConflictError> {
        let too_many = || ConflictError::TooManyModifications { count: mods.len(), max: MAX_MODIFICATIONS };
        if mods.len() > MAX_MODIFICATIONS {
            return Err(too_many());
        }
        let mut superseded = Vec::new();
        for (i, m) in mods.iter().enumerate() {
            let subseq = u16::try_from(i + 1).map_err(|_| too_many())?;
            let csn = csn.with_subseq(subseq);
            let name = m.attribute().to_ascii_lowercase();
            let state = self.attributes.entry(name.clone()).or_default();
            let applied = match m {
                Modification::Add { values, .. } => values
                    .iter()
                    .fold(true, |acc, v| state.add_value(v, csn) && acc),
                Modification::Delete { values, .. } if values.is_empty() => state.clear(csn),
                Modification::Delete { values, .. } => values
                    .iter()
                    .fold(true, |acc, v| state.delete_value(v, csn) && acc),
                Modification::Replace { values, .. } => {
                    let cleared = state.clear(csn);
                    values.iter().fold(cleared, |acc, v| state.add_value(v, csn) && acc)
                }
            };
            if !applied && !superseded.contains(&name) {
                superseded.push(name);
            }
        }
        Ok(superseded)
    }

    /// Gives entry a new DN, unless it has already been renamed by a later update. Returns
    /// true if the rename has been applied.
    pub fn rename(&mut self, new_dn: &str, csn: &Csn) -> bool {
        match later_wins(&self.dn_csn, csn) {
            Winner::Existing => false,
            Winner::Incoming => {
                self.dn = new_dn.to_string();
                self.dn_csn = *csn;
                self.conflict = None;
                true
            }
        }
    }

    /// Turns entry into a tombstone. When deleted concurrently on several replicas, the
    /// earliest delete is kept. Returns true if the tombstone has been set by this call.
    pub fn delete(&mut self, csn: &Csn) -> bool {
        match self.tombstone {
            Some(existing) if existing <= *csn => false,
            _ => {
                self.tombstone = Some(*csn);
                true
            }
        }
    }

    /// Moves entry out of the way of the entry which won its DN, or brings it back. Returns
    /// true if the marker has changed.
    pub fn set_naming_conflict(&mut self, marked: bool) -> bool {
        let marker = if marked { Some(format!("namingConflict {}", self.dn)) } else { None };
        if self.conflict == marker {
            return false;
        }
        self.conflict = marker;
        true
    }
}

/// Finds the entry which took the DN away from `entry`: another entry which claimed the same DN
/// with a later CSN, while both of them were alive. When there are several, the latest claim is
/// returned. `entry` is not moved aside if there is none.
pub fn naming_winner<'a>(entry: &Entry, claims: &'a [Entry]) -> Option<&'a Entry> {
    claims
        .iter()
        .filter(|other| other.uniqueid != entry.uniqueid && other.dn.eq_ignore_ascii_case(&entry.dn))
        .filter(|other| other.dn_csn > entry.dn_csn)
        .filter(|other| other.alive_at(&other.dn_csn) && entry.alive_at(&other.dn_csn))
        .max_by_key(|other| other.dn_csn)
}
