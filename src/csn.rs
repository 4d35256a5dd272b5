use std::fmt;
use std::str::FromStr;

use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::{ReplicaId, Timestamp};

/// Length of a CSN in its textual form.
pub const CSN_STRSIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsnError {
    #[error("malformed CSN '{0}'")]
    BadFormat(String),
}

/// Change sequence number. It identifies a single update originated by a replica and gives
/// all updates in the system a total order: first by `timestamp`, then by `seq_nr` (used to
/// distinguish updates made within the same second), then by the originating `replica_id`
/// and finally by `subseq_nr`.
///
/// Since the replica id is part of the order, two distinct masters can never produce equal
/// CSNs, even when their clocks and sequence numbers line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Csn {
    timestamp: Timestamp,
    seq_nr: u16,
    replica_id: ReplicaId,
    subseq_nr: u16,
}

impl Csn {
    pub fn new(timestamp: Timestamp, seq_nr: u16, replica_id: ReplicaId, subseq_nr: u16) -> Self {
        Csn {
            timestamp,
            seq_nr,
            replica_id,
            subseq_nr,
        }
    }

    /// The smallest CSN a given replica could ever produce.
    pub fn origin(replica_id: ReplicaId) -> Self {
        Csn::new(0, 0, replica_id, 0)
    }

    pub fn timestamp(&self) -> Timestamp { self.timestamp }

    pub fn seq_nr(&self) -> u16 { self.seq_nr }

    pub fn replica_id(&self) -> ReplicaId { self.replica_id }

    pub fn subseq_nr(&self) -> u16 { self.subseq_nr }

    /// Returns a copy of current CSN with a different subsequence number. Subsequence numbers
    /// are used to order several modifications carried within a single operation.
    pub fn with_subseq(&self, subseq_nr: u16) -> Self {
        Csn { subseq_nr, ..*self }
    }

    /// Returns true if `self` was originated by the same replica as `other`.
    pub fn same_origin(&self, other: &Csn) -> bool {
        self.replica_id == other.replica_id
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}{:04x}{:04x}{:04x}",
            self.timestamp, self.seq_nr, self.replica_id, self.subseq_nr
        )
    }
}

impl FromStr for Csn {
    type Err = CsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != CSN_STRSIZE || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CsnError::BadFormat(s.to_string()));
        }
        let bad = |_| CsnError::BadFormat(s.to_string());
        let timestamp = u32::from_str_radix(&s[0..8], 16).map_err(bad)?;
        let seq_nr = u16::from_str_radix(&s[8..12], 16).map_err(bad)?;
        let replica_id = u16::from_str_radix(&s[12..16], 16).map_err(bad)?;
        let subseq_nr = u16::from_str_radix(&s[16..20], 16).map_err(bad)?;
        Ok(Csn::new(timestamp, seq_nr, replica_id, subseq_nr))
    }
}

impl Serialize for Csn {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Csn {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CsnVisitor;
        impl<'de> Visitor<'de> for CsnVisitor {
            type Value = Csn;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a {}-character hexadecimal CSN", CSN_STRSIZE)
            }

            fn visit_str<E: DeError>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(CsnVisitor)
    }
}
