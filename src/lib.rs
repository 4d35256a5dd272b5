pub mod csn;
pub mod csngen;
pub mod csnpl;
pub mod ruv;
pub mod convergent;
pub mod conflict;
pub mod apply;
pub mod store;
pub mod context;
pub mod config;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::config::ReplicaConfig;
pub use crate::context::{ReplicaContext, ReplicaError, ReplicaEvent, ReplicaObserver};
pub use crate::csn::Csn;
pub use crate::ruv::{Ruv, RuvError};

pub type Result<T> = anyhow::Result<T>;

/// Replica identifier. Every master that can originate updates owns a distinct one.
pub type ReplicaId = u16;

/// Time in seconds since the Unix epoch, as carried by a `Csn`.
pub type Timestamp = u32;

/// Replica id used by read-only consumers. It never originates updates.
pub const READ_ONLY_REPLICA_ID: ReplicaId = u16::MAX;

/// Source of wall clock time. It's injected into every component that needs to stamp something,
/// so that tests can drive time explicitly.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as Timestamp)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU32);

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        ManualClock(AtomicU32::new(now))
    }

    pub fn set(&self, now: Timestamp) {
        self.0.store(now, Ordering::Release);
    }

    pub fn advance(&self, secs: Timestamp) {
        self.0.fetch_add(secs, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.0.load(Ordering::Acquire)
    }
}
