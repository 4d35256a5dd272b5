use log::debug;
use thiserror::Error;

use crate::csn::Csn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CsnplError {
    #[error("CSN {0} is already pending")]
    DuplicateCsn(Csn),
    #[error("CSN {0} is not pending")]
    NotFound(Csn),
    #[error("failed to grow pending list while inserting {0}")]
    AllocationFailure(Csn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCsn {
    pub csn: Csn,
    pub committed: bool,
}

/// Result of a `CsnPendingList::roll_up`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollUp {
    /// The smallest CSN still pending once the roll-up is done.
    pub min: Option<Csn>,
    /// The earliest CSN removed by this roll-up.
    pub first: Option<Csn>,
    /// The greatest CSN removed by this roll-up. Every CSN up to it has been committed.
    pub last: Option<Csn>,
}

impl RollUp {
    pub fn removed_any(&self) -> bool { self.first.is_some() }
}

/// CSN pending list. Keeps CSNs which have been issued but not yet rolled off, in ascending
/// order. Operations can commit in any order, but the list is only ever consumed from the
/// front: a single uncommitted CSN holds back everything issued after it.
#[derive(Debug, Clone, Default)]
pub struct CsnPendingList(Vec<PendingCsn>);

impl CsnPendingList {
    pub fn new() -> Self { CsnPendingList(Vec::new()) }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> std::slice::Iter<'_, PendingCsn> { self.0.iter() }

    pub fn contains(&self, csn: &Csn) -> bool { self.position(csn).is_ok() }

    fn position(&self, csn: &Csn) -> Result<usize, usize> {
        self.0.binary_search_by(|p| p.csn.cmp(csn))
    }

    pub fn insert(&mut self, csn: Csn) -> Result<(), CsnplError> {
        match self.position(&csn) {
            Ok(_) => Err(CsnplError::DuplicateCsn(csn)),
            Err(idx) => {
                self.0
                    .try_reserve(1)
                    .map_err(|_| CsnplError::AllocationFailure(csn))?;
                self.0.insert(idx, PendingCsn { csn, committed: false });
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, csn: &Csn) -> Result<(), CsnplError> {
        let idx = self.position(csn).map_err(|_| CsnplError::NotFound(*csn))?;
        self.0.remove(idx);
        Ok(())
    }

    /// Marks pending `csn` as committed. Committing the same CSN twice is a no-op.
    pub fn commit(&mut self, csn: &Csn) -> Result<(), CsnplError> {
        let idx = self.position(csn).map_err(|_| CsnplError::NotFound(*csn))?;
        self.0[idx].committed = true;
        Ok(())
    }

    /// Returns the smallest pending CSN together with its commit flag.
    pub fn get_min_csn(&self) -> Option<(Csn, bool)> {
        self.0.first().map(|p| (p.csn, p.committed))
    }

    /// Removes committed CSNs from the front of the list, stopping at the first one which has
    /// not been committed yet.
    pub fn roll_up(&mut self) -> RollUp {
        let n = self.0.iter().take_while(|p| p.committed).count();
        let mut result = RollUp::default();
        if n > 0 {
            result.first = Some(self.0[0].csn);
            result.last = Some(self.0[n - 1].csn);
            self.0.drain(..n);
            debug!("csn pending list rolled up {} entries: {:?}", n, result);
        }
        result.min = self.0.first().map(|p| p.csn);
        result
    }

    /// Writes current content of the list to debug log.
    pub fn dump(&self, caller: &str) {
        debug!("{}: csn pending list content ({} entries)", caller, self.0.len());
        for p in self.0.iter() {
            debug!("{}: {} - {}", caller, p.csn, if p.committed { "committed" } else { "not committed" });
        }
    }
}

#[cfg(test)]
mod test {
    use crate::csn::Csn;
    use crate::csnpl::{CsnPendingList, CsnplError, RollUp};

    fn csn(ts: u32) -> Csn { Csn::new(ts, 0, 1, 0) }

    #[test]
    fn csnpl_keeps_ascending_order() {
        let mut pl = CsnPendingList::new();
        pl.insert(csn(30)).unwrap();
        pl.insert(csn(10)).unwrap();
        pl.insert(csn(20)).unwrap();

        let order: Vec<_> = pl.iter().map(|p| p.csn).collect();
        assert_eq!(order, vec![csn(10), csn(20), csn(30)]);
        assert_eq!(pl.get_min_csn(), Some((csn(10), false)));
    }

    #[test]
    fn csnpl_insert_duplicate() {
        let mut pl = CsnPendingList::new();
        pl.insert(csn(10)).unwrap();
        assert_eq!(pl.insert(csn(10)), Err(CsnplError::DuplicateCsn(csn(10))));
        assert_eq!(pl.len(), 1);
    }

    #[test]
    fn csnpl_remove_and_commit_missing() {
        let mut pl = CsnPendingList::new();
        assert_eq!(pl.remove(&csn(10)), Err(CsnplError::NotFound(csn(10))));
        assert_eq!(pl.commit(&csn(10)), Err(CsnplError::NotFound(csn(10))));

        pl.insert(csn(10)).unwrap();
        pl.commit(&csn(10)).unwrap();
        pl.commit(&csn(10)).unwrap();
        pl.remove(&csn(10)).unwrap();
        assert!(pl.is_empty());
    }

    #[test]
    fn csnpl_uncommitted_blocks_roll_up() {
        let mut pl = CsnPendingList::new();
        pl.insert(csn(10)).unwrap();
        pl.insert(csn(20)).unwrap();
        pl.commit(&csn(20)).unwrap();

        let r = pl.roll_up();
        assert_eq!(r, RollUp { min: Some(csn(10)), first: None, last: None });
        assert_eq!(pl.len(), 2);
    }

    #[test]
    fn csnpl_roll_up_stops_at_gap() {
        let mut pl = CsnPendingList::new();
        for ts in &[10, 20, 30, 40] {
            pl.insert(csn(*ts)).unwrap();
        }
        pl.commit(&csn(10)).unwrap();
        pl.commit(&csn(20)).unwrap();
        pl.commit(&csn(40)).unwrap();

        let r = pl.roll_up();
        assert_eq!(r, RollUp { min: Some(csn(30)), first: Some(csn(10)), last: Some(csn(20)) });

        pl.commit(&csn(30)).unwrap();
        let r = pl.roll_up();
        assert_eq!(r, RollUp { min: None, first: Some(csn(30)), last: Some(csn(40)) });
        assert!(pl.is_empty());
    }

    #[test]
    fn csnpl_roll_up_twice_is_noop() {
        let mut pl = CsnPendingList::new();
        for ts in &[10, 20, 30] {
            pl.insert(csn(*ts)).unwrap();
        }
        pl.commit(&csn(10)).unwrap();

        let first = pl.roll_up();
        assert!(first.removed_any());
        let second = pl.roll_up();
        let third = pl.roll_up();
        assert_eq!(second.min, first.min);
        assert!(!second.removed_any());
        assert_eq!(second, third);
        assert_eq!(pl.len(), 2);
    }
}
