use log::{debug, warn};

use crate::convergent::{merge_max, merge_min, Convergent};
use crate::csn::Csn;
use crate::ruv::{Ruv, RuvElement, RuvError};
use crate::ReplicaId;

/// Result of comparing two RUVs. Variants are declared from the least to the most severe one,
/// so when several differences are found, the greatest one is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuvComparison {
    Success,
    /// The second RUV lacks replicas present in the first one.
    Ruv2Missing,
    /// The first RUV lacks replicas present in the second one.
    Ruv1Missing,
    /// One or both of the RUVs have no replica generation.
    NoGeneration,
    /// The second RUV has seen updates of some replica which the first one hasn't.
    CsnDiffers,
    /// RUVs describe different datasets.
    GenerationDiffers,
}

impl RuvComparison {
    /// Fatal results mean that the replicas can't be treated as consistent with each other and
    /// one of them has to be reinitialized. Missing replicas are only advisory: a replica may
    /// simply not have heard about a newly added peer yet.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuvComparison::NoGeneration | RuvComparison::CsnDiffers | RuvComparison::GenerationDiffers
        )
    }
}

/// Compares `local` RUV with the `remote` one. With `strict` set, remote having seen newer
/// updates of any replica is reported as `CsnDiffers`.
pub fn compare_ruv(local: &Ruv, remote: &Ruv, strict: bool) -> RuvComparison {
    let (lgen, rgen) = match (local.replica_generation(), remote.replica_generation()) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            debug!("compare_ruv: missing replica generation");
            return RuvComparison::NoGeneration;
        }
    };
    if lgen != rgen {
        debug!("compare_ruv: replica generation {} differs from {}", lgen, rgen);
        return RuvComparison::GenerationDiffers;
    }

    let mut result = RuvComparison::Success;
    for r in remote.iter() {
        match local.element(r.replica_id()) {
            None => {
                debug!("compare_ruv: replica {} missing from local RUV", r.replica_id());
                result = result.max(RuvComparison::Ruv1Missing);
            }
            Some(l) => {
                if strict && r.max_csn() > l.max_csn() {
                    debug!(
                        "compare_ruv: replica {} max csn {:?} is behind remote {:?}",
                        r.replica_id(),
                        l.max_csn(),
                        r.max_csn()
                    );
                    result = result.max(RuvComparison::CsnDiffers);
                }
            }
        }
    }
    if local.iter().any(|l| !remote.contains_replica(l.replica_id())) {
        result = result.max(RuvComparison::Ruv2Missing);
    }
    result
}

/// Checks if `supplier` RUV has seen updates that `consumer` hasn't.
pub fn is_newer(supplier: &Ruv, consumer: &Ruv) -> bool {
    supplier.iter().any(|s| match s.max_csn() {
        None => false,
        Some(max) => consumer
            .element(s.replica_id())
            .and_then(|c| c.max_csn())
            .map_or(true, |cmax| cmax < max),
    })
}

/// A range of updates of a single replica: every CSN greater than `after` (or all of them when
/// it's `None`) up to and including `through`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRange {
    pub replica_id: ReplicaId,
    pub after: Option<Csn>,
    pub through: Csn,
}

impl UpdateRange {
    pub fn contains(&self, csn: &Csn) -> bool {
        csn.replica_id() == self.replica_id
            && self.after.map_or(true, |after| *csn > after)
            && *csn <= self.through
    }
}

/// Computes which updates known to `local` should be sent to the replica described by `remote`.
pub fn missing_ranges(local: &Ruv, remote: &Ruv) -> Vec<UpdateRange> {
    local
        .iter()
        .filter_map(|l| {
            let through = l.max_csn()?;
            let after = remote.element(l.replica_id()).and_then(|r| r.max_csn());
            if after.map_or(true, |after| after < through) {
                Some(UpdateRange { replica_id: l.replica_id(), after, through })
            } else {
                None
            }
        })
        .collect()
}

impl Ruv {
    /// Merges `other` into current RUV. RUVs of different datasets are never merged.
    pub fn try_merge(&mut self, other: &Ruv) -> Result<bool, RuvError> {
        match (self.generation.as_deref(), other.generation.as_deref()) {
            (Some(l), Some(r)) if l != r => {
                return Err(RuvError::GenerationMismatch {
                    local: self.generation.clone(),
                    remote: other.generation.clone(),
                })
            }
            _ => {}
        }

        let mut changed = false;
        if self.generation.is_none() && other.generation.is_some() {
            self.generation = other.generation.clone();
            changed = true;
        }

        let now = self.clock.now();
        for r in other.iter() {
            if self.is_cleaned(r.replica_id()) {
                continue;
            }
            match self.element_mut(r.replica_id()) {
                Ok(l) => {
                    let max_changed = merge_max(&mut l.max_csn, r.max_csn);
                    let min_changed = merge_min(&mut l.min_csn, r.min_csn);
                    if max_changed {
                        l.last_modified = now;
                    }
                    if l.supplier_url.is_empty() && !r.supplier_url.is_empty() {
                        l.supplier_url = r.supplier_url.clone();
                    }
                    changed = changed || max_changed || min_changed;
                }
                Err(_) => {
                    let mut e = RuvElement::new(r.replica_id(), r.supplier_url());
                    e.min_csn = r.min_csn;
                    e.max_csn = r.max_csn;
                    e.last_modified = r.last_modified;
                    self.elements.push(e);
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

impl Convergent for Ruv {
    fn merge(&mut self, other: &Self) -> bool {
        match self.try_merge(other) {
            Ok(changed) => changed,
            Err(e) => {
                warn!("refusing to merge RUV: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::convergent::Convergent;
    use crate::csn::Csn;
    use crate::ruv::compare::{compare_ruv, is_newer, missing_ranges, RuvComparison, UpdateRange};
    use crate::ruv::{Ruv, RuvError};

    fn csn(ts: u32, rid: u16) -> Csn { Csn::new(ts, 0, rid, 0) }

    fn ruv(generation: &str, maxes: &[(u16, u32)]) -> Ruv {
        let mut ruv = Ruv::new(Some(generation.to_string()));
        for (rid, max) in maxes {
            ruv.set_max_csn(*rid, &csn(*max, *rid), "").unwrap();
        }
        ruv
    }

    #[test]
    fn compare_with_itself() {
        let a = ruv("G1", &[(1, 100), (2, 200)]);
        assert_eq!(compare_ruv(&a, &a, true), RuvComparison::Success);
    }

    #[test]
    fn compare_generation_differs() {
        let a = ruv("G1", &[(1, 100)]);
        let b = ruv("G2", &[(1, 100)]);
        assert_eq!(compare_ruv(&a, &b, false), RuvComparison::GenerationDiffers);
        assert_eq!(compare_ruv(&a, &b, true), RuvComparison::GenerationDiffers);
        assert!(RuvComparison::GenerationDiffers.is_fatal());
    }

    #[test]
    fn compare_no_generation() {
        let a = ruv("G1", &[(1, 100)]);
        let b = Ruv::new(None);
        assert_eq!(compare_ruv(&a, &b, true), RuvComparison::NoGeneration);
        assert_eq!(compare_ruv(&b, &a, true), RuvComparison::NoGeneration);
    }

    #[test]
    fn compare_csn_differs_only_when_strict() {
        let local = ruv("G1", &[(1, 100), (2, 200)]);
        let remote = ruv("G1", &[(1, 100), (2, 250)]);
        assert_eq!(compare_ruv(&local, &remote, false), RuvComparison::Success);
        assert_eq!(compare_ruv(&local, &remote, true), RuvComparison::CsnDiffers);
        // local being ahead is fine
        assert_eq!(compare_ruv(&remote, &local, true), RuvComparison::Success);
    }

    #[test]
    fn compare_missing_replicas() {
        let local = ruv("G1", &[(1, 100)]);
        let remote = ruv("G1", &[(1, 100), (2, 50)]);
        assert_eq!(compare_ruv(&local, &remote, true), RuvComparison::Ruv1Missing);
        assert_eq!(compare_ruv(&remote, &local, true), RuvComparison::Ruv2Missing);
        assert!(!RuvComparison::Ruv1Missing.is_fatal());
        assert!(!RuvComparison::Ruv2Missing.is_fatal());
    }

    #[test]
    fn compare_reports_most_severe() {
        let local = ruv("G1", &[(1, 100), (3, 10)]);
        let remote = ruv("G1", &[(1, 150), (2, 50)]);
        assert_eq!(compare_ruv(&local, &remote, true), RuvComparison::CsnDiffers);
        assert_eq!(compare_ruv(&local, &remote, false), RuvComparison::Ruv1Missing);
    }

    #[test]
    fn ruv_is_newer() {
        let a = ruv("G1", &[(1, 100), (2, 200)]);
        let b = ruv("G1", &[(1, 100), (2, 150)]);
        assert!(is_newer(&a, &b));
        assert!(!is_newer(&b, &a));
        assert!(!is_newer(&a, &a));
        assert!(is_newer(&ruv("G1", &[(3, 1)]), &a));
    }

    #[test]
    fn ruv_missing_ranges() {
        let local = ruv("G1", &[(1, 100), (2, 200), (3, 300)]);
        let remote = ruv("G1", &[(1, 100), (2, 150)]);
        let ranges = missing_ranges(&local, &remote);
        assert_eq!(
            ranges,
            vec![
                UpdateRange { replica_id: 2, after: Some(csn(150, 2)), through: csn(200, 2) },
                UpdateRange { replica_id: 3, after: None, through: csn(300, 3) },
            ]
        );
        assert!(ranges[0].contains(&csn(151, 2)));
        assert!(!ranges[0].contains(&csn(150, 2)));
        assert!(!ranges[0].contains(&csn(151, 1)));
        assert!(missing_ranges(&remote, &remote).is_empty());
    }

    #[test]
    fn ruv_merge() {
        let mut a = ruv("G1", &[(1, 100), (2, 150)]);
        let b = ruv("G1", &[(2, 200), (3, 50)]);

        assert!(a.merge(&b));
        assert_eq!(a.get_max_csn(1), Ok(csn(100, 1)));
        assert_eq!(a.get_max_csn(2), Ok(csn(200, 2)));
        assert_eq!(a.get_min_csn(2), Ok(csn(150, 2)));
        assert_eq!(a.get_max_csn(3), Ok(csn(50, 3)));
        assert!(!a.merge(&b));
        assert!(a.covers_ruv(&b));
    }

    #[test]
    fn ruv_merge_refuses_other_generation() {
        let mut a = ruv("G1", &[(1, 100)]);
        let b = ruv("G2", &[(1, 200)]);
        let before = a.clone();
        assert_eq!(
            a.try_merge(&b),
            Err(RuvError::GenerationMismatch { local: Some("G1".into()), remote: Some("G2".into()) })
        );
        assert!(!a.merge(&b));
        assert_eq!(a, before);
    }
}
