//! Property tests of CSN ordering and of the pending list.

use std::collections::BTreeSet;

use proptest::prelude::*;

use repl_core::csn::Csn;
use repl_core::csnpl::CsnPendingList;

fn csn_strategy() -> impl Strategy<Value = Csn> {
    (0u32..2000, 0u16..4, 1u16..5, 0u16..3).prop_map(|(ts, seq, rid, sub)| Csn::new(ts, seq, rid, sub))
}

proptest! {
    /// CSN order is total and agrees with equality.
    #[test]
    fn prop_csn_total_order(a in csn_strategy(), b in csn_strategy(), c in csn_strategy()) {
        prop_assert!(a <= b || b <= a);
        prop_assert_eq!(a == b, a.cmp(&b) == std::cmp::Ordering::Equal);
        if a <= b && b <= c {
            prop_assert!(a <= c);
        }
        prop_assert_eq!(a < b, (a.timestamp(), a.seq_nr(), a.replica_id(), a.subseq_nr()) < (b.timestamp(), b.seq_nr(), b.replica_id(), b.subseq_nr()));
    }

    /// Text form keeps the order of CSNs.
    #[test]
    fn prop_csn_text_order(a in csn_strategy(), b in csn_strategy()) {
        prop_assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
        prop_assert_eq!(a.to_string().parse::<Csn>().unwrap(), a);
    }

    /// Pending list stays sorted, its visible minimum never goes backwards and a repeated
    /// roll-up changes nothing.
    #[test]
    fn prop_csnpl_roll_up(
        timestamps in prop::collection::btree_set(1u32..500, 1..30),
        commit_order in prop::collection::vec(any::<prop::sample::Index>(), 1..30),
    ) {
        let csns: Vec<Csn> = timestamps.iter().map(|ts| Csn::new(*ts, 0, 1, 0)).collect();
        let mut pl = CsnPendingList::new();
        for csn in csns.iter().rev() {
            pl.insert(*csn).unwrap();
        }
        let sorted: Vec<Csn> = pl.iter().map(|p| p.csn).collect();
        prop_assert_eq!(&sorted, &csns);

        let mut committed = BTreeSet::new();
        let mut watermark: Option<Csn> = None;
        let mut last_min: Option<Csn> = None;
        for idx in commit_order {
            let csn = *idx.get(&csns);
            if committed.insert(csn) {
                pl.commit(&csn).unwrap();
            }
            let rolled = pl.roll_up();
            if let Some(last) = rolled.last {
                prop_assert!(watermark.map_or(true, |w| w < last));
                // everything up to the watermark has been committed
                prop_assert!(csns.iter().filter(|c| **c <= last).all(|c| committed.contains(c)));
                watermark = Some(last);
            }
            if let (Some(prev), Some(min)) = (last_min, rolled.min) {
                prop_assert!(prev <= min);
            }
            if rolled.min.is_some() {
                last_min = rolled.min;
            }

            let again = pl.roll_up();
            prop_assert!(!again.removed_any());
            prop_assert_eq!(again.min, rolled.min);
        }
    }
}
