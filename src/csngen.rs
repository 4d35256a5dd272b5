use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::csn::Csn;
use crate::{Clock, ReplicaId, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorError {
    #[error("CSN {remote} is {skew}s ahead of local time, which exceeds the allowed skew of {max}s")]
    ClockSkew { remote: Csn, skew: Timestamp, max: Timestamp },
}

#[derive(Debug, Default)]
struct State {
    sampled_time: Timestamp,
    seq_nr: u16,
    remote_offset: Timestamp,
}

/// Allocates CSNs for a single replica. Generated CSNs are strictly increasing, no matter how
/// many threads ask for them: the clock is read and the sequence bumped under one lock, which
/// is held only for the time of allocation.
///
/// Generator follows the time of the other replicas: whenever a CSN coming from a peer is
/// observed (see: `adjust`), a local offset is moved forward so that the next local CSN is
/// ordered after it. This is similar to how hybrid logical clocks synchronize.
pub struct CsnGenerator {
    replica_id: ReplicaId,
    max_skew: Timestamp,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl CsnGenerator {
    pub fn new(replica_id: ReplicaId, clock: Arc<dyn Clock>, max_skew: Timestamp) -> Self {
        CsnGenerator {
            replica_id,
            max_skew,
            clock,
            state: Mutex::new(State::default()),
        }
    }

    pub fn replica_id(&self) -> ReplicaId { self.replica_id }

    /// Allocates a new CSN, greater than any CSN previously returned by this generator.
    pub fn new_csn(&self) -> Csn {
        let mut state = self.state.lock();
        let now = self.clock.now().saturating_add(state.remote_offset);
        if now > state.sampled_time {
            state.sampled_time = now;
            state.seq_nr = 0;
        } else if state.seq_nr == u16::MAX {
            // sequence space of the current second is exhausted, borrow the next one
            state.sampled_time += 1;
            state.seq_nr = 0;
        } else {
            state.seq_nr += 1;
        }
        Csn::new(state.sampled_time, state.seq_nr, self.replica_id, 0)
    }

    /// Makes sure that CSNs generated from now on are ordered after a given `remote` one. Fails
    /// if the remote clock is so far ahead that following it would push local time beyond the
    /// allowed skew; in that case the generator state is left unchanged.
    pub fn adjust(&self, remote: &Csn) -> Result<(), GeneratorError> {
        let mut state = self.state.lock();
        let local = self
            .clock
            .now()
            .saturating_add(state.remote_offset)
            .max(state.sampled_time);

        if remote.timestamp() > local {
            let skew = remote.timestamp() - local;
            if skew > self.max_skew {
                return Err(GeneratorError::ClockSkew { remote: *remote, skew, max: self.max_skew });
            }
            warn!("replica {}: moving CSN time forward by {}s to follow {}", self.replica_id, skew, remote);
            state.remote_offset += skew;
            state.sampled_time = remote.timestamp();
            state.seq_nr = remote.seq_nr();
        } else if remote.timestamp() == local && (state.sampled_time, state.seq_nr) < (local, remote.seq_nr()) {
            // same second as local time, possibly before anything was issued in it
            debug!("replica {}: bumping sequence to follow {}", self.replica_id, remote);
            state.sampled_time = local;
            state.seq_nr = remote.seq_nr();
        }
        Ok(())
    }

    /// Seeds the generator with the last CSN it was known to emit before a restart, so that
    /// CSNs never go backwards even if the system clock did.
    pub fn seed(&self, last: &Csn) {
        let mut state = self.state.lock();
        if (last.timestamp(), last.seq_nr()) > (state.sampled_time, state.seq_nr) {
            state.sampled_time = last.timestamp();
            state.seq_nr = last.seq_nr();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use crate::csn::Csn;
    use crate::csngen::{CsnGenerator, GeneratorError};
    use crate::{ManualClock, SystemClock};

    #[test]
    fn csngen_sequence_within_second() {
        let clock = Arc::new(ManualClock::new(100));
        let gen = CsnGenerator::new(1, clock.clone(), 60);

        assert_eq!(gen.new_csn(), Csn::new(100, 0, 1, 0));
        assert_eq!(gen.new_csn(), Csn::new(100, 1, 1, 0));
        clock.set(101);
        assert_eq!(gen.new_csn(), Csn::new(101, 0, 1, 0));
    }

    #[test]
    fn csngen_clock_going_backwards() {
        let clock = Arc::new(ManualClock::new(100));
        let gen = CsnGenerator::new(1, clock.clone(), 60);
        let a = gen.new_csn();
        clock.set(90);
        let b = gen.new_csn();
        assert!(a < b);
        assert_eq!(b, Csn::new(100, 1, 1, 0));
    }

    #[test]
    fn csngen_adjust_follows_remote() {
        let clock = Arc::new(ManualClock::new(100));
        let gen = CsnGenerator::new(1, clock.clone(), 60);
        let remote = Csn::new(130, 5, 2, 0);

        gen.adjust(&remote).unwrap();
        let next = gen.new_csn();
        assert!(next > remote);

        // offset is kept, so the local time keeps following the remote one
        clock.set(101);
        assert!(gen.new_csn() > next);
    }

    #[test]
    fn csngen_adjust_same_second() {
        let clock = Arc::new(ManualClock::new(100));
        let gen = CsnGenerator::new(3, clock, 60);
        gen.new_csn();
        let remote = Csn::new(100, 7, 1, 0);
        gen.adjust(&remote).unwrap();
        assert!(gen.new_csn() > remote);
    }

    #[test]
    fn csngen_adjust_before_first_csn() {
        let clock = Arc::new(ManualClock::new(100));
        let gen = CsnGenerator::new(1, clock.clone(), 60);
        let remote = Csn::new(100, 7, 2, 0);
        gen.adjust(&remote).unwrap();
        let next = gen.new_csn();
        assert!(next > remote);
        assert_eq!(next, Csn::new(100, 8, 1, 0));

        // a remote CSN of a second local time has already left behind changes nothing
        clock.set(102);
        gen.adjust(&Csn::new(101, 500, 2, 0)).unwrap();
        assert_eq!(gen.new_csn(), Csn::new(102, 0, 1, 0));
    }

    #[test]
    fn csngen_adjust_same_second_lower_replica() {
        let clock = Arc::new(ManualClock::new(100));
        let gen = CsnGenerator::new(1, clock, 60);
        let remote = Csn::new(100, 0, 9, 0);
        gen.adjust(&remote).unwrap();
        assert!(gen.new_csn() > remote);
    }

    #[test]
    fn csngen_adjust_rejects_excessive_skew() {
        let clock = Arc::new(ManualClock::new(100));
        let gen = CsnGenerator::new(1, clock, 60);
        let before = gen.new_csn();
        let remote = Csn::new(1000, 0, 2, 0);

        assert_eq!(
            gen.adjust(&remote),
            Err(GeneratorError::ClockSkew { remote, skew: 900, max: 60 })
        );
        let after = gen.new_csn();
        assert_eq!(after, Csn::new(100, before.seq_nr() + 1, 1, 0));
    }

    #[test]
    fn csngen_seed_after_restart() {
        let clock = Arc::new(ManualClock::new(50));
        let gen = CsnGenerator::new(1, clock, 60);
        gen.seed(&Csn::new(80, 4, 1, 0));
        assert_eq!(gen.new_csn(), Csn::new(80, 5, 1, 0));
    }

    #[test]
    fn csngen_monotonic_across_threads() {
        let gen = Arc::new(CsnGenerator::new(1, Arc::new(SystemClock), 60));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = gen.clone();
                thread::spawn(move || (0..500).map(|_| gen.new_csn()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            let csns = h.join().unwrap();
            assert!(csns.windows(2).all(|w| w[0] < w[1]));
            all.extend(csns);
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
