//! In-process implementations of the parallel context
//!
//! `SerialContext` is the single-rank case: barriers are no-ops and the
//! all-to-all is a self-delivery. `ThreadGroup` runs N cooperating ranks as
//! OS threads inside one process, with crossbeam channels carrying payloads
//! and a shared barrier enforcing the collective schedule. The thread group
//! is how rank-count invariance gets validated without a launcher.

use crate::context::ParallelContext;
use crate::error::{ExchangeError, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Barrier};

/// One-rank context: every collective degenerates to a local operation
#[derive(Debug, Default)]
pub struct SerialContext {
    registry: RwLock<HashMap<u64, usize>>,
}

impl SerialContext {
    /// Create a single-rank context
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParallelContext for SerialContext {
    fn nhosts(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn barrier(&self) {}

    fn alltoall(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        if outgoing.len() != 1 {
            return Err(ExchangeError::PayloadCount {
                got: outgoing.len(),
                nhosts: 1,
            });
        }
        Ok(outgoing)
    }

    fn register_gid(&self, gid: u64) -> Result<()> {
        self.registry.write().insert(gid, 0);
        Ok(())
    }

    fn gid_rank(&self, gid: u64) -> Option<usize> {
        self.registry.read().get(&gid).copied()
    }
}

type Payload = (usize, Vec<u8>);

/// One rank of a [`ThreadGroup`]
///
/// Handed to the per-rank closure; holds this rank's channel endpoints and
/// the group-shared barrier and gid registry.
pub struct ThreadRank {
    rank: usize,
    nhosts: usize,
    barrier: Arc<Barrier>,
    senders: Vec<Sender<Payload>>,
    receiver: Receiver<Payload>,
    registry: Arc<RwLock<HashMap<u64, usize>>>,
}

impl ParallelContext for ThreadRank {
    fn nhosts(&self) -> usize {
        self.nhosts
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn alltoall(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        if outgoing.len() != self.nhosts {
            return Err(ExchangeError::PayloadCount {
                got: outgoing.len(),
                nhosts: self.nhosts,
            });
        }
        for (dest, payload) in outgoing.into_iter().enumerate() {
            self.senders[dest]
                .send((self.rank, payload))
                .map_err(|_| ExchangeError::RankDisconnected { peer: dest })?;
        }
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; self.nhosts];
        let mut pending = self.nhosts;
        while pending > 0 {
            let (src, payload) = self.receiver.recv().map_err(|_| {
                // Senders all hung up; report the first source still missing.
                let peer = slots.iter().position(Option::is_none).unwrap_or(0);
                ExchangeError::RankDisconnected { peer }
            })?;
            debug_assert!(slots[src].is_none(), "duplicate payload from rank {}", src);
            slots[src] = Some(payload);
            pending -= 1;
        }
        // Close out the round before any rank starts the next one, so a
        // fast peer's next-round payload cannot land in this round's slots.
        self.barrier.wait();
        Ok(slots.into_iter().map(|s| s.unwrap_or_default()).collect())
    }

    fn register_gid(&self, gid: u64) -> Result<()> {
        let mut registry = self.registry.write();
        if let Some(&owner) = registry.get(&gid) {
            if owner != self.rank {
                return Err(ExchangeError::GidConflict {
                    gid,
                    owner,
                    rank: self.rank,
                });
            }
            return Ok(());
        }
        registry.insert(gid, self.rank);
        Ok(())
    }

    fn gid_rank(&self, gid: u64) -> Option<usize> {
        self.registry.read().get(&gid).copied()
    }
}

/// Runs one closure per rank on dedicated OS threads and joins them
pub struct ThreadGroup;

impl ThreadGroup {
    /// Run `f` once per rank with `nhosts` cooperating ranks
    ///
    /// Returns the per-rank results in rank order. A panic on any rank is
    /// propagated after the remaining threads are joined.
    pub fn run<T, F>(nhosts: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(ThreadRank) -> T + Sync,
    {
        assert!(nhosts >= 1, "a thread group needs at least one rank");
        log::debug!("Spawning thread group with {} ranks", nhosts);

        let barrier = Arc::new(Barrier::new(nhosts));
        let registry = Arc::new(RwLock::new(HashMap::new()));
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..nhosts).map(|_| unbounded::<Payload>()).unzip();

        let contexts: Vec<ThreadRank> = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ThreadRank {
                rank,
                nhosts,
                barrier: Arc::clone(&barrier),
                senders: senders.clone(),
                receiver,
                registry: Arc::clone(&registry),
            })
            .collect();

        std::thread::scope(|scope| {
            let f = &f;
            let handles: Vec<_> = contexts
                .into_iter()
                .map(|ctx| scope.spawn(move || f(ctx)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }
}
