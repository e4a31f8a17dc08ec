//! In-memory transport for processes running as threads of one OS process.
//!
//! Point-to-point traffic travels over unbounded crossbeam channels, one
//! inbox per rank. Collectives rendezvous on a shared generation counter
//! guarded by a mutex and condition variable. A rank that drops its
//! endpoint is recorded as departed, so peers waiting in a collective fail
//! fast instead of sitting out the full timeout.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use super::{Communicator, ProcessId};
use crate::error::{KernelError, KernelResult};

// ── Collective state ─────────────────────────────────────────────────

#[derive(Debug)]
struct Rendezvous {
    generation: u64,
    /// Values contributed to the current generation, by rank.
    contributions: BTreeMap<ProcessId, u64>,
    /// Result of the most recently completed generation.
    result: u64,
    departed: BTreeSet<ProcessId>,
}

#[derive(Debug)]
struct Shared {
    size: u32,
    timeout: Duration,
    state: Mutex<Rendezvous>,
    wakeup: Condvar,
}

impl Shared {
    fn collective(&self, rank: ProcessId, value: u64, operation: &'static str) -> KernelResult<u64> {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.contributions.insert(rank, value);

        if state.contributions.len() == self.size as usize {
            state.result = state.contributions.values().copied().min().unwrap_or(u64::MAX);
            state.contributions.clear();
            state.generation += 1;
            trace!(generation, result = state.result, operation, "collective complete");
            self.wakeup.notify_all();
            return Ok(state.result);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            if state.generation != generation {
                return Ok(state.result);
            }
            let missing = (0..self.size).find(|r| !state.contributions.contains_key(r));
            if let Some(peer) = missing.filter(|r| state.departed.contains(r)) {
                error!(rank, peer, operation, "peer departed during collective");
                state.contributions.remove(&rank);
                return Err(KernelError::PeerUnreachable { peer, operation });
            }
            if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                if state.generation != generation {
                    return Ok(state.result);
                }
                let peer = (0..self.size)
                    .find(|r| !state.contributions.contains_key(r))
                    .unwrap_or(rank);
                error!(rank, peer, operation, timeout = ?self.timeout, "collective timed out");
                state.contributions.remove(&rank);
                return Err(KernelError::PeerUnreachable { peer, operation });
            }
        }
    }

    /// Ranks that have contributed to the current generation.
    #[cfg(test)]
    fn pending_contributors(&self) -> Vec<ProcessId> {
        self.state.lock().contributions.keys().copied().collect()
    }

    fn depart(&self, rank: ProcessId) {
        let mut state = self.state.lock();
        state.departed.insert(rank);
        self.wakeup.notify_all();
    }
}

// ── LocalCluster ─────────────────────────────────────────────────────

/// Factory for a fully connected set of in-memory endpoints.
pub struct LocalCluster;

impl LocalCluster {
    /// Create `size` connected endpoints, one per rank, in rank order.
    ///
    /// `timeout` bounds every barrier and all-reduce.
    pub fn new(size: u32, timeout: Duration) -> Vec<LocalEndpoint> {
        let size = size.max(1);
        let (senders, receivers): (Vec<Sender<Bytes>>, Vec<Receiver<Bytes>>) =
            (0..size).map(|_| channel::unbounded()).unzip();
        let shared = Arc::new(Shared {
            size,
            timeout,
            state: Mutex::new(Rendezvous {
                generation: 0,
                contributions: BTreeMap::new(),
                result: u64::MAX,
                departed: BTreeSet::new(),
            }),
            wakeup: Condvar::new(),
        });
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalEndpoint {
                rank: rank as ProcessId,
                peers: senders.clone(),
                inbox,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One rank's view of a [`LocalCluster`].
pub struct LocalEndpoint {
    rank: ProcessId,
    peers: Vec<Sender<Bytes>>,
    inbox: Receiver<Bytes>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEndpoint")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .field("queued", &self.inbox.len())
            .finish()
    }
}

impl Communicator for LocalEndpoint {
    fn rank(&self) -> ProcessId {
        self.rank
    }

    fn num_processes(&self) -> u32 {
        self.shared.size
    }

    fn send(&self, peer: ProcessId, frame: Bytes) -> KernelResult<()> {
        let sender = self
            .peers
            .get(peer as usize)
            .ok_or(KernelError::ChannelClosed(peer))?;
        if self.shared.state.lock().departed.contains(&peer) {
            return Err(KernelError::ChannelClosed(peer));
        }
        sender
            .send(frame)
            .map_err(|_| KernelError::ChannelClosed(peer))
    }

    fn receive(&self) -> KernelResult<Option<Bytes>> {
        match self.inbox.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(KernelError::ChannelClosed(self.rank)),
        }
    }

    fn barrier(&self) -> KernelResult<()> {
        self.shared.collective(self.rank, 0, "barrier").map(|_| ())
    }

    fn all_reduce_min(&self, value: u64) -> KernelResult<u64> {
        self.shared.collective(self.rank, value, "all_reduce_min")
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.shared.depart(self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_point_to_point() {
        let endpoints = LocalCluster::new(2, Duration::from_secs(1));
        endpoints[0].send(1, Bytes::from_static(b"hi")).unwrap();
        assert_eq!(endpoints[1].receive().unwrap().as_deref(), Some(&b"hi"[..]));
        assert!(endpoints[1].receive().unwrap().is_none());
        assert!(endpoints[0].receive().unwrap().is_none());
    }

    #[test]
    fn test_all_reduce_min_across_threads() {
        let endpoints = LocalCluster::new(3, Duration::from_secs(5));
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|ep| {
                thread::spawn(move || {
                    let first = ep.all_reduce_min(10 + ep.rank() as u64).unwrap();
                    let second = ep.all_reduce_min(100 - ep.rank() as u64).unwrap();
                    (first, second)
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), (10, 98));
        }
    }

    #[test]
    fn test_departed_peer_fails_collective() {
        let mut endpoints = LocalCluster::new(2, Duration::from_secs(5));
        let survivor = endpoints.remove(0);
        drop(endpoints);
        let err = survivor.all_reduce_min(1).unwrap_err();
        assert_eq!(
            err,
            KernelError::PeerUnreachable {
                peer: 1,
                operation: "all_reduce_min"
            }
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_silent_peer_times_out() {
        let endpoints = LocalCluster::new(2, Duration::from_millis(50));
        let err = endpoints[0].barrier().unwrap_err();
        assert!(matches!(err, KernelError::PeerUnreachable { peer: 1, .. }));
    }

    #[test]
    fn test_timed_out_rank_withdraws_contribution() {
        let endpoints = LocalCluster::new(2, Duration::from_millis(50));
        assert!(endpoints[0].all_reduce_min(3).is_err());
        assert!(endpoints[0].shared.pending_contributors().is_empty());

        let departed = LocalCluster::new(2, Duration::from_secs(5));
        let mut departed = departed.into_iter();
        let survivor = departed.next().unwrap();
        drop(departed);
        assert!(survivor.all_reduce_min(3).is_err());
        assert!(survivor.shared.pending_contributors().is_empty());
    }

    #[test]
    fn test_send_to_departed_peer() {
        let mut endpoints = LocalCluster::new(2, Duration::from_secs(1));
        let first = endpoints.remove(0);
        drop(endpoints);
        assert_eq!(
            first.send(1, Bytes::new()),
            Err(KernelError::ChannelClosed(1))
        );
    }
}
