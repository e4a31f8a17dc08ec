//! Inter-process message exchange.
//!
//! The kernel needs only four things from a transport: point-to-point
//! send, non-blocking receive, a barrier and a minimum all-reduce for GVT
//! rounds. Any backend implementing [`Communicator`] can carry a run;
//! [`LocalCluster`] connects processes that live as threads of one OS
//! process.
//!
//! # Module structure
//!
//! | Sub-module | Contents |
//! |---|---|
//! | [`wire`] | frame codec for events and acknowledgements |
//! | [`local`] | [`LocalCluster`] in-memory backend |

pub mod local;
pub mod wire;

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::entity::EntityId;
use crate::error::KernelResult;

pub use local::{LocalCluster, LocalEndpoint};
pub use wire::Frame;

/// Rank of a cooperating process.
pub type ProcessId = u32;

// ── Communicator ─────────────────────────────────────────────────────

/// Transport between the processes of one run.
///
/// The process set is fixed for the lifetime of a run; a peer that stops
/// answering is a transport failure, never a membership change.
pub trait Communicator: Send {
    /// Rank of this process.
    fn rank(&self) -> ProcessId;

    /// Number of cooperating processes.
    fn num_processes(&self) -> u32;

    /// Send a serialized frame to `peer`.
    fn send(&self, peer: ProcessId, frame: Bytes) -> KernelResult<()>;

    /// Return the next frame addressed to this process, if any.
    fn receive(&self) -> KernelResult<Option<Bytes>>;

    /// Block until every process has reached the barrier.
    fn barrier(&self) -> KernelResult<()>;

    /// Return the minimum of `value` across every process.
    ///
    /// Every process must call this the same number of times; the k-th
    /// call of each process forms one collective.
    fn all_reduce_min(&self, value: u64) -> KernelResult<u64>;
}

/// A communicator for a run that consists of a single process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> ProcessId {
        0
    }

    fn num_processes(&self) -> u32 {
        1
    }

    fn send(&self, peer: ProcessId, _frame: Bytes) -> KernelResult<()> {
        Err(crate::error::KernelError::ChannelClosed(peer))
    }

    fn receive(&self) -> KernelResult<Option<Bytes>> {
        Ok(None)
    }

    fn barrier(&self) -> KernelResult<()> {
        Ok(())
    }

    fn all_reduce_min(&self, value: u64) -> KernelResult<u64> {
        Ok(value)
    }
}

// ── Placement ─────────────────────────────────────────────────────────

/// Maps entities to the process that owns them.
///
/// Round-robin by entity id unless an explicit override is registered.
/// Every process of a run must use the same placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    processes: u32,
    overrides: BTreeMap<EntityId, ProcessId>,
}

impl Placement {
    /// Round-robin placement over `processes` ranks.
    pub fn round_robin(processes: u32) -> Self {
        Placement {
            processes: processes.max(1),
            overrides: BTreeMap::new(),
        }
    }

    /// Pin `entity` to `rank`.
    pub fn assign(mut self, entity: EntityId, rank: ProcessId) -> Self {
        self.overrides.insert(entity, rank);
        self
    }

    /// The rank that owns `entity`.
    pub fn rank_of(&self, entity: EntityId) -> ProcessId {
        match self.overrides.get(&entity) {
            Some(rank) => *rank,
            None => (entity.raw() % self.processes as u64) as ProcessId,
        }
    }

    /// Number of ranks this placement distributes over.
    pub fn num_processes(&self) -> u32 {
        self.processes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let placement = Placement::round_robin(3);
        assert_eq!(placement.rank_of(EntityId::new(0)), 0);
        assert_eq!(placement.rank_of(EntityId::new(4)), 1);
        assert_eq!(placement.rank_of(EntityId::new(8)), 2);
    }

    #[test]
    fn test_override_wins() {
        let placement = Placement::round_robin(2).assign(EntityId::new(4), 1);
        assert_eq!(placement.rank_of(EntityId::new(4)), 1);
        assert_eq!(placement.rank_of(EntityId::new(6)), 0);
    }

    #[test]
    fn test_single_process_reduces_to_own_value() {
        let comm = SingleProcess;
        assert_eq!(comm.all_reduce_min(17).unwrap(), 17);
        assert!(comm.receive().unwrap().is_none());
        assert!(comm.send(1, Bytes::new()).is_err());
    }
}
