//! Global Virtual Time.
//!
//! GVT is the minimum, over every process, of the LVT of every entity that
//! still has work, the dispatch LVT of its open and in-flight accelerator
//! batches, and the events it sent to other processes that the receiver has
//! not yet acknowledged. No rollback can reach below GVT, so history older
//! than it can be reclaimed.
//!
//! The same round also reduces the event horizon, the earliest unprocessed
//! event time anywhere. It is never below GVT and anchors the optimism
//! window, so the entity holding the earliest event is always allowed to run.
//!
//! A round is two blocking `all_reduce_min` collectives. Every process
//! contributes while blocked in them, so the contributions form a
//! consistent cut.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::comm::Communicator;
use crate::error::{KernelError, KernelResult};
use crate::event::{Event, EventKey};
use crate::time::VirtualTime;

/// What one process contributes to a GVT round, before in-transit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalBounds {
    /// Minimum LVT over local entities with work and local batches.
    pub lvt: VirtualTime,
    /// Earliest unprocessed local event or batch.
    pub horizon: VirtualTime,
}

impl LocalBounds {
    /// Bounds where the LVT bound and the event horizon coincide.
    pub fn uniform(time: VirtualTime) -> Self {
        LocalBounds {
            lvt: time,
            horizon: time,
        }
    }
}

/// Coordinates GVT rounds for one process.
#[derive(Debug, Default)]
pub struct GvtManager {
    gvt: AtomicU64,
    horizon: AtomicU64,
    in_progress: AtomicBool,
    /// Remote events sent but not yet acknowledged, keyed for a cheap
    /// minimum: `(receive_time, key, anti)`.
    unacked: Mutex<BTreeSet<(VirtualTime, EventKey, bool)>>,
    rounds: AtomicU64,
}

/// Clears the in-progress flag when a round ends, however it ends.
struct RoundGuard<'a>(&'a AtomicBool);

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl GvtManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last published GVT. Never decreases.
    pub fn gvt(&self) -> VirtualTime {
        VirtualTime::new(self.gvt.load(Ordering::Acquire))
    }

    /// Global event horizon of the last completed round.
    pub fn horizon(&self) -> VirtualTime {
        VirtualTime::new(self.horizon.load(Ordering::Acquire))
    }

    /// Number of completed rounds.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    // ── In-transit tracking ────────────────────────────────────

    /// Record an event (or anti-message) handed to the transport.
    pub fn track_send(&self, event: &Event) {
        self.unacked
            .lock()
            .insert((event.receive_time, event.key(), event.anti));
    }

    /// The receiver has inserted the event identified by `key`.
    pub fn acknowledge(&self, key: &EventKey, anti: bool) {
        let removed = self.unacked.lock().remove(&(key.receive_time, *key, anti));
        if !removed {
            trace!(key = %key, anti, "acknowledgement for untracked event");
        }
    }

    /// Number of remote events not yet acknowledged.
    pub fn unacked_len(&self) -> usize {
        self.unacked.lock().len()
    }

    /// Minimum receive time over unacknowledged remote events.
    pub fn min_in_transit(&self) -> VirtualTime {
        self.unacked
            .lock()
            .first()
            .map(|(time, _, _)| *time)
            .unwrap_or(VirtualTime::INFINITY)
    }

    // ── Rounds ─────────────────────────────────────────────────

    /// Run one GVT round.
    ///
    /// Returns `Ok(None)` without contacting any peer if a round is already
    /// in progress. Otherwise contributes both bounds, each lowered to the
    /// earliest in-transit event, and publishes the reduced GVT and horizon.
    /// A GVT below the published one is a protocol violation; a peer that
    /// fails to contribute is a transport failure. Both leave the published
    /// values untouched.
    pub fn start_estimation(
        &self,
        comm: &dyn Communicator,
        local: LocalBounds,
    ) -> KernelResult<Option<VirtualTime>> {
        if self.in_progress.swap(true, Ordering::AcqRel) {
            trace!("GVT round already in progress");
            return Ok(None);
        }
        let _guard = RoundGuard(&self.in_progress);

        let in_transit = self.min_in_transit();
        let contribution = local.lvt.min(in_transit);
        let computed = VirtualTime::new(comm.all_reduce_min(contribution.ticks())?);
        let horizon = local.horizon.min(in_transit);
        let horizon = VirtualTime::new(comm.all_reduce_min(horizon.ticks())?).max(computed);

        let previous = self.gvt();
        if computed < previous {
            error!(%previous, %computed, rank = comm.rank(), "GVT regressed");
            return Err(KernelError::GvtRegression { previous, computed });
        }
        self.gvt.store(computed.ticks(), Ordering::Release);
        self.horizon.store(horizon.ticks(), Ordering::Release);
        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            round,
            gvt = %computed,
            %horizon,
            local_lvt = %local.lvt,
            %in_transit,
            rank = comm.rank(),
            "GVT published"
        );
        Ok(Some(computed))
    }
}
