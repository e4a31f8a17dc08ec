//! Accelerator batch manager.
//!
//! Entities that ask for offload at the same LVT share one open
//! [`BatchDescriptor`]. The descriptor is flushed when a request arrives for
//! a different LVT, when it reaches capacity, or when the scheduler moves
//! past its LVT. A flushed batch stays in flight until its dispatch
//! completes and it is reconciled against the entities' current tickets.
//!
//! A batch is all-or-nothing: if any member rolled back while it was in
//! flight, no member receives the kernel output and every member still
//! waiting on it is rolled back to recompute through forward execution.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace};

use super::{Accelerator, KernelDescriptor, KernelHandle, PendingDispatch};
use crate::config::{ExecutionMode, KernelConfig};
use crate::entity::{EntityId, OffloadTicket};
use crate::error::{KernelError, KernelResult};
use crate::event::EventRef;
use crate::time::VirtualTime;

/// The side of the kernel that owns offloading entities.
///
/// Implemented by [`Scheduler`](crate::scheduler::Scheduler); the batch
/// manager never touches entities directly.
pub trait OffloadHost {
    /// The outstanding ticket of `id`, or `None` if it is not parked.
    fn offload_ticket(&self, id: EntityId) -> Option<OffloadTicket>;

    /// Append the state record of `id` to `out`.
    fn write_record(&self, id: EntityId, out: &mut Vec<f32>) -> KernelResult<()>;

    /// Load a kernel result into `id` and unpark it.
    fn complete_offload(&mut self, id: EntityId, record: &[f32]) -> KernelResult<()>;

    /// Give up on the offload of `id` at `lvt` and roll it back so the batch
    /// is recomputed. Returns the anti-messages the rollback produced.
    fn abandon_offload(&mut self, id: EntityId, lvt: VirtualTime) -> KernelResult<Vec<EventRef>>;
}

/// One entity's slot in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchMember {
    pub entity: EntityId,
    pub ticket: OffloadTicket,
}

/// Entities dispatched together, all at the same LVT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    /// Dispatch LVT shared by every member.
    pub lvt: VirtualTime,
    /// GVT in effect at dispatch. Until the flush, the GVT at opening.
    pub gvt: VirtualTime,
    pub members: Vec<BatchMember>,
}

impl BatchDescriptor {
    fn open(lvt: VirtualTime, gvt: VirtualTime) -> Self {
        BatchDescriptor {
            lvt,
            gvt,
            members: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Batch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct BatchStats {
    pub dispatched: u64,
    /// Batches whose output was applied.
    pub committed: u64,
    /// Batches thrown away because a member rolled back.
    pub discarded: u64,
    /// Flushes forced by the capacity limit.
    pub eager_flushes: u64,
    /// Entities updated from committed batches.
    pub entities_committed: u64,
}

struct InFlight {
    descriptor: BatchDescriptor,
    dispatch: PendingDispatch,
}

/// Groups offload requests into batches and reconciles their results.
pub struct BatchManager {
    accel: Arc<dyn Accelerator>,
    kernel: KernelHandle,
    record_width: usize,
    capacity: usize,
    asynchronous: bool,
    open: Option<BatchDescriptor>,
    in_flight: VecDeque<InFlight>,
    last_dispatch_lvt: Option<VirtualTime>,
    stats: BatchStats,
}

impl std::fmt::Debug for BatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchManager")
            .field("accelerator", &self.accel.name())
            .field("record_width", &self.record_width)
            .field("capacity", &self.capacity)
            .field("asynchronous", &self.asynchronous)
            .field("open", &self.open)
            .field("in_flight", &self.in_flight.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl BatchManager {
    /// Compile `kernel` on `accel` and size batches from `config`.
    pub fn new(
        accel: Arc<dyn Accelerator>,
        kernel: &KernelDescriptor,
        config: &KernelConfig,
    ) -> KernelResult<Self> {
        let handle = accel.compile(kernel)?;
        let record_width = accel.record_width(handle)?;
        if record_width != kernel.record_width() {
            return Err(KernelError::RecordWidthMismatch {
                expected: kernel.record_width(),
                actual: record_width,
            });
        }
        let capacity = config.effective_batch_capacity();
        if capacity == 0 {
            return Err(KernelError::InvalidConfig(
                "batch capacity must be at least 1".into(),
            ));
        }
        let asynchronous = match config.execution {
            ExecutionMode::Offload { asynchronous } => asynchronous,
            ExecutionMode::Cooperative => false,
        };
        debug!(
            accelerator = accel.name(),
            kernel = kernel.template(),
            record_width,
            capacity,
            asynchronous,
            "Batch manager ready"
        );
        Ok(BatchManager {
            accel,
            kernel: handle,
            record_width,
            capacity,
            asynchronous,
            open: None,
            in_flight: VecDeque::new(),
            last_dispatch_lvt: None,
            stats: BatchStats::default(),
        })
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    /// LVT of the open descriptor, if any.
    pub fn open_lvt(&self) -> Option<VirtualTime> {
        self.open.as_ref().map(|b| b.lvt)
    }

    /// The open descriptor, if any.
    pub fn open_batch(&self) -> Option<&BatchDescriptor> {
        self.open.as_ref()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Dispatched batches not yet reconciled, oldest first.
    pub fn in_flight(&self) -> impl Iterator<Item = &BatchDescriptor> {
        self.in_flight.iter().map(|b| &b.descriptor)
    }

    /// Whether nothing is open or in flight.
    pub fn is_idle(&self) -> bool {
        self.open.is_none() && self.in_flight.is_empty()
    }

    /// Minimum dispatch LVT over the open and in-flight batches.
    ///
    /// Parked members have no checkpoint at this LVT yet, so it bounds GVT.
    pub fn min_lvt(&self) -> VirtualTime {
        self.in_flight
            .iter()
            .map(|b| b.descriptor.lvt)
            .chain(self.open_lvt())
            .min()
            .unwrap_or(VirtualTime::INFINITY)
    }

    // ── Requests ───────────────────────────────────────────────

    /// Add `entity` to the open batch, flushing first if the open batch is
    /// for a different LVT and afterwards if it is full.
    pub fn request_offload<H: OffloadHost + ?Sized>(
        &mut self,
        host: &mut H,
        entity: EntityId,
        ticket: OffloadTicket,
        gvt: VirtualTime,
    ) -> KernelResult<Vec<EventRef>> {
        let mut antis = Vec::new();
        if self.open_lvt().is_some_and(|lvt| lvt != ticket.lvt) {
            antis.extend(self.flush(host, gvt)?);
        }
        let batch = self
            .open
            .get_or_insert_with(|| BatchDescriptor::open(ticket.lvt, gvt));
        // A rollback and re-execution leaves a stale slot for the same entity.
        batch.members.retain(|m| m.entity != entity);
        batch.members.push(BatchMember { entity, ticket });
        trace!(%entity, lvt = %ticket.lvt, size = batch.members.len(), "offload requested");

        if batch.members.len() >= self.capacity {
            self.stats.eager_flushes += 1;
            antis.extend(self.flush(host, gvt)?);
        }
        Ok(antis)
    }

    /// Dispatch the open batch, stamping it with the current `gvt`.
    ///
    /// Members whose ticket went stale since they joined are dropped first.
    /// In synchronous mode the dispatch is joined and reconciled before
    /// returning.
    pub fn flush<H: OffloadHost + ?Sized>(
        &mut self,
        host: &mut H,
        gvt: VirtualTime,
    ) -> KernelResult<Vec<EventRef>> {
        let Some(mut descriptor) = self.open.take() else {
            return Ok(Vec::new());
        };
        descriptor.gvt = descriptor.gvt.max(gvt);
        descriptor
            .members
            .retain(|m| host.offload_ticket(m.entity) == Some(m.ticket));
        if descriptor.is_empty() {
            trace!(lvt = %descriptor.lvt, "flushed batch had no live members");
            return Ok(Vec::new());
        }

        let count = descriptor.len();
        let mut buffer = Vec::with_capacity(count * self.record_width);
        for member in &descriptor.members {
            let before = buffer.len();
            host.write_record(member.entity, &mut buffer)?;
            let written = buffer.len() - before;
            if written != self.record_width {
                return Err(KernelError::RecordWidthMismatch {
                    expected: self.record_width,
                    actual: written,
                });
            }
        }
        let dispatch = self.accel.dispatch(self.kernel, buffer, count)?;
        self.stats.dispatched += 1;
        self.last_dispatch_lvt = Some(descriptor.lvt);
        debug!(lvt = %descriptor.lvt, gvt = %descriptor.gvt, entities = count, "dispatched batch");
        self.in_flight.push_back(InFlight {
            descriptor,
            dispatch,
        });

        if self.asynchronous {
            Ok(Vec::new())
        } else {
            self.join_all(host)
        }
    }

    // ── Reconciliation ─────────────────────────────────────────

    /// Reconcile every batch at the front of the queue whose dispatch has
    /// completed, without blocking.
    pub fn reconcile_ready<H: OffloadHost + ?Sized>(
        &mut self,
        host: &mut H,
    ) -> KernelResult<Vec<EventRef>> {
        let mut antis = Vec::new();
        while self
            .in_flight
            .front_mut()
            .is_some_and(|b| b.dispatch.is_ready())
        {
            antis.extend(self.wait_oldest(host)?);
        }
        Ok(antis)
    }

    /// Block on the oldest in-flight batch and reconcile it.
    pub fn wait_oldest<H: OffloadHost + ?Sized>(
        &mut self,
        host: &mut H,
    ) -> KernelResult<Vec<EventRef>> {
        let Some(batch) = self.in_flight.pop_front() else {
            return Ok(Vec::new());
        };
        let output = batch.dispatch.wait()?;
        self.reconcile(host, batch.descriptor, &output)
    }

    /// Join every in-flight batch whose dispatch LVT is at or below `gvt`.
    pub fn join_through<H: OffloadHost + ?Sized>(
        &mut self,
        host: &mut H,
        gvt: VirtualTime,
    ) -> KernelResult<Vec<EventRef>> {
        let mut antis = Vec::new();
        while self.in_flight.iter().any(|b| b.descriptor.lvt <= gvt) {
            antis.extend(self.wait_oldest(host)?);
        }
        Ok(antis)
    }

    /// Join and reconcile every in-flight batch.
    pub fn join_all<H: OffloadHost + ?Sized>(&mut self, host: &mut H) -> KernelResult<Vec<EventRef>> {
        let mut antis = Vec::new();
        while !self.in_flight.is_empty() {
            antis.extend(self.wait_oldest(host)?);
        }
        Ok(antis)
    }

    fn reconcile<H: OffloadHost + ?Sized>(
        &mut self,
        host: &mut H,
        descriptor: BatchDescriptor,
        output: &[f32],
    ) -> KernelResult<Vec<EventRef>> {
        let expected = descriptor.len() * self.record_width;
        if output.len() != expected {
            return Err(KernelError::RecordWidthMismatch {
                expected,
                actual: output.len(),
            });
        }

        let superseded = self.last_dispatch_lvt.is_some_and(|last| last < descriptor.lvt);
        let rolled_back = descriptor
            .members
            .iter()
            .filter(|m| host.offload_ticket(m.entity) != Some(m.ticket))
            .count();

        if rolled_back == 0 && !superseded {
            for (member, record) in descriptor
                .members
                .iter()
                .zip(output.chunks_exact(self.record_width))
            {
                host.complete_offload(member.entity, record)?;
            }
            self.stats.committed += 1;
            self.stats.entities_committed += descriptor.len() as u64;
            trace!(lvt = %descriptor.lvt, entities = descriptor.len(), "committed batch");
            return Ok(Vec::new());
        }

        self.stats.discarded += 1;
        debug!(
            lvt = %descriptor.lvt,
            entities = descriptor.len(),
            rolled_back,
            superseded,
            "discarded stale batch"
        );
        let mut antis = Vec::new();
        for member in &descriptor.members {
            if host.offload_ticket(member.entity) == Some(member.ticket) {
                antis.extend(host.abandon_offload(member.entity, descriptor.lvt)?);
            }
        }
        Ok(antis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::CpuAccelerator;
    use std::collections::BTreeMap;

    /// Host holding one float per entity.
    #[derive(Default)]
    struct Host {
        tickets: BTreeMap<EntityId, OffloadTicket>,
        values: BTreeMap<EntityId, f32>,
        abandoned: Vec<(EntityId, VirtualTime)>,
    }

    impl Host {
        fn park(&mut self, id: u64, value: f32, lvt: u64) -> (EntityId, OffloadTicket) {
            let id = EntityId::new(id);
            let ticket = OffloadTicket {
                lvt: VirtualTime::new(lvt),
                epoch: 0,
            };
            self.tickets.insert(id, ticket);
            self.values.insert(id, value);
            (id, ticket)
        }

        fn roll_back(&mut self, id: EntityId) {
            self.tickets.remove(&id);
        }
    }

    impl OffloadHost for Host {
        fn offload_ticket(&self, id: EntityId) -> Option<OffloadTicket> {
            self.tickets.get(&id).copied()
        }

        fn write_record(&self, id: EntityId, out: &mut Vec<f32>) -> KernelResult<()> {
            out.push(*self.values.get(&id).ok_or(KernelError::EntityNotFound(id))?);
            Ok(())
        }

        fn complete_offload(&mut self, id: EntityId, record: &[f32]) -> KernelResult<()> {
            self.values.insert(id, record[0]);
            self.tickets.remove(&id);
            Ok(())
        }

        fn abandon_offload(&mut self, id: EntityId, lvt: VirtualTime) -> KernelResult<Vec<EventRef>> {
            self.tickets.remove(&id);
            self.abandoned.push((id, lvt));
            Ok(Vec::new())
        }
    }

    fn manager(capacity: usize, asynchronous: bool) -> BatchManager {
        let accel: Arc<dyn Accelerator> = Arc::new(CpuAccelerator::new(2).unwrap());
        let kernel = KernelDescriptor::builder("affine")
            .record_width(1)
            .param("scale", 2.0f32)
            .param("offset", 1.0f32)
            .build()
            .unwrap();
        let config = KernelConfig::default()
            .with_batch_capacity(capacity)
            .with_execution(ExecutionMode::Offload { asynchronous });
        BatchManager::new(accel, &kernel, &config).unwrap()
    }

    #[test]
    fn test_capacity_forces_dispatch_and_results_apply() {
        let mut host = Host::default();
        let mut batches = manager(2, true);
        let (a, ta) = host.park(1, 3.0, 10);
        let (b, tb) = host.park(2, 5.0, 10);

        batches.request_offload(&mut host, a, ta, VirtualTime::ZERO).unwrap();
        assert_eq!(batches.open_lvt(), Some(VirtualTime::new(10)));
        batches.request_offload(&mut host, b, tb, VirtualTime::ZERO).unwrap();
        assert_eq!(batches.open_lvt(), None);
        assert_eq!(batches.in_flight_len(), 1);
        assert_eq!(batches.stats().eager_flushes, 1);

        batches.join_all(&mut host).unwrap();
        assert_eq!(host.values[&a], 7.0);
        assert_eq!(host.values[&b], 11.0);
        assert_eq!(batches.stats().committed, 1);
        assert_eq!(batches.stats().entities_committed, 2);
        assert!(batches.is_idle());
    }

    #[test]
    fn test_rollback_in_flight_discards_whole_batch() {
        let mut host = Host::default();
        let mut batches = manager(2, true);
        let (a, ta) = host.park(1, 3.0, 10);
        let (b, tb) = host.park(2, 5.0, 10);
        batches.request_offload(&mut host, a, ta, VirtualTime::ZERO).unwrap();
        batches.request_offload(&mut host, b, tb, VirtualTime::ZERO).unwrap();

        host.roll_back(a);
        batches.join_all(&mut host).unwrap();

        assert_eq!(host.values[&a], 3.0);
        assert_eq!(host.values[&b], 5.0);
        assert_eq!(host.abandoned, vec![(b, VirtualTime::new(10))]);
        assert_eq!(batches.stats().discarded, 1);
        assert_eq!(batches.stats().committed, 0);
    }

    #[test]
    fn test_new_lvt_flushes_open_batch() {
        let mut host = Host::default();
        let mut batches = manager(8, true);
        let (a, ta) = host.park(1, 1.0, 4);
        let (b, tb) = host.park(2, 1.0, 6);
        batches.request_offload(&mut host, a, ta, VirtualTime::ZERO).unwrap();
        batches.request_offload(&mut host, b, tb, VirtualTime::ZERO).unwrap();

        assert_eq!(batches.in_flight_len(), 1);
        assert_eq!(batches.open_lvt(), Some(VirtualTime::new(6)));
        assert_eq!(batches.min_lvt(), VirtualTime::new(4));
    }

    #[test]
    fn test_stale_member_dropped_at_flush() {
        let mut host = Host::default();
        let mut batches = manager(8, true);
        let (a, ta) = host.park(1, 1.0, 4);
        let (b, tb) = host.park(2, 2.0, 4);
        batches.request_offload(&mut host, a, ta, VirtualTime::ZERO).unwrap();
        batches.request_offload(&mut host, b, tb, VirtualTime::ZERO).unwrap();
        host.roll_back(a);

        batches.flush(&mut host, VirtualTime::ZERO).unwrap();
        batches.join_all(&mut host).unwrap();
        assert_eq!(host.values[&a], 1.0);
        assert_eq!(host.values[&b], 5.0);
        assert_eq!(batches.stats().committed, 1);
        assert_eq!(batches.stats().entities_committed, 1);
    }

    #[test]
    fn test_all_members_stale_dispatches_nothing() {
        let mut host = Host::default();
        let mut batches = manager(8, true);
        let (a, ta) = host.park(1, 1.0, 4);
        batches.request_offload(&mut host, a, ta, VirtualTime::ZERO).unwrap();
        host.roll_back(a);
        batches.flush(&mut host, VirtualTime::ZERO).unwrap();
        assert_eq!(batches.stats().dispatched, 0);
        assert!(batches.is_idle());
    }

    #[test]
    fn test_lower_lvt_dispatch_supersedes_in_flight_batch() {
        let mut host = Host::default();
        let mut batches = manager(8, true);
        let (a, ta) = host.park(1, 1.0, 10);
        batches.request_offload(&mut host, a, ta, VirtualTime::ZERO).unwrap();
        batches.flush(&mut host, VirtualTime::ZERO).unwrap();
        let (b, tb) = host.park(2, 1.0, 7);
        batches.request_offload(&mut host, b, tb, VirtualTime::ZERO).unwrap();
        batches.flush(&mut host, VirtualTime::ZERO).unwrap();

        batches.join_all(&mut host).unwrap();
        assert_eq!(host.abandoned, vec![(a, VirtualTime::new(10))]);
        assert_eq!(host.values[&b], 3.0);
        assert_eq!(batches.stats().discarded, 1);
        assert_eq!(batches.stats().committed, 1);
    }

    #[test]
    fn test_descriptor_records_gvt_at_dispatch() {
        let mut host = Host::default();
        let mut batches = manager(8, true);
        let (a, ta) = host.park(1, 1.0, 12);
        batches.request_offload(&mut host, a, ta, VirtualTime::new(2)).unwrap();
        assert_eq!(batches.open_batch().unwrap().gvt, VirtualTime::new(2));

        batches.flush(&mut host, VirtualTime::new(9)).unwrap();
        let dispatched: Vec<_> = batches.in_flight().map(|b| (b.lvt, b.gvt)).collect();
        assert_eq!(dispatched, vec![(VirtualTime::new(12), VirtualTime::new(9))]);
    }

    #[test]
    fn test_synchronous_mode_reconciles_on_flush() {
        let mut host = Host::default();
        let mut batches = manager(8, false);
        let (a, ta) = host.park(1, 4.0, 2);
        batches.request_offload(&mut host, a, ta, VirtualTime::ZERO).unwrap();
        batches.flush(&mut host, VirtualTime::ZERO).unwrap();
        assert_eq!(batches.in_flight_len(), 0);
        assert_eq!(host.values[&a], 9.0);
    }

    #[test]
    fn test_join_through_only_waits_for_reachable_batches() {
        let mut host = Host::default();
        let mut batches = manager(8, true);
        let (a, ta) = host.park(1, 1.0, 3);
        batches.request_offload(&mut host, a, ta, VirtualTime::ZERO).unwrap();
        batches.flush(&mut host, VirtualTime::ZERO).unwrap();
        let (b, tb) = host.park(2, 1.0, 9);
        batches.request_offload(&mut host, b, tb, VirtualTime::ZERO).unwrap();
        batches.flush(&mut host, VirtualTime::ZERO).unwrap();

        batches.join_through(&mut host, VirtualTime::new(5)).unwrap();
        assert_eq!(host.values[&a], 3.0);
        assert_eq!(batches.in_flight_len(), 1);
        assert_eq!(batches.min_lvt(), VirtualTime::new(9));
    }
}
