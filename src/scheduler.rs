//! Entity scheduler.
//!
//! Owns the entity arena and an ordering structure over entities keyed by
//! `(next pending receive time, entity id)`. Each step removes the entity
//! with the globally minimum key, applies its whole batch at that time and
//! reinserts it. Ties on time break by entity id, so two runs over the same
//! events always step entities in the same order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::accel::OffloadHost;
use crate::config::KernelConfig;
use crate::entity::{
    BatchOutcome, Behavior, Entity, EntityId, EntityState, EntityStats, OffloadTicket,
};
use crate::error::{KernelError, KernelResult};
use crate::event::EventRef;
use crate::hash::hash_combine;
use crate::recycler::EventRecycler;
use crate::time::VirtualTime;

// ── ReadyQueue ────────────────────────────────────────────────────────

/// Ordering structure over entities with pending events.
///
/// An entity appears at most once, keyed by the receive time of its
/// earliest pending event. Entities with nothing pending are absent.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    order: BTreeSet<(VirtualTime, EntityId)>,
    keys: HashMap<EntityId, VirtualTime>,
}

impl ReadyQueue {
    /// Move `id` to `next`, or drop it when `next` is `INFINITY`.
    pub fn reposition(&mut self, id: EntityId, next: VirtualTime) {
        self.remove(id);
        if !next.is_infinite() {
            self.order.insert((next, id));
            self.keys.insert(id, next);
        }
    }

    /// Remove `id` from the ordering.
    pub fn remove(&mut self, id: EntityId) {
        if let Some(time) = self.keys.remove(&id) {
            self.order.remove(&(time, id));
        }
    }

    /// Every queued entity, in key order.
    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.order.iter().map(|(_, id)| *id)
    }

    /// The entity with the minimum key.
    pub fn first(&self) -> Option<(VirtualTime, EntityId)> {
        self.order.first().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ── Step ──────────────────────────────────────────────────────────────

/// Result of one [`Scheduler::process_next_agent_events`] call.
#[derive(Debug)]
pub enum Step {
    /// An entity applied a batch.
    Processed(BatchOutcome),
    /// The next batch lies beyond the optimism window; nothing ran.
    Deferred { entity: EntityId, time: VirtualTime },
    /// No entity has pending work.
    Idle,
}

// ── Scheduler ─────────────────────────────────────────────────────────

/// Single-threaded scheduler over the entities of one process.
///
/// Entities sit behind a mutex so the same arena can be shared with the
/// worker pool for a parallel phase; sequential access goes through
/// `get_mut` and never locks.
#[derive(Debug)]
pub struct Scheduler {
    entities: BTreeMap<EntityId, Mutex<Entity>>,
    ready: ReadyQueue,
    /// Entities waiting for an accelerator batch.
    parked: BTreeSet<EntityId>,
    recycler: Arc<EventRecycler>,
    time_window: Option<u64>,
    end_time: VirtualTime,
    gvt: VirtualTime,
    horizon: VirtualTime,
    offload_enabled: bool,
}

impl Scheduler {
    /// Create an empty scheduler for `config`.
    pub fn new(config: &KernelConfig, recycler: Arc<EventRecycler>) -> Self {
        Scheduler {
            entities: BTreeMap::new(),
            ready: ReadyQueue::default(),
            parked: BTreeSet::new(),
            recycler,
            time_window: config.time_window,
            end_time: config.end_time,
            gvt: VirtualTime::ZERO,
            horizon: VirtualTime::ZERO,
            offload_enabled: config.execution.offload_enabled(),
        }
    }

    /// Register an entity. It is initialized by [`initialize`](Self::initialize).
    pub fn register(
        &mut self,
        id: EntityId,
        state: Box<dyn EntityState>,
        behavior: Arc<dyn Behavior>,
    ) -> KernelResult<()> {
        if self.entities.contains_key(&id) {
            return Err(KernelError::EntityAlreadyRegistered(id));
        }
        let entity = Entity::new(id, state, behavior, Arc::clone(&self.recycler));
        self.entities.insert(id, Mutex::new(entity));
        Ok(())
    }

    /// Initialize every entity not yet initialized, in id order.
    ///
    /// Returns the seed events for the caller to route.
    pub fn initialize(&mut self) -> KernelResult<Vec<EventRef>> {
        let mut seeded = Vec::new();
        for slot in self.entities.values_mut() {
            let entity = slot.get_mut();
            if !entity.is_initialized() {
                seeded.extend(entity.initialize()?);
            }
        }
        Ok(seeded)
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Lock an entity for inspection.
    pub fn entity(&self, id: EntityId) -> Option<MutexGuard<'_, Entity>> {
        self.entities.get(&id).map(|slot| slot.lock())
    }

    /// Exclusive access to an entity.
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id).map(|slot| slot.get_mut())
    }

    /// Registered entity ids in ascending order.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn is_parked(&self, id: EntityId) -> bool {
        self.parked.contains(&id)
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Last GVT this scheduler was told about.
    pub fn gvt(&self) -> VirtualTime {
        self.gvt
    }

    pub fn time_window(&self) -> Option<u64> {
        self.time_window
    }

    pub fn end_time(&self) -> VirtualTime {
        self.end_time
    }

    /// Receive time of the next runnable batch, or `INFINITY`.
    pub fn next_event_time(&self) -> VirtualTime {
        self.ready
            .first()
            .map(|(time, _)| time)
            .unwrap_or(VirtualTime::INFINITY)
    }

    /// Lower bound this process's entities place on GVT: the minimum
    /// [`Entity::gvt_bound`] over entities with work, runnable or parked.
    pub fn local_min(&self) -> VirtualTime {
        self.entities
            .values()
            .filter_map(|slot| slot.lock().gvt_bound())
            .min()
            .unwrap_or(VirtualTime::INFINITY)
    }

    /// Earliest unprocessed event time on this process, counting parked
    /// entities' pending events. The parked batches themselves are bounded
    /// by the batch manager.
    pub fn event_horizon(&self) -> VirtualTime {
        let parked = self
            .parked
            .iter()
            .filter_map(|id| self.entities.get(id))
            .map(|slot| slot.lock().next_event_time())
            .min()
            .unwrap_or(VirtualTime::INFINITY);
        self.next_event_time().min(parked)
    }

    /// Record the global event horizon of the last GVT round. The
    /// optimism window is measured from it.
    pub fn set_horizon(&mut self, horizon: VirtualTime) {
        self.horizon = horizon;
    }

    /// Base of the optimism window: the last global event horizon, never
    /// below GVT.
    pub fn window_base(&self) -> VirtualTime {
        self.horizon.max(self.gvt)
    }

    /// Whether the next batch would be deferred by the optimism window.
    fn beyond_window(&self, time: VirtualTime) -> bool {
        match self.time_window {
            Some(window) => time > self.window_base().saturating_advance(window),
            None => false,
        }
    }

    // ── Scheduling ─────────────────────────────────────────────

    /// Deliver an event (or anti-message) to its local receiver and
    /// reposition the receiver.
    ///
    /// Events at or beyond the end time and events for unknown receivers
    /// are dropped with a log line. Returns anti-messages produced by a
    /// rollback of the receiver.
    pub fn schedule_event(&mut self, event: EventRef) -> KernelResult<Vec<EventRef>> {
        if event.receive_time >= self.end_time {
            trace!(event = %event, end = %self.end_time, "dropped past end time");
            return Ok(Vec::new());
        }
        let id = event.receiver;
        let Some(slot) = self.entities.get_mut(&id) else {
            warn!(entity = %id, event = %event, "receiver not registered, dropping event");
            return Ok(Vec::new());
        };
        let entity = slot.get_mut();
        let antis = entity.deliver(event)?;
        let next = entity.next_event_time();
        let still_parked = entity.offload_ticket().is_some();

        if self.parked.contains(&id) {
            if !still_parked {
                self.parked.remove(&id);
                self.ready.reposition(id, next);
            }
        } else {
            self.ready.reposition(id, next);
        }
        Ok(antis)
    }

    /// Run the entity with the globally minimum pending receive time.
    ///
    /// The entity's whole batch at that time is applied atomically. An
    /// entity that requested offload is parked instead of reinserted.
    pub fn process_next_agent_events(&mut self) -> KernelResult<Step> {
        let Some((time, id)) = self.ready.first() else {
            return Ok(Step::Idle);
        };
        if self.beyond_window(time) {
            trace!(entity = %id, %time, base = %self.window_base(), "deferred by time window");
            return Ok(Step::Deferred { entity: id, time });
        }
        self.ready.remove(id);

        let offload_enabled = self.offload_enabled;
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(KernelError::EntityNotFound(id))?
            .get_mut();
        let outcome = entity.process_next_batch(offload_enabled)?;
        let next = entity.next_event_time();

        match outcome {
            Some(outcome) => {
                if outcome.offload.is_some() {
                    self.parked.insert(id);
                } else {
                    self.ready.reposition(id, next);
                }
                Ok(Step::Processed(outcome))
            }
            None => Ok(Step::Idle),
        }
    }

    /// Roll `id` back to just before `time` and make it runnable again.
    pub fn force_rollback(&mut self, id: EntityId, time: VirtualTime) -> KernelResult<Vec<EventRef>> {
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(KernelError::EntityNotFound(id))?
            .get_mut();
        let antis = entity.rollback_to(time)?;
        let next = entity.next_event_time();
        self.parked.remove(&id);
        self.ready.reposition(id, next);
        Ok(antis)
    }

    // ── GVT and garbage collection ─────────────────────────────

    /// Publish `gvt` to every entity and discard history below it.
    pub fn collect_garbage(&mut self, gvt: VirtualTime) {
        self.gvt = self.gvt.max(gvt);
        for slot in self.entities.values_mut() {
            slot.get_mut().collect_garbage(self.gvt);
        }
    }

    // ── Reporting ──────────────────────────────────────────────

    /// Combined fingerprint of every entity's state, in id order.
    pub fn state_hash(&self) -> u64 {
        self.fingerprints()
            .into_iter()
            .fold(0, |h, (id, hash)| hash_combine(h, hash_combine(id.raw(), hash)))
    }

    /// Per-entity state fingerprints.
    pub fn fingerprints(&self) -> BTreeMap<EntityId, u64> {
        self.entities
            .iter()
            .map(|(id, slot)| (*id, slot.lock().state().state_hash()))
            .collect()
    }

    /// Counters summed over every entity.
    pub fn stats(&self) -> EntityStats {
        let mut total = EntityStats::default();
        for slot in self.entities.values() {
            total += slot.lock().stats();
        }
        total
    }

    /// Run every entity's `finalize` hook and release all event references.
    pub fn finalize(&mut self) {
        for slot in self.entities.values_mut() {
            let entity = slot.get_mut();
            entity.finalize();
            entity.teardown();
        }
        self.ready = ReadyQueue::default();
        self.parked.clear();
    }

    /// Split into the shared arena and the ordering for a parallel phase.
    pub(crate) fn split_for_workers(&mut self) -> (&BTreeMap<EntityId, Mutex<Entity>>, &mut ReadyQueue) {
        (&self.entities, &mut self.ready)
    }
}

// ── Offload host ──────────────────────────────────────────────────────

impl OffloadHost for Scheduler {
    fn offload_ticket(&self, id: EntityId) -> Option<OffloadTicket> {
        self.entities.get(&id)?.lock().offload_ticket()
    }

    fn write_record(&self, id: EntityId, out: &mut Vec<f32>) -> KernelResult<()> {
        let slot = self.entities.get(&id).ok_or(KernelError::EntityNotFound(id))?;
        slot.lock().state().write_record(out);
        Ok(())
    }

    fn complete_offload(&mut self, id: EntityId, record: &[f32]) -> KernelResult<()> {
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(KernelError::EntityNotFound(id))?
            .get_mut();
        entity.complete_offload(record);
        let next = entity.next_event_time();
        self.parked.remove(&id);
        self.ready.reposition(id, next);
        Ok(())
    }

    fn abandon_offload(&mut self, id: EntityId, lvt: VirtualTime) -> KernelResult<Vec<EventRef>> {
        self.force_rollback(id, lvt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionMode;
    use crate::entity::EntityContext;
    use crate::event::Event;
    use bytes::Bytes;
    use std::any::Any;

    #[derive(Debug, Clone, Default)]
    struct Count(u64);

    impl EntityState for Count {
        fn clone_state(&self) -> Box<dyn EntityState> {
            Box::new(self.clone())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
        fn state_hash(&self) -> u64 {
            self.0
        }
    }

    fn counting() -> Arc<dyn Behavior> {
        Arc::new(
            |ctx: &mut EntityContext<'_>, events: &[EventRef]| -> KernelResult<()> {
                if let Some(count) = ctx.state_mut::<Count>() {
                    count.0 += events.len() as u64;
                }
                if ctx.offload_enabled() {
                    ctx.request_offload();
                }
                Ok(())
            },
        )
    }

    fn scheduler(config: KernelConfig, ids: &[u64]) -> Scheduler {
        let mut s = Scheduler::new(&config, Arc::new(EventRecycler::new()));
        for id in ids {
            s.register(EntityId::new(*id), Box::new(Count::default()), counting())
                .unwrap();
        }
        assert!(s.initialize().unwrap().is_empty());
        s
    }

    fn event(receiver: u64, recv: u64, seq: u64) -> EventRef {
        Event::new(
            EntityId::new(100),
            EntityId::new(receiver),
            VirtualTime::ZERO,
            VirtualTime::new(recv),
            seq,
            Bytes::new(),
        )
        .unwrap()
        .into_ref()
    }

    fn processed(step: Step) -> BatchOutcome {
        match step {
            Step::Processed(outcome) => outcome,
            other => panic!("expected a processed batch, got {other:?}"),
        }
    }

    #[test]
    fn test_picks_global_minimum_then_entity_id() {
        let mut s = scheduler(KernelConfig::default(), &[1, 2, 3]);
        s.schedule_event(event(3, 5, 0)).unwrap();
        s.schedule_event(event(2, 5, 1)).unwrap();
        s.schedule_event(event(1, 7, 2)).unwrap();

        let order: Vec<(u64, u64)> = (0..3)
            .map(|_| {
                let o = processed(s.process_next_agent_events().unwrap());
                (o.time.ticks(), o.entity.raw())
            })
            .collect();
        assert_eq!(order, vec![(5, 2), (5, 3), (7, 1)]);
        assert!(matches!(s.process_next_agent_events().unwrap(), Step::Idle));
    }

    #[test]
    fn test_batch_dequeues_all_events_at_time() {
        let mut s = scheduler(KernelConfig::default(), &[1]);
        s.schedule_event(event(1, 4, 0)).unwrap();
        s.schedule_event(event(1, 4, 1)).unwrap();
        s.schedule_event(event(1, 6, 2)).unwrap();

        let outcome = processed(s.process_next_agent_events().unwrap());
        assert_eq!(outcome.events, 2);
        assert_eq!(s.next_event_time(), VirtualTime::new(6));
        assert_eq!(s.entity(EntityId::new(1)).unwrap().state_as::<Count>().unwrap().0, 2);
    }

    #[test]
    fn test_unknown_receiver_is_a_logged_no_op() {
        let mut s = scheduler(KernelConfig::default(), &[1]);
        let antis = s.schedule_event(event(42, 3, 0)).unwrap();
        assert!(antis.is_empty());
        assert!(matches!(s.process_next_agent_events().unwrap(), Step::Idle));
    }

    #[test]
    fn test_time_window_defers_far_ahead_entity() {
        let config = KernelConfig::default().with_time_window(10);
        let mut s = scheduler(config, &[1]);
        s.schedule_event(event(1, 25, 0)).unwrap();

        match s.process_next_agent_events().unwrap() {
            Step::Deferred { entity, time } => {
                assert_eq!(entity, EntityId::new(1));
                assert_eq!(time, VirtualTime::new(25));
            }
            other => panic!("expected deferral, got {other:?}"),
        }
        // Still queued, unprocessed.
        assert_eq!(s.next_event_time(), VirtualTime::new(25));

        s.collect_garbage(VirtualTime::new(15));
        processed(s.process_next_agent_events().unwrap());
    }

    #[test]
    fn test_time_window_follows_event_horizon() {
        let config = KernelConfig::default().with_time_window(10);
        let mut s = scheduler(config, &[1]);
        s.schedule_event(event(1, 3, 0)).unwrap();
        processed(s.process_next_agent_events().unwrap());
        s.schedule_event(event(1, 30, 1)).unwrap();

        // The entity holds GVT at its LVT, far below its next event.
        assert_eq!(s.local_min(), VirtualTime::new(3));
        assert_eq!(s.event_horizon(), VirtualTime::new(30));
        s.collect_garbage(s.local_min());
        assert!(matches!(
            s.process_next_agent_events().unwrap(),
            Step::Deferred { .. }
        ));

        s.set_horizon(s.event_horizon());
        assert_eq!(s.window_base(), VirtualTime::new(30));
        let outcome = processed(s.process_next_agent_events().unwrap());
        assert_eq!(outcome.time, VirtualTime::new(30));
    }

    #[test]
    fn test_end_time_drops_events() {
        let config = KernelConfig::default().with_end_time(VirtualTime::new(10));
        let mut s = scheduler(config, &[1]);
        s.schedule_event(event(1, 10, 0)).unwrap();
        s.schedule_event(event(1, 9, 1)).unwrap();
        processed(s.process_next_agent_events().unwrap());
        assert!(matches!(s.process_next_agent_events().unwrap(), Step::Idle));
    }

    #[test]
    fn test_offloading_entity_is_parked_until_completed() {
        let config = KernelConfig::default().with_execution(ExecutionMode::Offload { asynchronous: false });
        let mut s = scheduler(config, &[1]);
        let id = EntityId::new(1);
        s.schedule_event(event(1, 3, 0)).unwrap();
        s.schedule_event(event(1, 8, 1)).unwrap();

        let outcome = processed(s.process_next_agent_events().unwrap());
        assert!(outcome.offload.is_some());
        assert!(s.is_parked(id));
        assert!(matches!(s.process_next_agent_events().unwrap(), Step::Idle));
        assert_eq!(s.local_min(), VirtualTime::new(3));
        assert_eq!(s.event_horizon(), VirtualTime::new(8));

        s.complete_offload(id, &[]).unwrap();
        assert!(!s.is_parked(id));
        assert_eq!(s.next_event_time(), VirtualTime::new(8));
    }

    #[test]
    fn test_straggler_unparks_entity() {
        let config = KernelConfig::default().with_execution(ExecutionMode::Offload { asynchronous: true });
        let mut s = scheduler(config, &[1]);
        let id = EntityId::new(1);
        s.schedule_event(event(1, 5, 0)).unwrap();
        processed(s.process_next_agent_events().unwrap());
        assert!(s.is_parked(id));

        s.schedule_event(event(1, 5, 1)).unwrap();
        assert!(!s.is_parked(id));
        assert_eq!(s.offload_ticket(id), None);
        assert_eq!(s.next_event_time(), VirtualTime::new(5));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut s = scheduler(KernelConfig::default(), &[1]);
        let err = s
            .register(EntityId::new(1), Box::new(Count::default()), counting())
            .unwrap_err();
        assert_eq!(err, KernelError::EntityAlreadyRegistered(EntityId::new(1)));
    }

    #[test]
    fn test_state_hash_reflects_progress() {
        let mut s = scheduler(KernelConfig::default(), &[1, 2]);
        let before = s.state_hash();
        s.schedule_event(event(2, 1, 0)).unwrap();
        processed(s.process_next_agent_events().unwrap());
        assert_ne!(s.state_hash(), before);
        assert_eq!(s.stats().processed, 1);
    }
}
