//! Simulated entities and their optimistic execution.
//!
//! An [`Entity`] owns its state, its pending events and the histories it
//! needs to undo optimistic work: the events it has applied (input
//! history), the events it has sent (output history) and a checkpoint of
//! its state after every batch.
//!
//! # Module structure
//!
//! | Sub-module | Contents |
//! |---|---|
//! | [`id`] | [`EntityId`] newtype |
//! | [`traits`] | [`EntityState`], [`Behavior`], [`EntityContext`] |

pub mod id;
pub mod traits;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::error::{KernelError, KernelResult};
use crate::event::{Event, EventRef, PendingKey};
use crate::recycler::{EventRecycler, Role};
use crate::time::VirtualTime;

pub use id::EntityId;
pub use traits::{Behavior, EntityContext, EntityState};

// ── Supporting types ──────────────────────────────────────────────────

/// Execution mode of the rollback state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Forward,
    Rollback,
}

/// A saved copy of an entity's state at the end of the batch at `time`.
#[derive(Debug)]
pub struct Checkpoint {
    pub time: VirtualTime,
    pub state: Box<dyn EntityState>,
}

/// Identifies one offload request of one entity.
///
/// The epoch counts rollbacks, so a ticket issued before a rollback never
/// matches the entity again, even if it returns to the same LVT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadTicket {
    pub lvt: VirtualTime,
    pub epoch: u64,
}

/// Per-entity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EntityStats {
    /// Events applied, including ones later undone.
    pub processed: u64,
    /// Events applied below GVT, which can never be undone.
    pub committed: u64,
    /// Batches executed.
    pub batches: u64,
    /// Events scheduled by this entity.
    pub scheduled: u64,
    pub rollbacks: u64,
    /// Applied events returned to the pending set by rollbacks.
    pub reprocessed: u64,
    pub anti_messages_sent: u64,
    /// Pending events annihilated by an anti-message.
    pub annihilated: u64,
    pub offloads: u64,
}

impl std::ops::AddAssign for EntityStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.committed += other.committed;
        self.batches += other.batches;
        self.scheduled += other.scheduled;
        self.rollbacks += other.rollbacks;
        self.reprocessed += other.reprocessed;
        self.anti_messages_sent += other.anti_messages_sent;
        self.annihilated += other.annihilated;
        self.offloads += other.offloads;
    }
}

/// What one call to [`Entity::process_next_batch`] did.
#[derive(Debug)]
pub struct BatchOutcome {
    pub entity: EntityId,
    pub time: VirtualTime,
    /// Number of events in the batch.
    pub events: usize,
    /// Events scheduled by the behavior, to be routed by the caller.
    pub outputs: Vec<EventRef>,
    /// Set when the behavior asked for accelerator offload.
    pub offload: Option<OffloadTicket>,
}

// ── Entity ────────────────────────────────────────────────────────────

/// One simulated entity.
///
/// LVT is the receive time of the most recently applied batch. Every event
/// in `pending` is strictly after LVT; an event arriving at or before LVT
/// is a straggler and forces a rollback first.
pub struct Entity {
    id: EntityId,
    lvt: VirtualTime,
    gvt: VirtualTime,
    mode: Mode,
    state: Box<dyn EntityState>,
    behavior: Arc<dyn Behavior>,
    pending: BTreeMap<PendingKey, EventRef>,
    input_history: VecDeque<EventRef>,
    output_history: VecDeque<EventRef>,
    checkpoints: VecDeque<Checkpoint>,
    next_sequence: u64,
    epoch: u64,
    offload: Option<OffloadTicket>,
    initialized: bool,
    stats: EntityStats,
    recycler: Arc<EventRecycler>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("lvt", &self.lvt)
            .field("mode", &self.mode)
            .field("pending", &self.pending.len())
            .field("inputs", &self.input_history.len())
            .field("outputs", &self.output_history.len())
            .field("checkpoints", &self.checkpoints.len())
            .field("offload", &self.offload)
            .finish()
    }
}

impl Entity {
    /// Create an entity at the initialization instant.
    pub fn new(
        id: EntityId,
        state: Box<dyn EntityState>,
        behavior: Arc<dyn Behavior>,
        recycler: Arc<EventRecycler>,
    ) -> Self {
        Entity {
            id,
            lvt: VirtualTime::ZERO,
            gvt: VirtualTime::ZERO,
            mode: Mode::Forward,
            state,
            behavior,
            pending: BTreeMap::new(),
            input_history: VecDeque::new(),
            output_history: VecDeque::new(),
            checkpoints: VecDeque::new(),
            next_sequence: 0,
            epoch: 0,
            offload: None,
            initialized: false,
            stats: EntityStats::default(),
            recycler,
        }
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Local virtual time.
    pub fn lvt(&self) -> VirtualTime {
        self.lvt
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn stats(&self) -> EntityStats {
        self.stats
    }

    pub fn state(&self) -> &dyn EntityState {
        &*self.state
    }

    /// Downcast the state for inspection.
    pub fn state_as<T: EntityState + 'static>(&self) -> Option<&T> {
        self.state.as_any().downcast_ref::<T>()
    }

    /// Receive time of the earliest pending event, or `INFINITY`.
    pub fn next_event_time(&self) -> VirtualTime {
        self.pending
            .keys()
            .next()
            .map(|k| k.receive_time)
            .unwrap_or(VirtualTime::INFINITY)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the entity has pending events or waits on an offload.
    pub fn has_work(&self) -> bool {
        !self.pending.is_empty() || self.offload.is_some()
    }

    /// The bound this entity places on GVT, or `None` when it has no work.
    ///
    /// An entity with work holds GVT at its LVT. An LVT left below the
    /// published GVT (an idle entity woken by a new event, or a rollback
    /// onto the checkpoint kept below GVT) counts as that GVT, since no
    /// event below it can arrive any more.
    pub fn gvt_bound(&self) -> Option<VirtualTime> {
        if !self.has_work() {
            return None;
        }
        Some(self.lvt.max(self.gvt).min(self.next_event_time()))
    }

    /// Applied events still retained for rollback, oldest first.
    pub fn input_history(&self) -> impl Iterator<Item = &EventRef> {
        self.input_history.iter()
    }

    /// Sent events still retained for cancellation, oldest first.
    pub fn output_history(&self) -> impl Iterator<Item = &EventRef> {
        self.output_history.iter()
    }

    /// Times of the retained checkpoints, oldest first.
    pub fn checkpoint_times(&self) -> Vec<VirtualTime> {
        self.checkpoints.iter().map(|c| c.time).collect()
    }

    /// The outstanding offload request, if the entity is parked.
    pub fn offload_ticket(&self) -> Option<OffloadTicket> {
        self.offload
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Run the behavior's `initialize` hook at `ZERO` and take the first
    /// checkpoint. Returns the events it scheduled.
    pub fn initialize(&mut self) -> KernelResult<Vec<EventRef>> {
        let behavior = Arc::clone(&self.behavior);
        let mut outputs = Vec::new();
        let mut ctx = EntityContext {
            id: self.id,
            now: VirtualTime::ZERO,
            state: &mut *self.state,
            outputs: &mut outputs,
            next_sequence: &mut self.next_sequence,
            offload_enabled: false,
            offload_requested: false,
        };
        behavior.initialize(&mut ctx)?;
        self.initialized = true;
        self.save_checkpoint();
        Ok(self.record_outputs(outputs))
    }

    /// Call the behavior's `finalize` hook with the current state.
    pub fn finalize(&self) {
        self.behavior.finalize(self.id, &*self.state);
    }

    /// Release every event this entity still references.
    pub fn teardown(&mut self) {
        for (_, event) in std::mem::take(&mut self.pending) {
            self.recycler.release(&event, Role::Input);
        }
        for event in self.input_history.drain(..) {
            self.recycler.release(&event, Role::Input);
        }
        for event in self.output_history.drain(..) {
            self.recycler.release(&event, Role::Output);
        }
    }

    // ── Forward execution ──────────────────────────────────────

    /// Apply every pending event that shares the minimum receive time.
    ///
    /// Returns `None` if nothing is pending. With `offload_enabled` the
    /// behavior may request offload, in which case the entity is parked:
    /// no checkpoint is taken until [`complete_offload`](Self::complete_offload).
    pub fn process_next_batch(&mut self, offload_enabled: bool) -> KernelResult<Option<BatchOutcome>> {
        let time = self.next_event_time();
        if time.is_infinite() {
            return Ok(None);
        }
        let rest = self.pending.split_off(&PendingKey {
            receive_time: time,
            sender: EntityId::new(u64::MAX),
            send_time: VirtualTime::INFINITY,
            sequence: u64::MAX,
        });
        let batch: Vec<EventRef> = std::mem::replace(&mut self.pending, rest)
            .into_values()
            .collect();
        // The sentinel key compares greater than any real key at `time`.
        debug_assert!(batch.iter().all(|e| e.receive_time == time));
        debug_assert!(time > self.lvt);

        self.lvt = time;
        self.mode = Mode::Forward;
        trace!(entity = %self.id, %time, events = batch.len(), "processing batch");

        let behavior = Arc::clone(&self.behavior);
        let mut outputs = Vec::new();
        let mut ctx = EntityContext {
            id: self.id,
            now: time,
            state: &mut *self.state,
            outputs: &mut outputs,
            next_sequence: &mut self.next_sequence,
            offload_enabled,
            offload_requested: false,
        };
        behavior.execute(&mut ctx, &batch)?;
        let offload_requested = ctx.offload_requested;

        let events = batch.len();
        self.stats.processed += events as u64;
        self.stats.batches += 1;
        self.input_history.extend(batch);

        let offload = if offload_requested {
            let ticket = OffloadTicket {
                lvt: time,
                epoch: self.epoch,
            };
            self.offload = Some(ticket);
            self.stats.offloads += 1;
            Some(ticket)
        } else {
            self.save_checkpoint();
            None
        };

        Ok(Some(BatchOutcome {
            entity: self.id,
            time,
            events,
            outputs: self.record_outputs(outputs),
            offload,
        }))
    }

    /// Load the accelerator's result record, checkpoint and unpark.
    pub fn complete_offload(&mut self, record: &[f32]) {
        self.state.read_record(record);
        self.offload = None;
        self.save_checkpoint();
    }

    fn save_checkpoint(&mut self) {
        self.checkpoints.push_back(Checkpoint {
            time: self.lvt,
            state: self.state.clone_state(),
        });
    }

    fn record_outputs(&mut self, outputs: Vec<Event>) -> Vec<EventRef> {
        outputs
            .into_iter()
            .map(|event| {
                let event = event.into_ref();
                event.acquire(Role::Output);
                self.output_history.push_back(Arc::clone(&event));
                self.stats.scheduled += 1;
                event
            })
            .collect()
    }

    // ── Delivery ───────────────────────────────────────────────

    /// Accept an event or anti-message addressed to this entity.
    ///
    /// Returns the anti-messages produced by any rollback this delivery
    /// forced; the caller routes them.
    pub fn deliver(&mut self, event: EventRef) -> KernelResult<Vec<EventRef>> {
        if event.receive_time < self.gvt {
            error!(entity = %self.id, event = %event, gvt = %self.gvt, "event below GVT");
            return Err(KernelError::StragglerBelowGvt {
                entity: self.id,
                straggler: event.receive_time,
                gvt: self.gvt,
            });
        }
        if event.anti {
            return self.annihilate(&event);
        }

        let antis = if event.receive_time <= self.lvt {
            self.rollback_to(event.receive_time)?
        } else {
            Vec::new()
        };
        event.acquire(Role::Input);
        self.pending.insert(event.pending_key(), event);
        Ok(antis)
    }

    fn annihilate(&mut self, anti: &EventRef) -> KernelResult<Vec<EventRef>> {
        let key = anti.pending_key();
        if let Some(cancelled) = self.pending.remove(&key) {
            trace!(entity = %self.id, event = %cancelled, "annihilated pending event");
            self.recycler.release(&cancelled, Role::Input);
            self.stats.annihilated += 1;
            return Ok(Vec::new());
        }

        let identity = anti.key();
        let applied = anti.receive_time <= self.lvt
            && self.input_history.iter().any(|e| e.key() == identity);
        if !applied {
            error!(entity = %self.id, anti = %anti, lvt = %self.lvt, "anti-message has no matching event");
            return Err(KernelError::OrphanAntiMessage {
                entity: self.id,
                key: identity,
            });
        }

        let antis = self.rollback_to(anti.receive_time)?;
        match self.pending.remove(&key) {
            Some(cancelled) => {
                self.recycler.release(&cancelled, Role::Input);
                self.stats.annihilated += 1;
            }
            None => {
                return Err(KernelError::OrphanAntiMessage {
                    entity: self.id,
                    key: identity,
                })
            }
        }
        Ok(antis)
    }

    // ── Rollback ───────────────────────────────────────────────

    /// Undo every batch at or after `straggler`.
    ///
    /// Restores the newest checkpoint strictly before `straggler`, cancels
    /// every event sent after the restored time and returns every event
    /// applied after it to the pending set. Self-addressed cancellations
    /// are resolved locally; anti-messages for other entities are returned.
    pub fn rollback_to(&mut self, straggler: VirtualTime) -> KernelResult<Vec<EventRef>> {
        let Some(index) = self.checkpoints.iter().rposition(|c| c.time < straggler) else {
            error!(entity = %self.id, %straggler, "no checkpoint to restore");
            return Err(KernelError::MissingCheckpoint {
                entity: self.id,
                straggler,
            });
        };
        self.mode = Mode::Rollback;
        self.checkpoints.truncate(index + 1);
        let checkpoint = &self.checkpoints[index];
        let restored = checkpoint.time;
        let from = self.lvt;
        self.state = checkpoint.state.clone_state();
        self.lvt = restored;
        self.offload = None;
        self.epoch += 1;
        self.stats.rollbacks += 1;

        let mut antis = Vec::new();
        let mut cancelled_self = HashSet::new();
        while let Some(sent) = self.output_history.back() {
            if sent.send_time <= restored {
                break;
            }
            let Some(sent) = self.output_history.pop_back() else {
                break;
            };
            if sent.receiver == self.id {
                match self.pending.remove(&sent.pending_key()) {
                    Some(pending) => self.recycler.release(&pending, Role::Input),
                    None => {
                        cancelled_self.insert(sent.key());
                    }
                }
            } else {
                antis.push(sent.anti_message().into_ref());
                self.stats.anti_messages_sent += 1;
            }
            self.recycler.release(&sent, Role::Output);
        }

        let mut reprocess = 0u64;
        while let Some(applied) = self.input_history.back() {
            if applied.receive_time <= restored {
                break;
            }
            let Some(applied) = self.input_history.pop_back() else {
                break;
            };
            if cancelled_self.remove(&applied.key()) {
                self.recycler.release(&applied, Role::Input);
            } else {
                self.pending.insert(applied.pending_key(), applied);
                reprocess += 1;
            }
        }
        self.stats.reprocessed += reprocess;
        self.mode = Mode::Forward;

        debug!(
            entity = %self.id,
            %straggler,
            %from,
            %restored,
            reprocess,
            anti_messages = antis.len(),
            "rolled back"
        );
        Ok(antis)
    }

    // ── Garbage collection ─────────────────────────────────────

    /// Discard history that no rollback can reach once GVT is `gvt`.
    ///
    /// Keeps the newest checkpoint strictly before `gvt`, since a straggler
    /// at exactly `gvt` restores it.
    pub fn collect_garbage(&mut self, gvt: VirtualTime) {
        self.gvt = self.gvt.max(gvt);
        let gvt = self.gvt;
        if let Some(keep) = self.checkpoints.iter().rposition(|c| c.time < gvt) {
            self.checkpoints.drain(..keep);
        }
        while self.input_history.front().is_some_and(|e| e.receive_time < gvt) {
            if let Some(event) = self.input_history.pop_front() {
                self.stats.committed += 1;
                self.recycler.release(&event, Role::Input);
            }
        }
        while self.output_history.front().is_some_and(|e| e.send_time < gvt) {
            if let Some(event) = self.output_history.pop_front() {
                self.recycler.release(&event, Role::Output);
            }
        }
    }
}
