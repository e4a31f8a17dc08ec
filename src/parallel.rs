//! Multi-worker execution.
//!
//! A parallel phase lends the scheduler's entity arena and ordering
//! structure to a pool of worker threads. A worker checks out the entity
//! with the minimum key, which makes it invisible to every other worker,
//! processes its batch without holding the ordering lock, then routes the
//! outputs and checks the entity back in.
//!
//! Events addressed to a checked-out entity cannot be delivered while its
//! worker owns it; they wait in a per-entity inbox that is drained at
//! check-in, under the ordering lock, before the entity becomes visible
//! again.
//!
//! Lock order is always ordering lock, then entity lock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::entity::{Entity, EntityId};
use crate::error::{KernelError, KernelResult};
use crate::event::EventRef;
use crate::scheduler::{ReadyQueue, Scheduler};
use crate::time::VirtualTime;

/// Result of a checkout attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkout {
    /// The worker now owns `entity` and must process its batch at `time`.
    Entity { entity: EntityId, time: VirtualTime },
    /// Nothing is runnable now, but a checked-out entity may produce work.
    Busy,
    /// The phase is over for this worker.
    Idle,
}

/// What one phase did.
#[derive(Debug, Default)]
pub struct PhaseReport {
    /// Batches processed.
    pub steps: u64,
    /// Events applied.
    pub events: u64,
    /// Events for receivers outside this process, in emission order.
    pub outbox: Vec<EventRef>,
}

struct OrderingState<'a> {
    ready: &'a mut ReadyQueue,
    /// Checked-out entities and their GVT bound when taken.
    checked_out: BTreeMap<EntityId, VirtualTime>,
    inboxes: BTreeMap<EntityId, Vec<EventRef>>,
    steps: u64,
}

/// The scheduler as seen by the workers of one phase.
pub struct SharedScheduler<'a> {
    entities: &'a BTreeMap<EntityId, Mutex<Entity>>,
    ordering: Mutex<OrderingState<'a>>,
    outbox: Mutex<Vec<EventRef>>,
    failure: Mutex<Option<KernelError>>,
    failed: AtomicBool,
    events: AtomicU64,
    window_base: VirtualTime,
    time_window: Option<u64>,
    end_time: VirtualTime,
    budget: u64,
}

impl<'a> SharedScheduler<'a> {
    /// Borrow `scheduler` for a phase of at most `budget` batches.
    pub fn new(scheduler: &'a mut Scheduler, budget: u64) -> Self {
        let window_base = scheduler.window_base();
        let time_window = scheduler.time_window();
        let end_time = scheduler.end_time();
        let (entities, ready) = scheduler.split_for_workers();
        SharedScheduler {
            entities,
            ordering: Mutex::new(OrderingState {
                ready,
                checked_out: BTreeMap::new(),
                inboxes: BTreeMap::new(),
                steps: 0,
            }),
            outbox: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            failed: AtomicBool::new(false),
            events: AtomicU64::new(0),
            window_base,
            time_window,
            end_time,
            budget,
        }
    }

    fn beyond_window(&self, time: VirtualTime) -> bool {
        match self.time_window {
            Some(window) => time > self.window_base.saturating_advance(window),
            None => false,
        }
    }

    /// Lower bound the phase's entities place on GVT, including entities
    /// currently checked out and events waiting in their inboxes.
    pub fn local_min(&self) -> VirtualTime {
        let ordering = self.ordering.lock();
        let ready = ordering
            .ready
            .ids()
            .filter_map(|id| self.entities.get(&id))
            .filter_map(|slot| slot.lock().gvt_bound())
            .min();
        let checked_out = ordering.checked_out.values().copied().min();
        let inboxed = ordering
            .inboxes
            .values()
            .flatten()
            .map(|e| e.receive_time)
            .min();
        [ready, checked_out, inboxed]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(VirtualTime::INFINITY)
    }

    /// Take the entity with the minimum key, if the phase allows it.
    pub fn checkout(&self) -> Checkout {
        if self.failed.load(Ordering::Acquire) {
            return Checkout::Idle;
        }
        let mut ordering = self.ordering.lock();
        let waiting = if ordering.checked_out.is_empty() {
            Checkout::Idle
        } else {
            Checkout::Busy
        };
        if ordering.steps >= self.budget {
            return Checkout::Idle;
        }
        let Some((time, entity)) = ordering.ready.first() else {
            return waiting;
        };
        if self.beyond_window(time) {
            return waiting;
        }
        let bound = self
            .entities
            .get(&entity)
            .and_then(|slot| slot.lock().gvt_bound())
            .unwrap_or(time);
        ordering.ready.remove(entity);
        ordering.checked_out.insert(entity, bound);
        ordering.steps += 1;
        Checkout::Entity { entity, time }
    }

    /// Process the batch of a checked-out entity, route its outputs and
    /// check it back in.
    pub fn run_checked_out(&self, id: EntityId) -> KernelResult<()> {
        let slot = self.entities.get(&id).ok_or(KernelError::EntityNotFound(id))?;
        let outcome = slot.lock().process_next_batch(false)?;
        let outputs = match outcome {
            Some(outcome) => {
                self.events.fetch_add(outcome.events as u64, Ordering::Relaxed);
                trace!(entity = %id, time = %outcome.time, events = outcome.events, "worker processed batch");
                outcome.outputs
            }
            None => Vec::new(),
        };
        let mut work: VecDeque<EventRef> = outputs.into();
        self.route_all(&mut work)?;

        let antis = self.check_in(id)?;
        work.extend(antis);
        self.route_all(&mut work)
    }

    /// Deliver events until `work` is empty. Anti-messages produced by
    /// rollbacks are appended to `work`.
    fn route_all(&self, work: &mut VecDeque<EventRef>) -> KernelResult<()> {
        while let Some(event) = work.pop_front() {
            work.extend(self.route(event)?);
        }
        Ok(())
    }

    fn route(&self, event: EventRef) -> KernelResult<Vec<EventRef>> {
        if event.receive_time >= self.end_time {
            return Ok(Vec::new());
        }
        let receiver = event.receiver;
        let Some(slot) = self.entities.get(&receiver) else {
            self.outbox.lock().push(event);
            return Ok(Vec::new());
        };
        let mut ordering = self.ordering.lock();
        if ordering.checked_out.contains_key(&receiver) {
            ordering.inboxes.entry(receiver).or_default().push(event);
            return Ok(Vec::new());
        }
        let mut entity = slot.lock();
        let antis = entity.deliver(event)?;
        ordering.ready.reposition(receiver, entity.next_event_time());
        Ok(antis)
    }

    fn check_in(&self, id: EntityId) -> KernelResult<Vec<EventRef>> {
        let slot = self.entities.get(&id).ok_or(KernelError::EntityNotFound(id))?;
        let mut ordering = self.ordering.lock();
        let mut entity = slot.lock();
        let mut antis = Vec::new();
        for event in ordering.inboxes.remove(&id).unwrap_or_default() {
            antis.extend(entity.deliver(event)?);
        }
        ordering.checked_out.remove(&id);
        ordering.ready.reposition(id, entity.next_event_time());
        Ok(antis)
    }

    fn fail(&self, err: KernelError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            error!(error = %err, "worker failed, stopping phase");
            *failure = Some(err);
        }
        self.failed.store(true, Ordering::Release);
    }

    /// End the phase, returning the first worker error if any.
    pub fn finish(self) -> KernelResult<PhaseReport> {
        if let Some(err) = self.failure.into_inner() {
            return Err(err);
        }
        let ordering = self.ordering.into_inner();
        debug_assert!(ordering.checked_out.is_empty());
        debug_assert!(ordering.inboxes.values().all(Vec::is_empty));
        Ok(PhaseReport {
            steps: ordering.steps,
            events: self.events.into_inner(),
            outbox: self.outbox.into_inner(),
        })
    }
}

// ── WorkerPool ────────────────────────────────────────────────────────

/// Threads that run parallel phases.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool with `workers` threads.
    pub fn new(workers: usize) -> KernelResult<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("worker-{}", i))
            .build()
            .map_err(|e| KernelError::InvalidConfig(format!("worker pool: {e}")))?;
        info!(workers, "Worker pool initialized");
        Ok(WorkerPool { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run workers against `shared` until none can make progress.
    pub fn run_phase(&self, shared: &SharedScheduler<'_>) {
        self.pool.scope(|scope| {
            for worker in 0..self.workers {
                scope.spawn(move |_| Self::worker_loop(worker, shared));
            }
        });
    }

    fn worker_loop(worker: usize, shared: &SharedScheduler<'_>) {
        let backoff = Backoff::new();
        let mut steps = 0u64;
        loop {
            match shared.checkout() {
                Checkout::Entity { entity, .. } => {
                    backoff.reset();
                    steps += 1;
                    if let Err(err) = shared.run_checked_out(entity) {
                        shared.fail(err);
                        break;
                    }
                }
                Checkout::Busy => backoff.snooze(),
                Checkout::Idle => break,
            }
        }
        debug!(worker, steps, "worker finished phase");
    }
}
