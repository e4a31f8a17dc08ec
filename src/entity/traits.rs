//! `EntityState` and `Behavior` traits plus the `EntityContext` handed to
//! behaviors.

use std::any::Any;

use bytes::Bytes;

use crate::error::{KernelError, KernelResult};
use crate::event::{Event, EventRef};
use crate::time::VirtualTime;

use super::id::EntityId;

// ── EntityState ───────────────────────────────────────────────────────

/// Mutable state owned by exactly one entity.
///
/// The kernel checkpoints state after every batch and restores a
/// checkpoint on rollback, so `clone_state` must produce an independent
/// deep copy.
///
/// # Contract
///
/// Implementations **must**:
/// - Be deterministic: equal inputs produce equal states.
/// - Keep every value that influences future behavior inside the state
///   (including random number generators), so restoring a checkpoint
///   restores the entity's future exactly.
/// - Implement `clone_state` as `Box::new(self.clone())`.
pub trait EntityState: Send {
    /// Create a boxed deep copy of this state.
    fn clone_state(&self) -> Box<dyn EntityState>;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
    /// Mutable downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Deterministic fingerprint of the state, stable across processes.
    ///
    /// The default returns `0` (opt-out).
    fn state_hash(&self) -> u64 {
        0
    }

    /// Append this state's accelerator record to `out`.
    ///
    /// Only states of offloading entities need this. The number of values
    /// appended must equal the kernel's record width.
    fn write_record(&self, _out: &mut Vec<f32>) {}

    /// Load an accelerator result record back into the state.
    fn read_record(&mut self, _record: &[f32]) {}
}

impl std::fmt::Debug for dyn EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntityState({:#018x})", self.state_hash())
    }
}

// ── Behavior ──────────────────────────────────────────────────────────

/// The transition function of an entity.
///
/// A behavior holds no per-entity data; one instance is typically shared by
/// many entities, each of which passes its own state through the context.
pub trait Behavior: Send + Sync {
    /// Called once at the initialization instant, before any event is
    /// processed. Seeds the entity's first events.
    fn initialize(&self, _ctx: &mut EntityContext<'_>) -> KernelResult<()> {
        Ok(())
    }

    /// Apply one batch of events that share a receive time.
    ///
    /// `events` is ordered by `(sender, send_time, sequence)`. The entity's
    /// clock already equals the batch time.
    fn execute(&self, ctx: &mut EntityContext<'_>, events: &[EventRef]) -> KernelResult<()>;

    /// Called at teardown with the committed state.
    fn finalize(&self, _id: EntityId, _state: &dyn EntityState) {}
}

/// A behavior backed by a closure, useful for tests and small models.
impl<F> Behavior for F
where
    F: Fn(&mut EntityContext<'_>, &[EventRef]) -> KernelResult<()> + Send + Sync,
{
    fn execute(&self, ctx: &mut EntityContext<'_>, events: &[EventRef]) -> KernelResult<()> {
        (self)(ctx, events)
    }
}

// ── EntityContext ─────────────────────────────────────────────────────

/// Mutable context passed to a behavior for one batch.
///
/// Borrows the entity's state and collects the events it schedules; the
/// kernel takes over those events once the behavior returns.
pub struct EntityContext<'a> {
    pub(crate) id: EntityId,
    pub(crate) now: VirtualTime,
    pub(crate) state: &'a mut dyn EntityState,
    pub(crate) outputs: &'a mut Vec<Event>,
    pub(crate) next_sequence: &'a mut u64,
    pub(crate) offload_enabled: bool,
    pub(crate) offload_requested: bool,
}

impl<'a> EntityContext<'a> {
    /// The entity this batch belongs to.
    #[inline]
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Current virtual time (the batch time).
    #[inline]
    pub fn now(&self) -> VirtualTime {
        self.now
    }

    /// Borrow the state as its concrete type.
    pub fn state<T: EntityState + 'static>(&self) -> Option<&T> {
        self.state.as_any().downcast_ref::<T>()
    }

    /// Mutably borrow the state as its concrete type.
    pub fn state_mut<T: EntityState + 'static>(&mut self) -> Option<&mut T> {
        self.state.as_any_mut().downcast_mut::<T>()
    }

    /// Schedule an event for `receiver`, `delay` ticks from now.
    ///
    /// A zero delay is allowed toward other entities but not toward the
    /// entity itself, which would otherwise feed its own current batch.
    pub fn schedule(&mut self, receiver: EntityId, delay: u64, payload: Bytes) -> KernelResult<()> {
        let non_causal = KernelError::NonCausalEvent {
            sender: self.id,
            send_time: self.now,
            receive_time: self.now.saturating_advance(delay),
        };
        let receive_time = self.now.plus(delay).ok_or_else(|| non_causal.clone())?;
        if receiver == self.id && delay == 0 {
            return Err(non_causal);
        }
        let sequence = *self.next_sequence;
        let event = Event::new(self.id, receiver, self.now, receive_time, sequence, payload)?;
        *self.next_sequence += 1;
        self.outputs.push(event);
        Ok(())
    }

    /// Schedule an event for this entity, `delay` ticks from now.
    pub fn schedule_self(&mut self, delay: u64, payload: Bytes) -> KernelResult<()> {
        self.schedule(self.id, delay, payload)
    }

    /// Whether accelerator offload is available for this batch.
    #[inline]
    pub fn offload_enabled(&self) -> bool {
        self.offload_enabled
    }

    /// Ask for the rest of this step to be computed by the accelerator.
    ///
    /// Returns `false` when offload is unavailable; the behavior must then
    /// compute inline. When it returns `true` the entity is parked until
    /// its batch is reconciled.
    pub fn request_offload(&mut self) -> bool {
        if self.offload_enabled {
            self.offload_requested = true;
        }
        self.offload_requested
    }

    /// Number of events scheduled so far in this batch.
    pub fn scheduled(&self) -> usize {
        self.outputs.len()
    }
}
