//! Role-based reference counting and event recycling.
//!
//! An event is referenced in two roles: the *input* role is held while the
//! event sits in its receiver's pending set or input history, and the
//! *output* role is held while it sits in its sender's output history.
//! The `Arc` keeps the memory alive; the role counters decide when the
//! kernel is done with the event. Once both reach zero the event is
//! retired to the [`EventRecycler`], which reclaims it during garbage
//! collection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::event::{Event, EventRef};

/// Which history an event reference belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Input,
    Output,
}

/// Per-event role counters.
#[derive(Debug, Default)]
pub struct RoleCounts {
    input: AtomicU32,
    output: AtomicU32,
}

impl RoleCounts {
    fn counter(&self, role: Role) -> &AtomicU32 {
        match role {
            Role::Input => &self.input,
            Role::Output => &self.output,
        }
    }
}

impl Event {
    /// Take a reference in `role`.
    pub fn acquire(&self, role: Role) {
        self.roles.counter(role).fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference in `role`.
    ///
    /// Returns `true` when this release left both roles at zero, meaning
    /// the caller must retire the event.
    pub fn release(&self, role: Role) -> bool {
        let released = self
            .roles
            .counter(role)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            error!(event = %self, ?role, "released an event role that was not held");
            return false;
        }
        self.is_unreferenced()
    }

    /// Current input-role count.
    pub fn input_refs(&self) -> u32 {
        self.roles.input.load(Ordering::Acquire)
    }

    /// Current output-role count.
    pub fn output_refs(&self) -> u32 {
        self.roles.output.load(Ordering::Acquire)
    }

    /// `true` when neither role holds the event.
    pub fn is_unreferenced(&self) -> bool {
        self.input_refs() == 0 && self.output_refs() == 0
    }
}

// ── EventRecycler ─────────────────────────────────────────────────────

/// Collects retired events until the next garbage-collection pass.
///
/// Shared by every entity of a simulation instance. An event is only
/// reclaimed if it is still unreferenced when `collect` runs; an event
/// that was re-acquired in between stays alive.
#[derive(Debug, Default)]
pub struct EventRecycler {
    retired: Mutex<Vec<EventRef>>,
    reclaimed: AtomicU64,
}

impl EventRecycler {
    /// Create an empty recycler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Release `role` on `event`, retiring it if it is now unreferenced.
    pub fn release(&self, event: &EventRef, role: Role) {
        if event.release(role) {
            self.retire(event.clone());
        }
    }

    /// Hand an unreferenced event over for reclamation.
    pub fn retire(&self, event: EventRef) {
        trace!(event = %event, "retired");
        self.retired.lock().push(event);
    }

    /// Number of events waiting for the next `collect`.
    pub fn pending(&self) -> usize {
        self.retired.lock().len()
    }

    /// Total number of events reclaimed so far.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// Reclaim every retired event whose role counts are still zero.
    ///
    /// An event retired twice is reclaimed once. Returns the number of
    /// events reclaimed in this pass.
    pub fn collect(&self) -> usize {
        let retired = std::mem::take(&mut *self.retired.lock());
        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        let mut count = 0usize;
        for event in retired {
            if !seen.insert(Arc::as_ptr(&event)) {
                continue;
            }
            if event.is_unreferenced() {
                count += 1;
            } else {
                kept.push(event);
            }
        }
        if !kept.is_empty() {
            self.retired.lock().extend(kept);
        }
        self.reclaimed.fetch_add(count as u64, Ordering::Relaxed);
        count
    }
}
