//! Event system for the optimistic simulation kernel.
//!
//! Every interaction between entities is modeled as an `Event`. Events are
//! immutable after creation, shared by reference count between the
//! receiver's queues (input role) and the sender's output history (output
//! role), and cancelled only by a matching anti-message.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::entity::EntityId;
use crate::error::{KernelError, KernelResult};
use crate::recycler::RoleCounts;
use crate::time::VirtualTime;

// ── Event identity ───────────────────────────────────────────────────

/// The identity an anti-message uses to find the event it cancels.
///
/// `sequence` is minted by the sender and is strictly increasing per
/// sender, so two events with otherwise identical tuples never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EventKey {
    pub sender: EntityId,
    pub receiver: EntityId,
    pub send_time: VirtualTime,
    pub receive_time: VirtualTime,
    pub sequence: u64,
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}→{} sent {} recv {} #{}",
            self.sender, self.receiver, self.send_time, self.receive_time, self.sequence
        )
    }
}

// ── Pending ordering ─────────────────────────────────────────────────

/// Ordering key for an entity's pending set.
///
/// Smallest receive time first; events sharing a receive time form one
/// batch and are ordered by `(sender, send_time, sequence)` so that batch
/// composition is deterministic regardless of arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub receive_time: VirtualTime,
    pub sender: EntityId,
    pub send_time: VirtualTime,
    pub sequence: u64,
}

impl Ord for PendingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.receive_time
            .cmp(&other.receive_time)
            .then_with(|| self.sender.cmp(&other.sender))
            .then_with(|| self.send_time.cmp(&other.send_time))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for PendingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ── Event ─────────────────────────────────────────────────────────────

/// A single timestamped message between entities.
#[derive(Debug)]
pub struct Event {
    pub sender: EntityId,
    pub receiver: EntityId,
    pub send_time: VirtualTime,
    pub receive_time: VirtualTime,
    pub sequence: u64,
    /// `true` for an anti-message cancelling the event with the same key.
    pub anti: bool,
    /// Entity-defined payload; opaque to the kernel.
    pub payload: Bytes,
    pub(crate) roles: RoleCounts,
}

/// Shared handle to an event.
pub type EventRef = Arc<Event>;

impl Event {
    /// Create a positive event, checking causality.
    ///
    /// Rejects events received before they are sent and events received at
    /// the initialization instant.
    pub fn new(
        sender: EntityId,
        receiver: EntityId,
        send_time: VirtualTime,
        receive_time: VirtualTime,
        sequence: u64,
        payload: Bytes,
    ) -> KernelResult<Event> {
        if receive_time < send_time || receive_time == VirtualTime::ZERO || receive_time.is_infinite() {
            return Err(KernelError::NonCausalEvent {
                sender,
                send_time,
                receive_time,
            });
        }
        Ok(Event {
            sender,
            receiver,
            send_time,
            receive_time,
            sequence,
            anti: false,
            payload,
            roles: RoleCounts::default(),
        })
    }

    /// Rebuild an event from its wire fields without causality checks.
    pub(crate) fn from_parts(key: EventKey, anti: bool, payload: Bytes) -> Event {
        Event {
            sender: key.sender,
            receiver: key.receiver,
            send_time: key.send_time,
            receive_time: key.receive_time,
            sequence: key.sequence,
            anti,
            payload,
            roles: RoleCounts::default(),
        }
    }

    /// Build the anti-message that cancels this event.
    ///
    /// The anti-message carries the same identity and an empty payload.
    pub fn anti_message(&self) -> Event {
        Event::from_parts(self.key(), true, Bytes::new())
    }

    /// The identity of this event.
    pub fn key(&self) -> EventKey {
        EventKey {
            sender: self.sender,
            receiver: self.receiver,
            send_time: self.send_time,
            receive_time: self.receive_time,
            sequence: self.sequence,
        }
    }

    /// The ordering key of this event in the receiver's pending set.
    pub fn pending_key(&self) -> PendingKey {
        PendingKey {
            receive_time: self.receive_time,
            sender: self.sender,
            send_time: self.send_time,
            sequence: self.sequence,
        }
    }

    /// Wrap the event into a shared handle.
    pub fn into_ref(self) -> EventRef {
        Arc::new(self)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.anti {
            write!(f, "Anti({})", self.key())
        } else {
            write!(f, "Event({}, {} bytes)", self.key(), self.payload.len())
        }
    }
}
