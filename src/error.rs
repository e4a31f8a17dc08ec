//! Structured error types for the kernel.
//!
//! All fallible public APIs return `Result<T, KernelError>`. Protocol
//! violations and transport failures are fatal: they mean an invariant of
//! the optimistic scheme is broken, and the run must stop with the
//! diagnostic carried by the error. Stale accelerator speculation and
//! time-window deferrals are not errors and never surface here.

use thiserror::Error;

use crate::comm::ProcessId;
use crate::entity::EntityId;
use crate::event::EventKey;
use crate::time::VirtualTime;

/// The top-level error type for the simulation kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    // ── Entity errors ─────────────────────────────────────

    /// An entity ID was referenced but is not registered locally.
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    /// Attempted to register an entity with an ID that is already in use.
    #[error("entity {0} is already registered")]
    EntityAlreadyRegistered(EntityId),

    /// Attempted to create an event that is received before it is sent,
    /// at the initialization instant, or with a zero delay to itself.
    #[error("non-causal event from {sender}: sent at {send_time}, received at {receive_time}")]
    NonCausalEvent {
        sender: EntityId,
        send_time: VirtualTime,
        receive_time: VirtualTime,
    },

    // ── Protocol violations (fatal) ───────────────────────

    /// An anti-message matched neither a pending nor an applied event.
    #[error("protocol violation: anti-message {key} has no matching event at {entity}")]
    OrphanAntiMessage { entity: EntityId, key: EventKey },

    /// A GVT round produced a value below the previously published GVT.
    #[error("protocol violation: GVT regressed from {previous} to {computed}")]
    GvtRegression {
        previous: VirtualTime,
        computed: VirtualTime,
    },

    /// A rollback found no checkpoint old enough to restore.
    #[error("protocol violation: {entity} has no checkpoint before straggler at {straggler}")]
    MissingCheckpoint {
        entity: EntityId,
        straggler: VirtualTime,
    },

    /// A straggler arrived below the committed horizon.
    #[error("protocol violation: straggler at {straggler} for {entity} is below GVT {gvt}")]
    StragglerBelowGvt {
        entity: EntityId,
        straggler: VirtualTime,
        gvt: VirtualTime,
    },

    // ── Transport failures (fatal) ────────────────────────

    /// A cooperating process did not answer within the collective timeout.
    #[error("transport failure: process {peer} unreachable during {operation}")]
    PeerUnreachable {
        peer: ProcessId,
        operation: &'static str,
    },

    /// The channel to a peer has been closed.
    #[error("transport failure: channel to process {0} closed")]
    ChannelClosed(ProcessId),

    /// A frame received from the transport could not be decoded.
    #[error("transport failure: malformed frame ({0})")]
    MalformedFrame(String),

    // ── Accelerator errors ────────────────────────────────

    /// A kernel descriptor failed validation before compilation.
    #[error("invalid kernel descriptor: {0}")]
    InvalidKernel(String),

    /// No kernel template is registered under the requested name.
    #[error("unknown kernel template {0:?}")]
    UnknownKernel(String),

    /// The accelerator failed to run a dispatch to completion.
    #[error("accelerator dispatch failed: {0}")]
    DispatchFailed(String),

    /// A state record does not match the kernel's record width.
    #[error("record width mismatch: kernel expects {expected}, state wrote {actual}")]
    RecordWidthMismatch { expected: usize, actual: usize },

    // ── Configuration errors ──────────────────────────────

    /// The kernel configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl KernelError {
    /// Returns `true` if this error must abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::OrphanAntiMessage { .. }
                | KernelError::GvtRegression { .. }
                | KernelError::MissingCheckpoint { .. }
                | KernelError::StragglerBelowGvt { .. }
                | KernelError::PeerUnreachable { .. }
                | KernelError::ChannelClosed(_)
                | KernelError::MalformedFrame(_)
        )
    }
}

/// Convenience alias for `Result<T, KernelError>`.
pub type KernelResult<T> = Result<T, KernelError>;
