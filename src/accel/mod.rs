//! Accelerator offload.
//!
//! Entities that need an expensive per-step computation can hand it to a
//! vector processor instead of computing inline. The [`BatchManager`]
//! gathers such entities into one batch per LVT, copies their state
//! records into a flat transfer buffer and issues one kernel dispatch for
//! the whole batch.
//!
//! ```text
//!  Entity ──request_offload──▶ BatchManager ──flush──▶ Accelerator
//!    ▲                              │                      │
//!    └──────── reconcile ◀──────────┴──── PendingDispatch ◀┘
//! ```
//!
//! # Module structure
//!
//! | Sub-module | Contents |
//! |---|---|
//! | [`kernel`] | [`KernelDescriptor`] builder, templates and parameters |
//! | [`cpu`] | [`CpuAccelerator`], a rayon-backed vector processor |
//! | [`batch`] | [`BatchManager`], [`BatchDescriptor`], [`OffloadHost`] |

pub mod batch;
pub mod cpu;
pub mod kernel;

use crossbeam::channel::{Receiver, TryRecvError};

use crate::error::{KernelError, KernelResult};

pub use batch::{BatchDescriptor, BatchManager, BatchMember, BatchStats, OffloadHost};
pub use cpu::CpuAccelerator;
pub use kernel::{KernelDescriptor, KernelParams, KernelTemplate, ParamKind, ParamSpec, ParamValue};

/// Handle to a compiled kernel, valid for the accelerator that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub(crate) u32);

/// A vector processor the kernel can dispatch batches to.
///
/// Buffers are flat arrays of fixed-width `f32` records, one per entity.
/// A dispatch always runs to completion; there is no cancellation.
pub trait Accelerator: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Validate and compile a kernel.
    fn compile(&self, descriptor: &KernelDescriptor) -> KernelResult<KernelHandle>;

    /// Number of `f32` values per record for a compiled kernel.
    fn record_width(&self, handle: KernelHandle) -> KernelResult<usize>;

    /// Run the kernel over `count` records of `buffer`.
    ///
    /// Returns immediately; the result arrives through the returned
    /// [`PendingDispatch`].
    fn dispatch(
        &self,
        handle: KernelHandle,
        buffer: Vec<f32>,
        count: usize,
    ) -> KernelResult<PendingDispatch>;
}

/// The eventual output buffer of a dispatch.
#[derive(Debug)]
pub struct PendingDispatch {
    receiver: Receiver<KernelResult<Vec<f32>>>,
    result: Option<KernelResult<Vec<f32>>>,
}

impl PendingDispatch {
    pub(crate) fn new(receiver: Receiver<KernelResult<Vec<f32>>>) -> Self {
        PendingDispatch {
            receiver,
            result: None,
        }
    }

    /// Returns `true` once the output is available without blocking.
    pub fn is_ready(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(result) => {
                self.result = Some(result);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.result = Some(Err(KernelError::DispatchFailed(
                    "accelerator dropped the dispatch".into(),
                )));
                true
            }
        }
    }

    /// Block until the output buffer is available.
    pub fn wait(mut self) -> KernelResult<Vec<f32>> {
        if let Some(result) = self.result.take() {
            return result;
        }
        self.receiver.recv().map_err(|_| {
            KernelError::DispatchFailed("accelerator dropped the dispatch".into())
        })?
    }
}
