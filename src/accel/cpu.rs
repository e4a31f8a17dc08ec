//! Rayon-backed vector processor.
//!
//! Kernels run on a dedicated thread pool so a dispatch never competes with
//! the workers executing entities. Each dispatch is spawned onto the pool and
//! splits the transfer buffer into records with `par_chunks_mut`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam::channel;
use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::{debug, info};

use super::kernel::{affine_template, seir_rk4_template, KernelParams, KernelTemplate};
use super::{Accelerator, KernelDescriptor, KernelHandle, PendingDispatch};
use crate::error::{KernelError, KernelResult};

struct Compiled {
    template: KernelTemplate,
    params: Arc<KernelParams>,
}

/// CPU implementation of [`Accelerator`].
pub struct CpuAccelerator {
    pool: Arc<rayon::ThreadPool>,
    templates: BTreeMap<&'static str, KernelTemplate>,
    compiled: RwLock<Vec<Compiled>>,
}

impl std::fmt::Debug for CpuAccelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuAccelerator")
            .field("threads", &self.pool.current_num_threads())
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .field("compiled", &self.compiled.read().len())
            .finish()
    }
}

impl CpuAccelerator {
    /// Create an accelerator with `threads` pool threads and the built-in
    /// `affine` and `seir_rk4` templates. `0` uses one thread per core.
    pub fn new(threads: usize) -> KernelResult<Self> {
        let threads = if threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("accel-{}", i))
            .build()
            .map_err(|e| KernelError::InvalidConfig(format!("accelerator pool: {e}")))?;

        info!(threads, "Accelerator pool initialized");

        let mut accel = CpuAccelerator {
            pool: Arc::new(pool),
            templates: BTreeMap::new(),
            compiled: RwLock::new(Vec::new()),
        };
        accel.templates.insert("affine", affine_template());
        accel.templates.insert("seir_rk4", seir_rk4_template());
        Ok(accel)
    }

    /// Register an additional template. Replaces one with the same name.
    pub fn with_template(mut self, template: KernelTemplate) -> Self {
        self.templates.insert(template.name(), template);
        self
    }

    /// Number of pool threads.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Accelerator for CpuAccelerator {
    fn name(&self) -> &str {
        "cpu"
    }

    fn compile(&self, descriptor: &KernelDescriptor) -> KernelResult<KernelHandle> {
        let template = self
            .templates
            .get(descriptor.template())
            .ok_or_else(|| KernelError::UnknownKernel(descriptor.template().to_string()))?;
        let params = template.resolve(descriptor)?;
        let mut compiled = self.compiled.write();
        let handle = KernelHandle(compiled.len() as u32);
        compiled.push(Compiled {
            template: template.clone(),
            params: Arc::new(params),
        });
        debug!(kernel = template.name(), handle = handle.0, "Compiled kernel");
        Ok(handle)
    }

    fn record_width(&self, handle: KernelHandle) -> KernelResult<usize> {
        self.compiled
            .read()
            .get(handle.0 as usize)
            .map(|c| c.template.record_width())
            .ok_or_else(|| KernelError::UnknownKernel(format!("handle {}", handle.0)))
    }

    fn dispatch(
        &self,
        handle: KernelHandle,
        mut buffer: Vec<f32>,
        count: usize,
    ) -> KernelResult<PendingDispatch> {
        let (template, params) = {
            let compiled = self.compiled.read();
            let c = compiled
                .get(handle.0 as usize)
                .ok_or_else(|| KernelError::UnknownKernel(format!("handle {}", handle.0)))?;
            (c.template.clone(), Arc::clone(&c.params))
        };
        let width = template.record_width();
        let expected = count * width;
        if buffer.len() != expected {
            return Err(KernelError::RecordWidthMismatch {
                expected,
                actual: buffer.len(),
            });
        }

        let (tx, rx) = channel::bounded(1);
        self.pool.spawn(move || {
            buffer
                .par_chunks_mut(width)
                .for_each(|record| template.apply(record, &params));
            // The receiver may already be gone if the batch was abandoned.
            let _ = tx.send(Ok(buffer));
        });
        Ok(PendingDispatch::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn affine(scale: f32, offset: f32) -> KernelDescriptor {
        KernelDescriptor::builder("affine")
            .record_width(1)
            .param("scale", scale)
            .param("offset", offset)
            .build()
            .unwrap()
    }

    #[test]
    fn test_dispatch_applies_kernel_to_every_record() {
        let accel = CpuAccelerator::new(2).unwrap();
        let handle = accel.compile(&affine(2.0, 1.0)).unwrap();
        assert_eq!(accel.record_width(handle).unwrap(), 1);
        let out = accel
            .dispatch(handle, vec![0.0, 1.0, 2.0, 3.0], 4)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(out, vec![1.0, 3.0, 5.0, 7.0]);
    }

    #[test]
    fn test_unknown_template_is_rejected() {
        let accel = CpuAccelerator::new(1).unwrap();
        let descriptor = KernelDescriptor::builder("lorenz").record_width(3).build().unwrap();
        assert!(matches!(
            accel.compile(&descriptor),
            Err(KernelError::UnknownKernel(_))
        ));
    }

    #[test]
    fn test_buffer_length_must_match_count() {
        let accel = CpuAccelerator::new(1).unwrap();
        let handle = accel.compile(&affine(1.0, 0.0)).unwrap();
        let err = accel.dispatch(handle, vec![0.0; 3], 4).unwrap_err();
        assert_eq!(
            err,
            KernelError::RecordWidthMismatch {
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn test_custom_template() {
        fn square(record: &mut [f32], _: &KernelParams) {
            for x in record {
                *x *= *x;
            }
        }
        let accel =
            CpuAccelerator::new(1).unwrap().with_template(KernelTemplate::new("square", 2, square));
        let descriptor = KernelDescriptor::builder("square").record_width(2).build().unwrap();
        let handle = accel.compile(&descriptor).unwrap();
        let out = accel.dispatch(handle, vec![2.0, 3.0], 1).unwrap().wait().unwrap();
        assert_eq!(out, vec![4.0, 9.0]);
    }
}
