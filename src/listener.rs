//! Hooks for observing kernel milestones.
//!
//! A model that drives something outside the simulation, such as an
//! external device or a progress display, registers a
//! [`SimulationListener`] with the [`Simulation`](crate::Simulation) and is
//! called back as the run commits work. Callbacks only observe; they cannot
//! influence scheduling.

use crate::time::VirtualTime;

/// Callbacks for kernel milestones. Every method has an empty default.
pub trait SimulationListener: Send + Sync {
    /// History below `gvt` has been reclaimed on this process.
    ///
    /// Successive calls on one process see strictly increasing GVT values.
    fn garbage_collection_done(&self, _gvt: VirtualTime) {}
}

/// A listener backed by a closure over the collected GVT.
impl<F> SimulationListener for F
where
    F: Fn(VirtualTime) + Send + Sync,
{
    fn garbage_collection_done(&self, gvt: VirtualTime) {
        (self)(gvt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Silent;

    impl SimulationListener for Silent {}

    #[test]
    fn test_default_callback_is_a_no_op() {
        Silent.garbage_collection_done(VirtualTime::new(4));
    }

    #[test]
    fn test_closure_listener_receives_gvt() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = move |gvt: VirtualTime| sink.lock().push(gvt);
        listener.garbage_collection_done(VirtualTime::new(3));
        listener.garbage_collection_done(VirtualTime::new(8));
        assert_eq!(*seen.lock(), vec![VirtualTime::new(3), VirtualTime::new(8)]);
    }
}
