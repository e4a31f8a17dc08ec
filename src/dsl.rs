//! Fluent builder for simulation setup.
//!
//! Hides the boilerplate of creating a [`Simulation`], registering
//! entities, attaching an accelerator and splitting a run over several
//! in-memory processes.

use std::sync::Arc;

use crate::accel::{Accelerator, KernelDescriptor};
use crate::comm::{Communicator, LocalCluster, Placement, SingleProcess};
use crate::config::{ExecutionMode, KernelConfig};
use crate::entity::{Behavior, EntityId, EntityState};
use crate::error::KernelResult;
use crate::event::Event;
use crate::listener::SimulationListener;
use crate::models::{Phold, Seir};
use crate::simulation::Simulation;
use crate::time::VirtualTime;

// ── SimulationBuilder ─────────────────────────────────────────────────

/// Fluent builder for one or more [`Simulation`]s.
///
/// # Example
/// ```rust
/// use timewarp::dsl::SimulationBuilder;
/// use timewarp::models::{Phold, PholdConfig};
///
/// let mut sim = SimulationBuilder::new()
///     .end_time(50)
///     .gvt_period(8)
///     .phold(&Phold::new(PholdConfig::default()))
///     .build()
///     .unwrap();
/// let stats = sim.run().unwrap();
/// assert!(stats.entities.committed > 0);
/// ```
pub struct SimulationBuilder {
    config: KernelConfig,
    entities: Vec<(EntityId, Box<dyn EntityState>, Arc<dyn Behavior>)>,
    events: Vec<Event>,
    accelerator: Option<(Arc<dyn Accelerator>, KernelDescriptor)>,
    listeners: Vec<Arc<dyn SimulationListener>>,
}

impl Default for SimulationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulationBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        SimulationBuilder {
            config: KernelConfig::default(),
            entities: Vec::new(),
            events: Vec::new(),
            accelerator: None,
            listeners: Vec::new(),
        }
    }

    // ── Configuration ─────────────────────────────────────────

    /// Replace the whole configuration.
    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    pub fn gvt_period(mut self, period: u64) -> Self {
        self.config.gvt_period = period;
        self
    }

    pub fn time_window(mut self, ticks: u64) -> Self {
        self.config.time_window = Some(ticks);
        self
    }

    pub fn end_time(mut self, ticks: u64) -> Self {
        self.config.end_time = VirtualTime::new(ticks);
        self
    }

    pub fn batch_capacity(mut self, capacity: usize) -> Self {
        self.config.batch_capacity = capacity;
        self
    }

    /// Offload to `accel` running `kernel`.
    pub fn offload(
        mut self,
        accel: Arc<dyn Accelerator>,
        kernel: KernelDescriptor,
        asynchronous: bool,
    ) -> Self {
        self.config.execution = ExecutionMode::Offload { asynchronous };
        self.accelerator = Some((accel, kernel));
        self
    }

    // ── Entities ──────────────────────────────────────────────

    /// Register an entity.
    pub fn entity(
        mut self,
        id: u64,
        state: impl EntityState + 'static,
        behavior: Arc<dyn Behavior>,
    ) -> Self {
        self.entities.push((EntityId::new(id), Box::new(state), behavior));
        self
    }

    /// Register the full PHOLD torus.
    pub fn phold(mut self, model: &Phold) -> Self {
        let behavior: Arc<dyn Behavior> = Arc::new(model.clone());
        for raw in 0..model.config().entities() {
            let id = EntityId::new(raw);
            self.entities
                .push((id, Box::new(model.state(id)), Arc::clone(&behavior)));
        }
        self
    }

    /// Register every SEIR location.
    pub fn seir(mut self, model: &Seir) -> Self {
        let behavior: Arc<dyn Behavior> = Arc::new(model.clone());
        for raw in 0..model.config().locations {
            let id = EntityId::new(raw);
            self.entities
                .push((id, Box::new(model.state(id)), Arc::clone(&behavior)));
        }
        self
    }

    /// Register `listener` with every built simulation.
    pub fn listener(mut self, listener: Arc<dyn SimulationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Route `event` into the run before it starts.
    pub fn inject(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    // ── Build ─────────────────────────────────────────────────

    /// Build a single-process simulation.
    pub fn build(self) -> KernelResult<Simulation> {
        let mut sims = self.build_with(vec![Box::new(SingleProcess) as Box<dyn Communicator>])?;
        Ok(sims.remove(0))
    }

    /// Build `processes` simulations connected by a [`LocalCluster`], one
    /// per rank, with round-robin placement. Run each on its own thread.
    pub fn build_cluster(self, processes: u32) -> KernelResult<Vec<Simulation>> {
        let endpoints = LocalCluster::new(processes, self.config.gvt_timeout);
        self.build_with(
            endpoints
                .into_iter()
                .map(|e| Box::new(e) as Box<dyn Communicator>)
                .collect(),
        )
    }

    fn build_with(self, comms: Vec<Box<dyn Communicator>>) -> KernelResult<Vec<Simulation>> {
        let placement = Placement::round_robin(comms.len() as u32);
        let mut sims = Vec::with_capacity(comms.len());
        for comm in comms {
            let rank = comm.rank();
            let mut sim = Simulation::with_communicator(self.config.clone(), comm, placement.clone())?;
            if let Some((accel, kernel)) = &self.accelerator {
                sim = sim.with_accelerator(Arc::clone(accel), kernel)?;
            }
            for listener in &self.listeners {
                sim.add_listener(Arc::clone(listener));
            }
            for (id, state, behavior) in &self.entities {
                sim.add_entity(*id, state.clone_state(), Arc::clone(behavior))?;
            }
            for event in &self.events {
                if placement.rank_of(event.receiver) == rank {
                    sim.inject(Event::from_parts(event.key(), event.anti, event.payload.clone()))?;
                }
            }
            sims.push(sim);
        }
        Ok(sims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::CpuAccelerator;
    use crate::models::{PholdConfig, SeirConfig};

    #[test]
    fn test_cluster_splits_entities_by_rank() {
        let sims = SimulationBuilder::new()
            .phold(&Phold::new(PholdConfig::default()))
            .build_cluster(3)
            .unwrap();
        let counts: Vec<usize> = sims.iter().map(|s| s.scheduler().len()).collect();
        assert_eq!(counts, vec![6, 5, 5]);
        assert_eq!(sims[2].rank(), 2);
    }

    #[test]
    fn test_offload_sets_execution_mode() {
        let seir = Seir::new(SeirConfig::default()).unwrap();
        let accel: Arc<dyn Accelerator> = Arc::new(CpuAccelerator::new(1).unwrap());
        let sim = SimulationBuilder::new()
            .offload(accel, seir.kernel().clone(), true)
            .seir(&seir)
            .build()
            .unwrap();
        assert_eq!(
            sim.config().execution,
            ExecutionMode::Offload { asynchronous: true }
        );
        assert_eq!(sim.scheduler().len(), 8);
    }

    #[test]
    fn test_invalid_config_fails_build() {
        let result = SimulationBuilder::new().gvt_period(0).build();
        assert!(result.is_err());
    }
}
