//! SEIR epidemic over a ring of locations.
//!
//! Every location ticks once per unit of time. A tick exports a fraction of
//! the location's infectious population to the next location as exposure,
//! then advances the `[S, E, I, R]` compartments by one unit with RK4. The
//! integration is the expensive part: with offload enabled it is handed to
//! the accelerator, otherwise it runs inline through the same function, so
//! both paths give bit-identical results.
//!
//! A location with nobody exposed or infectious skips integration.

use std::any::Any;

use bytes::Bytes;

use crate::accel::kernel::{seir_rk4, seir_rk4_template};
use crate::accel::{KernelDescriptor, KernelParams};
use crate::entity::{Behavior, EntityContext, EntityId, EntityState};
use crate::error::KernelResult;
use crate::event::EventRef;
use crate::hash::{hash_combine, hash_f32s};

/// Model parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SeirConfig {
    /// Number of locations on the ring.
    pub locations: u64,
    pub population: f32,
    /// Infectious individuals at location 0 at the start.
    pub initial_infected: f32,
    /// Fraction of `I` exported to the next location per tick.
    pub exposure_rate: f32,
    pub r0: f32,
    /// RK4 steps per unit of time.
    pub substeps: u32,
}

impl Default for SeirConfig {
    fn default() -> Self {
        Self {
            locations: 8,
            population: 1000.0,
            initial_infected: 10.0,
            exposure_rate: 0.01,
            r0: 3.0,
            substeps: 10,
        }
    }
}

/// Compartments of one location.
#[derive(Debug, Clone, PartialEq)]
pub struct SeirState {
    /// `[S, E, I, R]`.
    pub compartments: [f32; 4],
    /// Ticks applied.
    pub ticks: u64,
}

impl SeirState {
    pub fn susceptible(&self) -> f32 {
        self.compartments[0]
    }

    pub fn exposed(&self) -> f32 {
        self.compartments[1]
    }

    pub fn infectious(&self) -> f32 {
        self.compartments[2]
    }

    pub fn recovered(&self) -> f32 {
        self.compartments[3]
    }

    pub fn total(&self) -> f32 {
        self.compartments.iter().sum()
    }

    fn needs_integration(&self) -> bool {
        self.exposed() > 0.0 || self.infectious() > 0.0
    }
}

impl EntityState for SeirState {
    fn clone_state(&self) -> Box<dyn EntityState> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn state_hash(&self) -> u64 {
        hash_combine(hash_f32s(&self.compartments), self.ticks)
    }

    fn write_record(&self, out: &mut Vec<f32>) {
        out.extend_from_slice(&self.compartments);
    }

    fn read_record(&mut self, record: &[f32]) {
        if let Some(values) = record.get(..4) {
            self.compartments.copy_from_slice(values);
        }
    }
}

/// The SEIR behavior.
#[derive(Debug, Clone)]
pub struct Seir {
    config: SeirConfig,
    kernel: KernelDescriptor,
    params: KernelParams,
}

impl Seir {
    pub fn new(config: SeirConfig) -> KernelResult<Self> {
        let kernel = KernelDescriptor::builder("seir_rk4")
            .record_width(4)
            .param("r0", config.r0)
            .param("substeps", config.substeps)
            .build()?;
        let params = seir_rk4_template().resolve(&kernel)?;
        Ok(Seir {
            config: SeirConfig {
                locations: config.locations.max(1),
                ..config
            },
            kernel,
            params,
        })
    }

    pub fn config(&self) -> &SeirConfig {
        &self.config
    }

    /// Descriptor of the accelerator kernel this model offloads to.
    pub fn kernel(&self) -> &KernelDescriptor {
        &self.kernel
    }

    /// Initial compartments of location `id`.
    pub fn state(&self, id: EntityId) -> SeirState {
        let infected = if id.raw() == 0 {
            self.config.initial_infected.min(self.config.population)
        } else {
            0.0
        };
        SeirState {
            compartments: [self.config.population - infected, 0.0, infected, 0.0],
            ticks: 0,
        }
    }

    fn next_location(&self, id: EntityId) -> EntityId {
        EntityId::new((id.raw() + 1) % self.config.locations)
    }
}

fn exposure(event: &EventRef) -> Option<f32> {
    let bytes: [u8; 4] = event.payload.get(..4)?.try_into().ok()?;
    Some(f32::from_le_bytes(bytes))
}

impl Behavior for Seir {
    fn initialize(&self, ctx: &mut EntityContext<'_>) -> KernelResult<()> {
        ctx.schedule_self(1, Bytes::new())
    }

    fn execute(&self, ctx: &mut EntityContext<'_>, events: &[EventRef]) -> KernelResult<()> {
        let id = ctx.id();
        let next = self.next_location(id);
        let mut tick = false;
        let mut exported = 0.0;
        let mut integrate = false;
        {
            let Some(state) = ctx.state_mut::<SeirState>() else {
                return Ok(());
            };
            for event in events {
                match exposure(event) {
                    Some(amount) => {
                        let moved = amount.min(state.compartments[0]).max(0.0);
                        state.compartments[0] -= moved;
                        state.compartments[1] += moved;
                    }
                    None => tick = true,
                }
            }
            if tick {
                state.ticks += 1;
                if next != id {
                    exported = state.infectious() * self.config.exposure_rate;
                }
                integrate = state.needs_integration();
            }
        }
        if !tick {
            return Ok(());
        }

        if exported > 0.0 {
            ctx.schedule(next, 1, Bytes::copy_from_slice(&exported.to_le_bytes()))?;
        }
        ctx.schedule_self(1, Bytes::new())?;

        if integrate && !ctx.request_offload() {
            if let Some(state) = ctx.state_mut::<SeirState>() {
                seir_rk4(&mut state.compartments, &self.params);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_location_zero_starts_infected() {
        let seir = Seir::new(SeirConfig::default()).unwrap();
        let zero = seir.state(EntityId::new(0));
        let one = seir.state(EntityId::new(1));
        assert_eq!(zero.infectious(), 10.0);
        assert_eq!(zero.total(), 1000.0);
        assert_eq!(one.infectious(), 0.0);
        assert!(!one.needs_integration());
    }

    #[test]
    fn test_record_round_trip_through_state() {
        let seir = Seir::new(SeirConfig::default()).unwrap();
        let mut state = seir.state(EntityId::new(0));
        let mut record = Vec::new();
        state.write_record(&mut record);
        assert_eq!(record, vec![990.0, 0.0, 10.0, 0.0]);
        state.read_record(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(state.compartments, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_descriptor_carries_model_parameters() {
        let seir = Seir::new(SeirConfig {
            r0: 2.0,
            substeps: 4,
            ..SeirConfig::default()
        })
        .unwrap();
        assert_eq!(seir.kernel().template(), "seir_rk4");
        assert_eq!(seir.params.float("r0"), 2.0);
        assert_eq!(seir.params.unsigned("substeps"), 4);
        assert_eq!(seir.params.float("mu"), 0.011);
    }
}
