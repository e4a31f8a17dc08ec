//! PHOLD: the classic synthetic PDES benchmark.
//!
//! Entities sit on an `width × height` torus. Each starts with a few events
//! addressed to itself; every event it receives makes it send one new
//! event, either to itself or to one of its four neighbors, `lookahead`
//! plus a random delay into the future. The random generator lives in the
//! entity state, so a rollback rewinds it along with everything else.

use std::any::Any;

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::entity::{Behavior, EntityContext, EntityId, EntityState};
use crate::error::KernelResult;
use crate::event::EventRef;
use crate::hash::{hash_bytes, hash_combine};

/// Workload parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PholdConfig {
    pub width: u64,
    pub height: u64,
    /// Events each entity seeds itself with.
    pub initial_events: u32,
    /// Upper bound of the uniform random delay added to `lookahead`.
    pub max_delay: u64,
    /// Minimum distance between an event and the events it causes.
    pub lookahead: u64,
    /// Probability that an event stays with its sender.
    pub self_fraction: f64,
    /// Mixed with the entity id to seed each entity's generator.
    pub seed: u64,
}

impl Default for PholdConfig {
    fn default() -> Self {
        Self {
            width: 4,
            height: 4,
            initial_events: 2,
            max_delay: 4,
            lookahead: 1,
            self_fraction: 0.25,
            seed: 0x5eed,
        }
    }
}

impl PholdConfig {
    /// Number of entities on the torus.
    pub fn entities(&self) -> u64 {
        self.width * self.height
    }
}

/// Per-entity PHOLD state.
#[derive(Debug, Clone)]
pub struct PholdState {
    rng: ChaCha8Rng,
    /// Which neighbor the next outbound event goes to.
    direction: usize,
    pub received: u64,
    /// Running hash of every applied event's origin and payload.
    pub digest: u64,
}

impl PholdState {
    pub fn new(id: EntityId, config: &PholdConfig) -> Self {
        PholdState {
            rng: ChaCha8Rng::seed_from_u64(hash_combine(config.seed, id.raw())),
            direction: 0,
            received: 0,
            digest: 0,
        }
    }
}

impl EntityState for PholdState {
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
        hash_combine(hash_combine(self.digest, self.received), self.direction as u64)
    }
}

/// The PHOLD behavior, shared by every entity of a run.
#[derive(Debug, Clone)]
pub struct Phold {
    config: PholdConfig,
}

impl Phold {
    pub fn new(mut config: PholdConfig) -> Self {
        config.lookahead = config.lookahead.max(1);
        config.width = config.width.max(1);
        config.height = config.height.max(1);
        Phold { config }
    }

    pub fn config(&self) -> &PholdConfig {
        &self.config
    }

    /// Fresh state for entity `id`.
    pub fn state(&self, id: EntityId) -> PholdState {
        PholdState::new(id, &self.config)
    }

    fn delay(&self, rng: &mut ChaCha8Rng) -> u64 {
        self.config.lookahead + rng.gen_range(0..=self.config.max_delay)
    }

    /// The neighbor in `direction` (left, up, down, right) on the torus.
    fn neighbor(&self, id: EntityId, direction: usize) -> EntityId {
        let total = self.config.entities() as i64;
        let height = self.config.height as i64;
        let change = [-1, -height, height, 1][direction % 4];
        EntityId::new((id.raw() as i64 + change).rem_euclid(total) as u64)
    }
}

impl Behavior for Phold {
    fn initialize(&self, ctx: &mut EntityContext<'_>) -> KernelResult<()> {
        for hop in 0..self.config.initial_events {
            let Some(state) = ctx.state_mut::<PholdState>() else {
                return Ok(());
            };
            let delay = self.delay(&mut state.rng);
            ctx.schedule_self(delay, Bytes::copy_from_slice(&(hop as u64).to_le_bytes()))?;
        }
        Ok(())
    }

    fn execute(&self, ctx: &mut EntityContext<'_>, events: &[EventRef]) -> KernelResult<()> {
        let id = ctx.id();
        for event in events {
            let Some(state) = ctx.state_mut::<PholdState>() else {
                return Ok(());
            };
            state.received += 1;
            state.digest = hash_combine(
                state.digest,
                hash_combine(event.sender.raw(), hash_bytes(&event.payload)),
            );
            let hops = event
                .payload
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .map(u64::from_le_bytes)
                .unwrap_or(0);

            let delay = self.delay(&mut state.rng);
            let receiver = if state.rng.gen::<f64>() >= self.config.self_fraction {
                let direction = state.direction;
                state.direction = (direction + 1) % 4;
                self.neighbor(id, direction)
            } else {
                id
            };
            ctx.schedule(
                receiver,
                delay,
                Bytes::copy_from_slice(&(hops + 1).to_le_bytes()),
            )?;
        }
        Ok(())
    }
}
