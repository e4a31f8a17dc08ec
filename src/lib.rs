//! # Timewarp: optimistic parallel discrete-event simulation
//!
//! A Time Warp kernel: entities execute optimistically, roll back when a
//! straggler arrives, cancel what they sent with anti-messages, and reclaim
//! history once Global Virtual Time proves it can no longer be needed.
//! Entities whose step is an expensive vector computation can be batched
//! onto an accelerator and reconciled against rollback afterwards.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Simulation                    │ ← one per process
//! │  ┌────────────┐  ┌──────────┐  ┌───────────┐ │
//! │  │ Scheduler  │  │   GVT    │  │   comm    │ │ ← transport + placement
//! │  │ ┌────────┐ │  │ Manager  │  └───────────┘ │
//! │  │ │ Entity │ │  └──────────┘  ┌───────────┐ │
//! │  │ │ (LVT,  │ │                │  Batch    │ │ ← accelerator offload
//! │  │ │ history│ │  ┌──────────┐  │  Manager  │ │
//! │  │ │ ckpts) │ │  │ Worker   │  └───────────┘ │
//! │  │ └────────┘ │  │ Pool     │                │ ← parallel phases
//! │  └────────────┘  └──────────┘                │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust
//! use timewarp::dsl::SimulationBuilder;
//! use timewarp::models::{Phold, PholdConfig};
//!
//! let mut sim = SimulationBuilder::new()
//!     .end_time(40)
//!     .phold(&Phold::new(PholdConfig::default()))
//!     .build()
//!     .unwrap();
//! let stats = sim.run().unwrap();
//! assert_eq!(stats.entities.rollbacks, 0);
//! ```

pub mod accel;
pub mod comm;
pub mod config;
pub mod dsl;
pub mod entity;
pub mod error;
pub mod event;
pub mod gvt;
pub mod hash;
pub mod listener;
pub mod models;
pub mod parallel;
pub mod recycler;
pub mod scheduler;
pub mod simulation;
pub mod time;

// Re-exports for convenience.
pub use accel::{Accelerator, BatchManager, CpuAccelerator, KernelDescriptor};
pub use comm::{Communicator, LocalCluster, Placement, ProcessId};
pub use config::{ExecutionMode, KernelConfig};
pub use dsl::SimulationBuilder;
pub use entity::{Behavior, Entity, EntityContext, EntityId, EntityState, EntityStats};
pub use error::{KernelError, KernelResult};
pub use event::{Event, EventKey, EventRef};
pub use gvt::{GvtManager, LocalBounds};
pub use listener::SimulationListener;
pub use recycler::EventRecycler;
pub use scheduler::{Scheduler, Step};
pub use simulation::{Simulation, SimulationStats};
pub use time::VirtualTime;
