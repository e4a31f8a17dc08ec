//! Example models.
//!
//! Reference behaviors used by the demo binary and the integration tests.
//! They exercise the kernel; they are not part of it.
//!
//! | Model | Exercises |
//! |---|---|
//! | [`phold`] | random traffic between neighbors, rollbacks across processes |
//! | [`seir`] | per-entity ODE step that can be offloaded to the accelerator |

pub mod phold;
pub mod seir;

pub use phold::{Phold, PholdConfig, PholdState};
pub use seir::{Seir, SeirConfig, SeirState};
