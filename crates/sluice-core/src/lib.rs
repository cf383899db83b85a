//! Sluice Core
//!
//! Domain types, the generic state machine engine, and the port traits
//! shared by the scheduler, the agent pool and the local task executor.

pub mod agent;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod node;
pub mod pipeline;
pub mod ports;
pub mod sm;
pub mod status;
pub mod task;

pub use error::{Error, Result};
pub use ids::*;
