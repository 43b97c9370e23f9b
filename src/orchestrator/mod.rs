//! Session orchestration modules.
//!
//! Covers the session state machine, the inbound event queue and its
//! control handle, the result channel, the decision surface contract and
//! the tick loop that drives everything from one task.

pub mod groups;
pub mod inbox;
pub mod result_channel;
pub mod runner;
pub mod sequencer;
pub mod surface;

pub use inbox::{Inbound, OrchestratorHandle};
pub use result_channel::ResultChannel;
pub use runner::spawn_orchestrator;
pub use sequencer::Orchestrator;
pub use surface::{DecisionSurface, LogSurface};
