//! # emosim
//!
//! Simulation core for an emotional agent/environment loop.
//!
//! The crate owns the per-frame step protocol, the canonical emotions tensor
//! and its disposal discipline, and the versioned save/load state machine.
//! Concrete environments and agents plug in through the [`collab`] traits.
//!
//! ## Quick Start
//!
//! ```ignore
//! use emosim::prelude::*;
//!
//! let backend = Backend::new();
//! let mut sim = Simulation::new(SimConfig::default(), backend.clone(), Box::new(MemoryStore::new()))?
//!     .with_environment(Box::new(my_env))
//!     .with_agent(Box::new(my_agent));
//!
//! sim.cold_start_load();
//! sim.start()?;
//! loop {
//!     if let TickOutcome::Halted(_) = sim.tick() {
//!         break;
//!     }
//! }
//! sim.shutdown();
//! ```
//!
//! ## Modules
//!
//! - [`tensor`]: Arena-backed tensors with explicit ownership
//! - [`simulation`]: Phase machine and the tick protocol
//! - [`snapshot`]: Versioned save/load
//! - [`observer`]: Read-only frame sinks

#[path = "core/tensor.rs"]
pub mod tensor;

#[path = "core/state.rs"]
pub mod state;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/config.rs"]
pub mod config;

#[path = "core/collab.rs"]
pub mod collab;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/simulation.rs"]
pub mod simulation;

#[path = "core/snapshot.rs"]
pub mod snapshot;

#[cfg(test)]
#[path = "core/testkit.rs"]
pub(crate) mod testkit;

pub mod observer;

/// Prelude module for convenient imports.
///
/// ```
/// use emosim::prelude::*;
/// ```
pub mod prelude {
    pub use crate::collab::{
        Agent, AgentResponse, DerivedMetrics, EnvStep, Environment, GraphFeatureSource,
        GraphFeatures, QueuedEvent, StepContext,
    };
    pub use crate::config::SimConfig;
    pub use crate::error::{
        CollabError, ConfigError, ControlError, LoadError, LoadStage, SaveError, StepError,
        StoreError,
    };
    pub use crate::observer::{FrameSink, FrameView, MetricsRecorder, SinkError};
    pub use crate::simulation::{Phase, Simulation, TickOutcome, TickStats};
    pub use crate::snapshot::{LoadOutcome, LoadReport, SaveReport, Snapshot};
    pub use crate::state::{HmLabel, Metrics, SimulationState, StateView};
    pub use crate::storage::{FileStore, MemoryStore, SnapshotStore};
    pub use crate::tensor::{Backend, Tensor, TensorError};
}
