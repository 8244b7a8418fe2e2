//! Rule-driven stochastic simulation of chemical reaction networks.
//!
//! A [`ReactionNetwork`] discovers reactions from a [`Ruleset`] as compounds
//! appear, a [`SimulationEngine`] drives the Gillespie chain over it, and a
//! pool of engines can rendezvous through a leaderless [`Gate`].

pub mod engine;
pub mod ensemble;
pub mod error;
pub mod gate;
pub mod network;
pub mod params;
pub mod pool;
#[cfg(feature = "python")]
mod python;
pub mod rules;
pub mod selector;
pub mod snapshot;
pub mod stats;


use serde::{Deserialize, Serialize};

pub use engine::{
    AbortReason, Advance, ConvergedBy, EngineConfig, EngineState, RunSummary, SimulationEngine,
    StopSignal, TerminationCause,
};
pub use error::SimError;
pub use gate::{Gate, GateRequest, GateState};
pub use network::{CollectionPolicy, GraphView, ReactionNetwork};
pub use params::Params;
pub use rules::{Parameters, Ruleset};
pub use selector::{SelectorError, WeightedSelector};
pub use snapshot::{Snapshot, SnapshotSink};

/// Position of a worker within its pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerContext {
    pub rank: usize,
    pub size: usize,
}

impl WorkerContext {
    pub fn single() -> Self {
        Self { rank: 0, size: 1 }
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::single()
    }
}
