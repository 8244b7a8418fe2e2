use thiserror::Error;

use crate::selector::SelectorError;

/// Process exit code for a fatal invariant violation.
pub const EXIT_INVARIANT: i32 = 1;
/// Process exit code for malformed input or resume data.
pub const EXIT_INPUT: i32 = 2;
/// Process exit code for a run that ended with an `Aborted` cause.
pub const EXIT_ABORTED: i32 = 3;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(
        "reaction '{reaction}' would drive '{compound}' negative \
         (population {population}, delta {delta})"
    )]
    NegativePopulation {
        reaction: String,
        compound: String,
        population: u64,
        delta: i64,
    },
    #[error("rule '{rule}' produced an empty compound from {reactants:?}")]
    InvalidProduct { rule: String, reactants: Vec<String> },
    #[error("selector error: {0}")]
    Selector(#[from] SelectorError),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
    #[error("gate inbox disconnected")]
    GateDisconnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        SimError::InvalidArgument(message.into())
    }

    /// True for errors raised while reading configuration or resume data,
    /// before any simulation state exists.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            SimError::InvalidArgument(_) | SimError::Io(_) | SimError::Json(_)
        )
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_input_error() {
            EXIT_INPUT
        } else {
            EXIT_INVARIANT
        }
    }
}
