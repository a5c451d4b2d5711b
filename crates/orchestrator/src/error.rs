use genorch_core::adapter::AdapterError;
use genorch_core::api::ApiError;
use genorch_core::error::CoreError;

/// Errors returned by orchestrator commands and initialization.
///
/// `Clone` so one shared initialization outcome can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    /// No transport is attached yet.
    #[error("Orchestrator is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// The orchestrator was torn down while the operation was running.
    #[error("Orchestrator was destroyed")]
    Destroyed,
}

impl From<AdapterError> for OrchestratorError {
    fn from(err: AdapterError) -> Self {
        OrchestratorError::Transport(err.0)
    }
}
