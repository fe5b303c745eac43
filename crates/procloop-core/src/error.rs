use thiserror::Error;

/// Errors raised by the reactor itself
#[derive(Error, Debug)]
pub enum LoopError {
    #[error("Event loop is already running on this instance")]
    Reentrant,

    #[error("A main event loop is already registered for this process")]
    MainLoopAlreadySet,

    #[error("Failed to create readiness poller: {0}")]
    Create(#[source] std::io::Error),

    #[error("Readiness wait failed: {0}")]
    Poll(#[source] std::io::Error),

    #[error("Failed to register source: {0}")]
    Register(#[source] std::io::Error),
}

/// Core error types for procloop operations
#[derive(Error, Debug)]
pub enum ProcloopError {
    #[error("Invalid state for this operation: {0}")]
    InvalidState(String),

    #[error("No event loop available to drive the process")]
    NoEventLoop,

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Event loop error: {0}")]
    Loop(#[from] LoopError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ProcloopError {
    /// Check if this error was raised while launching the child
    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            ProcloopError::CommandNotFound(_)
                | ProcloopError::SpawnFailed(_)
                | ProcloopError::NoEventLoop
        )
    }

    /// Check if retrying the same call can never succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProcloopError::InvalidState(_)
                | ProcloopError::Config(_)
                | ProcloopError::Loop(LoopError::Reentrant)
        )
    }
}
