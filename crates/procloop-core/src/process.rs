use crate::error::ProcloopError;
use crate::state::ExitKind;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::time::Duration;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Callback invoked once by the platform reaper when the child has been reaped.
/// It runs on the reaper's thread, never on the loop's.
pub type ExitNotify = Box<dyn FnOnce(ExitKind) + Send>;

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    AccessDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Parent ends of the child's standard streams, already non-blocking
#[derive(Debug, Default)]
pub struct ChildStdio {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Everything the platform needs to launch a child
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    /// Resolved path of the executable.
    pub program: &'a Path,
    pub args: &'a [String],
    /// Exact environment of the child; `None` inherits the parent's.
    pub env: Option<&'a [(String, String)]>,
    pub working_directory: Option<&'a Path>,
}

/// Handle to a spawned child owned by a supervisor
pub trait ChildProcess: Send {
    fn pid(&self) -> ProcessId;

    /// Hand over the parent ends of the pipes. Subsequent calls return empty stdio.
    fn take_stdio(&mut self) -> ChildStdio;

    /// Start watching for termination; `notify` fires once the child is reaped
    fn watch_exit(&mut self, notify: ExitNotify) -> Result<(), ProcloopError>;

    /// Forcibly terminate the child (SIGKILL on Unix)
    fn force_kill(&mut self) -> TerminationResult;

    /// Block until the child has been reaped, for at most `timeout`.
    /// Returns false if it is still not reaped.
    fn wait_reaped(&mut self, timeout: Duration) -> bool;
}

/// Platform primitive launching children with redirected standard streams
pub trait ProcessSpawner: Send + Sync {
    /// The type of child handle this spawner produces
    type Child: ChildProcess;

    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<Self::Child, ProcloopError>;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str
    where
        Self: Sized;
}
