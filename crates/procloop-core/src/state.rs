use std::fmt;

/// Return code reported before the process reached a terminal state
pub const RETURN_UNSET: i32 = -2;

/// Return code reported after a forced kill (timeout or explicit `kill`)
pub const RETURN_KILLED: i32 = -3;

/// Error string recorded when the supervisor kills a child for overrunning its budget
pub const TIMED_OUT_MESSAGE: &str = "Timed out";

/// Error string recorded after an explicit `kill`
pub const KILLED_MESSAGE: &str = "Killed";

/// Lifecycle state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created, never started (or the start attempt failed).
    NotStarted,
    /// Child is alive and its pipes are registered with a loop.
    Running,
    /// Child exited on its own, whatever its exit code.
    Finished,
    /// Child was terminated by a signal nobody asked for.
    Crashed,
    /// Supervisor killed the child because the time budget elapsed.
    TimedOut,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Finished | ProcessState::Crashed | ProcessState::TimedOut
        )
    }

    pub(crate) fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (NotStarted, Running) | (Running, Finished) | (Running, Crashed) | (Running, TimedOut)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not started"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Finished => write!(f, "finished"),
            ProcessState::Crashed => write!(f, "crashed"),
            ProcessState::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Outcome of a synchronous `exec`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The child reached `Finished` or `Crashed`.
    Done,
    /// The time budget elapsed and the child was killed.
    TimedOut,
}

/// How a child terminated, as reported by the platform reaper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
}
