use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid as NixPid;
use procloop_core::{
    ChildProcess, ChildStdio, ExitKind, ExitNotify, ProcessId, ProcessSpawner, ProcloopError,
    SpawnRequest, TerminationResult,
};
use std::os::fd::OwnedFd;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Unix-specific child handle: pipe ends plus a reaper thread
pub struct UnixChild {
    pid: NixPid,
    stdio: ChildStdio,
    reaped: Arc<AtomicBool>,
    reaper: Option<JoinHandle<()>>,
}

impl UnixChild {
    fn reap_now(&mut self) -> bool {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(_) | Err(_) => {
                self.reaped.store(true, Ordering::Release);
                true
            }
        }
    }
}

impl ChildProcess for UnixChild {
    fn pid(&self) -> ProcessId {
        self.pid.as_raw() as ProcessId
    }

    fn take_stdio(&mut self) -> ChildStdio {
        std::mem::take(&mut self.stdio)
    }

    fn watch_exit(&mut self, notify: ExitNotify) -> Result<(), ProcloopError> {
        if self.reaper.is_some() {
            return Err(ProcloopError::InvalidState(format!(
                "exit of {} is already watched",
                self.pid
            )));
        }
        let pid = self.pid;
        let reaped = self.reaped.clone();
        let handle = thread::Builder::new()
            .name(format!("procloop-reaper-{pid}"))
            .spawn(move || {
                let kind = wait_for_exit(pid);
                reaped.store(true, Ordering::Release);
                debug!("reaped child {pid}: {kind:?}");
                notify(kind);
            })?;
        self.reaper = Some(handle);
        Ok(())
    }

    fn force_kill(&mut self) -> TerminationResult {
        // Once reaped the pid may already belong to someone else.
        if self.reaped.load(Ordering::Acquire) {
            return TerminationResult::ProcessNotFound;
        }
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) => {
                info!("Sent SIGKILL to process {}", self.pid);
                TerminationResult::Success
            }
            Err(Errno::ESRCH) => {
                info!("Process {} not found (already terminated)", self.pid);
                TerminationResult::ProcessNotFound
            }
            Err(Errno::EPERM) => {
                warn!("Permission denied to kill process {}", self.pid);
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!("Failed to send SIGKILL to process {}: {}", self.pid, e);
                TerminationResult::Failed(format!("SIGKILL failed: {e}"))
            }
        }
    }

    fn wait_reaped(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reaped.load(Ordering::Acquire) {
                return true;
            }
            // Without a reaper nobody else collects the status.
            if self.reaper.is_none() && self.reap_now() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(REAP_POLL_INTERVAL);
        }
    }
}

impl Drop for UnixChild {
    fn drop(&mut self) {
        if self.reaper.is_none() && !self.reaped.load(Ordering::Acquire) && !self.reap_now() {
            warn!("child {} dropped unwatched and still running", self.pid);
        }
    }
}

fn wait_for_exit(pid: NixPid) -> ExitKind {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return ExitKind::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return ExitKind::Signaled(signal as i32),
            Ok(status) => trace!("ignoring wait status {status:?}"),
            Err(Errno::EINTR) => {}
            Err(e) => {
                warn!("waitpid({pid}) failed: {e}");
                return ExitKind::Exited(-1);
            }
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Unix spawn backend built on `std::process::Command` and `nix`
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixSpawner;

impl ProcessSpawner for UnixSpawner {
    type Child = UnixChild;

    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<UnixChild, ProcloopError> {
        let mut cmd = Command::new(request.program);
        cmd.args(request.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = request.working_directory {
            cmd.current_dir(dir);
        }

        // An explicit environment replaces the inherited one entirely.
        if let Some(env) = request.env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(key, value)| (key, value)));
        }

        let mut child = cmd.spawn().map_err(|e| {
            ProcloopError::SpawnFailed(format!("{}: {e}", request.program.display()))
        })?;

        let stdio = ChildStdio {
            stdin: child.stdin.take().map(OwnedFd::from),
            stdout: child.stdout.take().map(OwnedFd::from),
            stderr: child.stderr.take().map(OwnedFd::from),
        };
        let mut unix_child = UnixChild {
            pid: NixPid::from_raw(child.id() as i32),
            stdio,
            reaped: Arc::new(AtomicBool::new(false)),
            reaper: None,
        };

        let pipes = [
            &unix_child.stdio.stdin,
            &unix_child.stdio.stdout,
            &unix_child.stdio.stderr,
        ];
        let nonblocking = pipes.into_iter().flatten().try_for_each(set_nonblocking);
        if let Err(e) = nonblocking {
            unix_child.force_kill();
            unix_child.wait_reaped(Duration::from_secs(1));
            return Err(ProcloopError::SpawnFailed(format!(
                "cannot make pipes of {} non-blocking: {e}",
                request.program.display()
            )));
        }

        info!(
            "Spawned Unix process: {} (PID: {}) with args: {:?}",
            request.program.display(),
            unix_child.pid,
            request.args
        );
        Ok(unix_child)
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
