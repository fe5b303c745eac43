//! Supervision of a single child process driven by an [`EventLoop`].
//!
//! The supervisor owns the parent ends of the child's pipes. It registers
//! them with the loop it is bound to, buffers what the child prints, flushes
//! what the caller writes, and reports the lifecycle through three signals.
//! Exit detection comes from the platform reaper, which posts the exit status
//! to the loop so every state transition happens on the loop's thread.
//!
//! Signals are always emitted with the internal lock released, so listeners
//! may call back into the supervisor.

use crate::config::ProcessConfig;
use crate::env::{find_executable, parse_environment};
use crate::error::{LoopError, ProcloopError};
use crate::event_loop::{EventLoop, Interest, TimerId, WeakEventLoop};
use crate::message::{self, Message};
use crate::process::{ChildProcess, ProcessId, ProcessSpawner, SpawnRequest, TerminationResult};
use crate::signal::Signal;
use crate::state::{
    ExecOutcome, ExitKind, KILLED_MESSAGE, ProcessState, RETURN_KILLED, RETURN_UNSET,
    TIMED_OUT_MESSAGE,
};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// How long a forced kill may take to be reaped before we stop waiting.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Supervises one child process.
///
/// Cloning yields another handle to the same process; listeners receive such
/// a handle so one listener can serve several processes.
pub struct Supervisor<S: ProcessSpawner> {
    shared: Arc<Shared<S>>,
}

struct Shared<S: ProcessSpawner> {
    id: u64,
    spawner: S,
    inner: Mutex<Inner<S::Child>>,
    ready_read_stdout: Signal<Supervisor<S>>,
    ready_read_stderr: Signal<Supervisor<S>>,
    finished: Signal<Supervisor<S>>,
}

impl<S: ProcessSpawner> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, Inner<S::Child>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Inner<C> {
    state: ProcessState,
    child: Option<C>,
    pid: Option<ProcessId>,
    command: String,

    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
    stdin_buffer: Vec<u8>,
    stdout_buffer: Vec<u8>,
    stderr_buffer: Vec<u8>,

    return_code: i32,
    error_string: String,
    timeout: Option<Duration>,
    started_at: Option<Instant>,

    /// Loop supplied by the caller, preferred over the thread's current loop.
    preferred_loop: Option<WeakEventLoop>,
    /// Loop the running child is registered with.
    event_loop: Option<WeakEventLoop>,
    timer: Option<TimerId>,

    watching_stdin: bool,
    close_stdin_when_flushed: bool,
    kill_requested: bool,
    quit_loop_on_finish: bool,
}

impl<C> Default for Inner<C> {
    fn default() -> Self {
        Self {
            state: ProcessState::NotStarted,
            child: None,
            pid: None,
            command: String::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            stdin_buffer: Vec::new(),
            stdout_buffer: Vec::new(),
            stderr_buffer: Vec::new(),
            return_code: RETURN_UNSET,
            error_string: String::new(),
            timeout: None,
            started_at: None,
            preferred_loop: None,
            event_loop: None,
            timer: None,
            watching_stdin: false,
            close_stdin_when_flushed: false,
            kill_requested: false,
            quit_loop_on_finish: false,
        }
    }
}

impl<C: ChildProcess> Inner<C> {
    fn driving_loop(&self) -> Option<EventLoop> {
        self.event_loop.as_ref().and_then(WeakEventLoop::upgrade)
    }

    fn pipe(&mut self, stream: Stream) -> &mut Option<File> {
        match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        }
    }

    fn buffer(&mut self, stream: Stream) -> &mut Vec<u8> {
        match stream {
            Stream::Stdout => &mut self.stdout_buffer,
            Stream::Stderr => &mut self.stderr_buffer,
        }
    }

    /// Read everything the pipe holds right now. Returns true if bytes arrived.
    fn drain(&mut self, stream: Stream) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        let mut received = false;
        loop {
            let Some(pipe) = self.pipe(stream).as_mut() else {
                break;
            };
            match pipe.read(&mut chunk) {
                Ok(0) => {
                    self.close_pipe(stream);
                    break;
                }
                Ok(n) => {
                    trace!("read {n} bytes from {stream}");
                    self.buffer(stream).extend_from_slice(&chunk[..n]);
                    received = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("reading {stream} failed: {e}");
                    self.close_pipe(stream);
                    break;
                }
            }
        }
        received
    }

    /// The peer closed its end. Not an exit: the reaper decides that.
    fn close_pipe(&mut self, stream: Stream) {
        if let Some(pipe) = self.pipe(stream).take() {
            if let Some(event_loop) = self.driving_loop() {
                event_loop.unregister_descriptor(pipe.as_raw_fd());
            }
            debug!(pid = ?self.pid, "{stream} closed by the child");
        }
    }

    fn flush_stdin(&mut self) {
        while !self.stdin_buffer.is_empty() {
            let Some(pipe) = self.stdin.as_mut() else {
                debug!("stdin already closed, dropping {} bytes", self.stdin_buffer.len());
                self.stdin_buffer.clear();
                break;
            };
            match pipe.write(&self.stdin_buffer) {
                Ok(0) => return,
                Ok(written) => {
                    self.stdin_buffer.drain(..written);
                    trace!("flushed {written} bytes to stdin");
                }
                // Still watched; the next write readiness resumes the flush.
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(pid = ?self.pid, "child stopped reading stdin: {e}");
                    self.stdin_buffer.clear();
                    self.close_stdin_now();
                    return;
                }
            }
        }

        self.unwatch_stdin();
        if self.close_stdin_when_flushed {
            self.close_stdin_now();
        }
    }

    fn unwatch_stdin(&mut self) {
        if !self.watching_stdin {
            return;
        }
        self.watching_stdin = false;
        if let (Some(event_loop), Some(pipe)) = (self.driving_loop(), self.stdin.as_ref()) {
            event_loop.unregister_descriptor(pipe.as_raw_fd());
        }
    }

    fn close_stdin_now(&mut self) {
        self.unwatch_stdin();
        self.close_stdin_when_flushed = false;
        if self.stdin.take().is_some() {
            debug!(pid = ?self.pid, "closed stdin");
        }
    }

    fn finish(&mut self, state: ProcessState, return_code: i32, error_string: String) {
        debug_assert!(self.state.can_transition_to(state));
        self.state = state;
        self.return_code = return_code;
        self.error_string = error_string;
        self.release();
    }

    /// Drop every registration, descriptor and the child handle.
    fn release(&mut self) {
        if let Some(event_loop) = self.driving_loop() {
            for pipe in [&self.stdin, &self.stdout, &self.stderr].into_iter().flatten() {
                event_loop.unregister_descriptor(pipe.as_raw_fd());
            }
            if let Some(timer) = self.timer {
                event_loop.unregister_timer(timer);
            }
        }
        self.timer = None;
        self.watching_stdin = false;
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.stdin_buffer.clear();
        self.child = None;
    }
}

impl<S: ProcessSpawner> Clone for Supervisor<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: ProcessSpawner + Default + 'static> Default for Supervisor<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ProcessSpawner + 'static> Supervisor<S> {
    pub fn new() -> Self
    where
        S: Default,
    {
        Self::with_spawner(S::default())
    }

    pub fn with_spawner(spawner: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                spawner,
                inner: Mutex::new(Inner::default()),
                ready_read_stdout: Signal::new(),
                ready_read_stderr: Signal::new(),
                finished: Signal::new(),
            }),
        }
    }

    /// Process-unique identifier of this supervisor
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// True if both handles supervise the same process
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Drive this process from `event_loop` instead of the thread's current loop.
    pub fn set_event_loop(&self, event_loop: &EventLoop) {
        self.shared.lock().preferred_loop = Some(event_loop.downgrade());
    }

    pub fn state(&self) -> ProcessState {
        self.shared.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Exit code once terminal; [`RETURN_UNSET`] before that.
    pub fn return_code(&self) -> i32 {
        self.shared.lock().return_code
    }

    pub fn error_string(&self) -> String {
        self.shared.lock().error_string.clone()
    }

    pub fn pid(&self) -> Option<ProcessId> {
        self.shared.lock().pid
    }

    pub fn command(&self) -> String {
        self.shared.lock().command.clone()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.shared.lock().timeout
    }

    /// Time since the child was spawned
    pub fn elapsed(&self) -> Option<Duration> {
        self.shared.lock().started_at.map(|started| started.elapsed())
    }

    /// Emitted after new stdout bytes were buffered
    ///
    /// Listeners receive the emitting supervisor. A listener that captures a
    /// clone of it keeps the process alive, so dropping the last outside
    /// handle no longer kills a running child.
    pub fn ready_read_stdout(&self) -> &Signal<Self> {
        &self.shared.ready_read_stdout
    }

    /// Emitted after new stderr bytes were buffered
    pub fn ready_read_stderr(&self) -> &Signal<Self> {
        &self.shared.ready_read_stderr
    }

    /// Emitted once, after the terminal transition
    pub fn finished(&self) -> &Signal<Self> {
        &self.shared.finished
    }

    /// Take everything buffered from stdout so far
    pub fn read_all_stdout(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.lock().stdout_buffer)
    }

    /// Take everything buffered from stderr so far
    pub fn read_all_stderr(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.lock().stderr_buffer)
    }

    /// Spawn `command` with the inherited environment and return immediately.
    pub fn start<A: AsRef<str>>(&self, command: &str, args: &[A]) -> Result<(), ProcloopError> {
        self.start_config(&config_for(command, args, None::<&[&str]>, None))
    }

    /// Spawn `command` with exactly the given `KEY=VALUE` environment.
    pub fn start_with_env<A: AsRef<str>, E: AsRef<str>>(
        &self,
        command: &str,
        args: &[A],
        env: &[E],
    ) -> Result<(), ProcloopError> {
        self.start_config(&config_for(command, args, Some(env), None))
    }

    pub fn start_config(&self, config: &ProcessConfig) -> Result<(), ProcloopError> {
        let event_loop = self.resolve_loop()?;
        self.launch(&event_loop, config, false)
    }

    /// Spawn `command` and block until it terminates or `timeout` elapses.
    pub fn exec<A: AsRef<str>>(
        &self,
        command: &str,
        args: &[A],
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, ProcloopError> {
        self.exec_config(&config_for(command, args, None::<&[&str]>, timeout))
    }

    pub fn exec_with_env<A: AsRef<str>, E: AsRef<str>>(
        &self,
        command: &str,
        args: &[A],
        env: &[E],
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, ProcloopError> {
        self.exec_config(&config_for(command, args, Some(env), timeout))
    }

    /// Run the process to completion.
    ///
    /// Uses the loop given to [`Supervisor::set_event_loop`] when there is
    /// one, otherwise a private loop that lives for this call only.
    pub fn exec_config(&self, config: &ProcessConfig) -> Result<ExecOutcome, ProcloopError> {
        let preferred = self
            .shared
            .lock()
            .preferred_loop
            .as_ref()
            .and_then(WeakEventLoop::upgrade);
        let event_loop = match preferred {
            Some(event_loop) => event_loop,
            None => EventLoop::new()?,
        };
        if event_loop.is_running() {
            return Err(LoopError::Reentrant.into());
        }

        self.launch(&event_loop, config, true)?;
        while !self.is_finished() {
            if let Err(e) = event_loop.exec(None) {
                warn!("event loop failed while running {}: {e}", config.command);
                self.abandon();
                return Err(e.into());
            }
        }

        Ok(match self.state() {
            ProcessState::TimedOut => ExecOutcome::TimedOut,
            _ => ExecOutcome::Done,
        })
    }

    /// Queue bytes for the child's stdin.
    ///
    /// Bytes written before `start` are flushed once the child runs. Writes
    /// after termination or after stdin was closed are dropped.
    pub fn write(&self, data: &[u8]) {
        let mut inner = self.shared.lock();
        if inner.state.is_terminal() {
            debug!("process {}, dropping {} bytes", inner.state, data.len());
            return;
        }
        if inner.state == ProcessState::Running && inner.stdin.is_none() {
            debug!("stdin closed, dropping {} bytes", data.len());
            return;
        }

        inner.stdin_buffer.extend_from_slice(data);
        if inner.state == ProcessState::Running {
            Self::watch_stdin(Arc::downgrade(&self.shared), &mut inner);
        }
    }

    /// Encode `message` and queue it for the child's stdin
    pub fn write_message<M: Message>(&self, message: &M) {
        self.write(&message::encode(message));
    }

    /// Close the child's stdin once every queued byte has been flushed.
    pub fn close_stdin(&self) {
        let mut inner = self.shared.lock();
        match inner.state {
            ProcessState::NotStarted => inner.close_stdin_when_flushed = true,
            ProcessState::Running if inner.stdin_buffer.is_empty() => inner.close_stdin_now(),
            ProcessState::Running => inner.close_stdin_when_flushed = true,
            _ => {}
        }
    }

    /// Forcibly terminate the child.
    ///
    /// The process ends `Finished` with [`RETURN_KILLED`] once the loop
    /// observes the exit.
    pub fn kill(&self) -> TerminationResult {
        let mut inner = self.shared.lock();
        if inner.state != ProcessState::Running {
            return TerminationResult::ProcessNotFound;
        }
        inner.kill_requested = true;
        let pid = inner.pid;
        match inner.child.as_mut() {
            Some(child) => {
                let result = child.force_kill();
                info!(?pid, ?result, "kill requested");
                result
            }
            None => TerminationResult::ProcessNotFound,
        }
    }

    fn resolve_loop(&self) -> Result<EventLoop, ProcloopError> {
        let preferred = self
            .shared
            .lock()
            .preferred_loop
            .as_ref()
            .and_then(WeakEventLoop::upgrade);
        preferred
            .or_else(EventLoop::current)
            .or_else(EventLoop::main)
            .ok_or_else(|| {
                let error = ProcloopError::NoEventLoop;
                self.shared.lock().error_string = error.to_string();
                error
            })
    }

    fn launch(
        &self,
        event_loop: &EventLoop,
        config: &ProcessConfig,
        quit_loop_on_finish: bool,
    ) -> Result<(), ProcloopError> {
        let mut inner = self.shared.lock();
        if inner.state != ProcessState::NotStarted {
            return Err(ProcloopError::InvalidState(format!(
                "cannot start a process that is {}",
                inner.state
            )));
        }

        match self.spawn_locked(&mut inner, event_loop, config) {
            Ok(()) => {
                inner.quit_loop_on_finish = quit_loop_on_finish;
                info!(
                    pid = ?inner.pid,
                    command = %config.command,
                    args = ?config.args,
                    "process started"
                );
                Ok(())
            }
            Err(e) => {
                warn!("failed to start {}: {e}", config.command);
                inner.error_string = e.to_string();
                Err(e)
            }
        }
    }

    fn spawn_locked(
        &self,
        inner: &mut Inner<S::Child>,
        event_loop: &EventLoop,
        config: &ProcessConfig,
    ) -> Result<(), ProcloopError> {
        config.validate()?;
        let env = config.env.as_deref().map(parse_environment);
        let program = find_executable(&config.command, env.as_deref())
            .ok_or_else(|| ProcloopError::CommandNotFound(config.command.clone()))?;

        let request = SpawnRequest {
            program: &program,
            args: &config.args,
            env: env.as_deref(),
            working_directory: config.working_directory.as_deref(),
        };
        let mut child = self.shared.spawner.spawn(&request)?;
        let stdio = child.take_stdio();
        let stdin = stdio.stdin.map(File::from);
        let stdout = stdio.stdout.map(File::from);
        let stderr = stdio.stderr.map(File::from);

        let exit_target = Arc::downgrade(&self.shared);
        let exit_loop = event_loop.downgrade();
        let watched = child
            .watch_exit(Box::new(move |kind| match exit_loop.upgrade() {
                Some(event_loop) => {
                    event_loop.post(move |_| Self::on_exit(&exit_target, kind));
                }
                None => debug!("event loop gone, dropping exit notification {kind:?}"),
            }))
            .and_then(|()| {
                self.watch_output(event_loop, stdout.as_ref(), Stream::Stdout)?;
                self.watch_output(event_loop, stderr.as_ref(), Stream::Stderr)?;
                Ok(())
            });

        if let Err(e) = watched {
            // The reaper may still report this child; it is ignored while NotStarted.
            for pipe in [&stdout, &stderr].into_iter().flatten() {
                event_loop.unregister_descriptor(pipe.as_raw_fd());
            }
            child.force_kill();
            child.wait_reaped(KILL_REAP_TIMEOUT);
            return Err(e);
        }

        inner.pid = Some(child.pid());
        inner.child = Some(child);
        inner.command = config.command.clone();
        inner.stdin = stdin;
        inner.stdout = stdout;
        inner.stderr = stderr;
        inner.state = ProcessState::Running;
        inner.return_code = RETURN_UNSET;
        inner.error_string.clear();
        inner.started_at = Some(Instant::now());
        inner.event_loop = Some(event_loop.downgrade());
        inner.close_stdin_when_flushed |= config.close_stdin;
        inner.timeout = config.timeout();

        if let Some(timeout) = inner.timeout {
            let target = Arc::downgrade(&self.shared);
            inner.timer = Some(event_loop.register_timer(timeout, false, move |_, _| {
                Self::on_timeout(&target)
            }));
        }

        if !inner.stdin_buffer.is_empty() {
            Self::watch_stdin(Arc::downgrade(&self.shared), inner);
        } else if inner.close_stdin_when_flushed {
            inner.close_stdin_now();
        }
        Ok(())
    }

    fn watch_output(
        &self,
        event_loop: &EventLoop,
        pipe: Option<&File>,
        stream: Stream,
    ) -> Result<(), ProcloopError> {
        let Some(pipe) = pipe else {
            return Ok(());
        };
        let target = Arc::downgrade(&self.shared);
        event_loop.register_descriptor(pipe.as_raw_fd(), Interest::READ, move |_, _, _| {
            Self::on_readable(&target, stream)
        })?;
        Ok(())
    }

    fn watch_stdin(target: Weak<Shared<S>>, inner: &mut Inner<S::Child>) {
        if inner.watching_stdin {
            return;
        }
        let Some(event_loop) = inner.driving_loop() else {
            return;
        };
        let Some(fd) = inner.stdin.as_ref().map(AsRawFd::as_raw_fd) else {
            return;
        };
        match event_loop.register_descriptor(fd, Interest::WRITE, move |_, _, _| {
            Self::on_writable(&target)
        }) {
            Ok(()) => inner.watching_stdin = true,
            Err(e) => warn!(pid = ?inner.pid, "cannot watch stdin: {e}"),
        }
    }

    fn on_readable(target: &Weak<Shared<S>>, stream: Stream) {
        let Some(shared) = target.upgrade() else {
            return;
        };
        let received = {
            let mut inner = shared.lock();
            if inner.state != ProcessState::Running {
                return;
            }
            inner.drain(stream)
        };
        if received {
            Self { shared }.emit_ready_read(stream);
        }
    }

    fn on_writable(target: &Weak<Shared<S>>) {
        let Some(shared) = target.upgrade() else {
            return;
        };
        let mut inner = shared.lock();
        if inner.state == ProcessState::Running {
            inner.flush_stdin();
        }
    }

    fn on_exit(target: &Weak<Shared<S>>, kind: ExitKind) {
        let Some(shared) = target.upgrade() else {
            return;
        };
        let (stdout, stderr, quit) = {
            let mut inner = shared.lock();
            if inner.state != ProcessState::Running {
                debug!(pid = ?inner.pid, "ignoring exit {kind:?} in state {}", inner.state);
                return;
            }
            // Trailing output still sits in the pipes.
            let stdout = inner.drain(Stream::Stdout);
            let stderr = inner.drain(Stream::Stderr);

            let (state, code, message) = match kind {
                ExitKind::Signaled(_) if inner.kill_requested => (
                    ProcessState::Finished,
                    RETURN_KILLED,
                    KILLED_MESSAGE.to_string(),
                ),
                ExitKind::Exited(code) => (ProcessState::Finished, code, String::new()),
                ExitKind::Signaled(signal) => (
                    ProcessState::Crashed,
                    128 + signal,
                    format!("Crashed with signal {signal}"),
                ),
            };
            info!(pid = ?inner.pid, %state, code, "process terminated");
            inner.finish(state, code, message);
            (stdout, stderr, inner.quit_loop_on_finish.then(|| inner.event_loop.clone()))
        };
        Self { shared }.announce_finished(stdout, stderr, quit.flatten());
    }

    fn on_timeout(target: &Weak<Shared<S>>) {
        let Some(shared) = target.upgrade() else {
            return;
        };
        let (stdout, stderr, quit) = {
            let mut inner = shared.lock();
            if inner.state != ProcessState::Running {
                return;
            }
            inner.timer = None;
            let pid = inner.pid;
            warn!(?pid, timeout = ?inner.timeout, "process exceeded its time budget, killing it");
            if let Some(child) = inner.child.as_mut() {
                let result = child.force_kill();
                if !child.wait_reaped(KILL_REAP_TIMEOUT) {
                    warn!(?pid, ?result, "child not reaped after kill");
                }
            }
            let stdout = inner.drain(Stream::Stdout);
            let stderr = inner.drain(Stream::Stderr);
            inner.finish(
                ProcessState::TimedOut,
                RETURN_KILLED,
                TIMED_OUT_MESSAGE.to_string(),
            );
            (stdout, stderr, inner.quit_loop_on_finish.then(|| inner.event_loop.clone()))
        };
        Self { shared }.announce_finished(stdout, stderr, quit.flatten());
    }

    /// Kill and reap the child, then finish without going through the loop.
    fn abandon(&self) {
        let (stdout, stderr) = {
            let mut inner = self.shared.lock();
            if inner.state != ProcessState::Running {
                return;
            }
            let pid = inner.pid;
            if let Some(child) = inner.child.as_mut() {
                let result = child.force_kill();
                if !child.wait_reaped(KILL_REAP_TIMEOUT) {
                    warn!(?pid, ?result, "child not reaped after kill");
                }
            }
            let stdout = inner.drain(Stream::Stdout);
            let stderr = inner.drain(Stream::Stderr);
            inner.finish(
                ProcessState::Finished,
                RETURN_KILLED,
                KILLED_MESSAGE.to_string(),
            );
            (stdout, stderr)
        };
        self.announce_finished(stdout, stderr, None);
    }

    fn emit_ready_read(&self, stream: Stream) {
        match stream {
            Stream::Stdout => self.shared.ready_read_stdout.emit(self),
            Stream::Stderr => self.shared.ready_read_stderr.emit(self),
        }
    }

    fn announce_finished(&self, stdout: bool, stderr: bool, quit: Option<WeakEventLoop>) {
        if stdout {
            self.emit_ready_read(Stream::Stdout);
        }
        if stderr {
            self.emit_ready_read(Stream::Stderr);
        }
        self.shared.finished.emit(self);
        if let Some(event_loop) = quit.as_ref().and_then(WeakEventLoop::upgrade) {
            event_loop.quit();
        }
    }
}

fn config_for<A: AsRef<str>, E: AsRef<str>>(
    command: &str,
    args: &[A],
    env: Option<&[E]>,
    timeout: Option<Duration>,
) -> ProcessConfig {
    ProcessConfig {
        command: command.to_string(),
        args: args.iter().map(|a| a.as_ref().to_string()).collect(),
        env: env.map(|entries| entries.iter().map(|e| e.as_ref().to_string()).collect()),
        timeout_ms: timeout
            .filter(|t| !t.is_zero())
            .map(|t| u64::try_from(t.as_millis().max(1)).unwrap_or(u64::MAX)),
        ..Default::default()
    }
}

impl<S: ProcessSpawner> Drop for Shared<S> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.state != ProcessState::Running {
            return;
        }
        warn!(pid = ?inner.pid, "process handle dropped while running, killing the child");
        if let Some(child) = inner.child.as_mut() {
            child.force_kill();
        }
        inner.release();
    }
}

impl<S: ProcessSpawner> fmt::Debug for Supervisor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Supervisor")
            .field("id", &self.shared.id)
            .field("state", &inner.state)
            .field("pid", &inner.pid)
            .field("command", &inner.command)
            .finish()
    }
}
