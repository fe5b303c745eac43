//! Single-threaded reactor multiplexing descriptors, timers and posted work
//!
//! Each iteration waits on the platform readiness primitive (through `mio`)
//! for at most the smallest of: the nearest timer deadline, the remaining
//! `exec` budget, or zero when posted callbacks are pending. After the wait
//! it runs, in this order:
//!
//! 1. posted callbacks (FIFO),
//! 2. expired timers (by deadline, then by id),
//! 3. readiness callbacks for every ready descriptor, in ascending
//!    registration sequence.
//!
//! Callbacks are invoked with no internal lock held, so they may register,
//! replace or unregister anything, including their own registration.

use crate::error::LoopError;
use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token, Waker};
use nix::errno::Errno;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Raw OS descriptor watched by the loop. The loop never owns it.
pub type Descriptor = RawFd;

const WAKE_TOKEN: Token = Token(0);
const DEFAULT_EVENT_CAPACITY: usize = 256;

static MAIN_LOOP: Mutex<Option<WeakEventLoop>> = Mutex::new(None);

thread_local! {
    static CURRENT: RefCell<Option<WeakEventLoop>> = const { RefCell::new(None) };
}

/// Readiness a descriptor registration is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);
    pub const READ_WRITE: Interest = Interest(0b11);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    fn to_mio(self) -> mio::Interest {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
            (false, true) => mio::Interest::WRITABLE,
            _ => mio::Interest::READABLE,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// What the platform reported for a descriptor. Errors and hang-ups are
/// always delivered, whatever the registered interest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            hangup: event.is_read_closed() || event.is_write_closed(),
        }
    }

    fn masked(self, interest: Interest) -> Self {
        Self {
            readable: self.readable && interest.is_readable(),
            writable: self.writable && interest.is_writable(),
            ..self
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.error || self.hangup)
    }
}

/// Identifier of an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Role a loop was bound to by [`EventLoop::init`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// The process-wide main loop. At most one is registered at a time.
    Main,
    /// Any auxiliary loop.
    Secondary,
}

type DescriptorCallback = Arc<dyn Fn(&EventLoop, Descriptor, Readiness) + Send + Sync>;
type TimerCallback = Arc<dyn Fn(&EventLoop, TimerId) + Send + Sync>;
type PostedCallback = Box<dyn FnOnce(&EventLoop) + Send>;

struct DescriptorEntry {
    seq: u64,
    interest: Interest,
    callback: DescriptorCallback,
}

#[derive(Default)]
struct Registrations {
    by_fd: HashMap<Descriptor, DescriptorEntry>,
    by_token: HashMap<usize, Descriptor>,
}

struct TimerEntry {
    /// `None` when the interval is too far out to represent; never fires.
    deadline: Option<Instant>,
    interval: Duration,
    repeating: bool,
    callback: TimerCallback,
}

struct Poller {
    poll: Poll,
    events: Events,
}

struct LoopShared {
    poller: Mutex<Poller>,
    registry: Registry,
    waker: Waker,
    posted: Mutex<VecDeque<PostedCallback>>,
    registrations: Mutex<Registrations>,
    timers: Mutex<HashMap<TimerId, TimerEntry>>,
    next_seq: AtomicU64,
    next_timer: AtomicU64,
    running: AtomicBool,
    stop: AtomicBool,
    mode: Mutex<Option<LoopMode>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to a reactor. Cloning yields another handle to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

/// Non-owning reference to an [`EventLoop`]
#[derive(Clone)]
pub struct WeakEventLoop {
    shared: Weak<LoopShared>,
}

impl WeakEventLoop {
    pub fn upgrade(&self) -> Option<EventLoop> {
        self.shared.upgrade().map(|shared| EventLoop { shared })
    }
}

impl fmt::Debug for WeakEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEventLoop")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> Result<Self, LoopError> {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a loop whose readiness wait reports at most `capacity` events per pass
    pub fn with_event_capacity(capacity: usize) -> Result<Self, LoopError> {
        let poll = Poll::new().map_err(LoopError::Create)?;
        let registry = poll.registry().try_clone().map_err(LoopError::Create)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(LoopError::Create)?;

        Ok(Self {
            shared: Arc::new(LoopShared {
                poller: Mutex::new(Poller {
                    poll,
                    events: Events::with_capacity(capacity.max(1)),
                }),
                registry,
                waker,
                posted: Mutex::new(VecDeque::new()),
                registrations: Mutex::new(Registrations::default()),
                timers: Mutex::new(HashMap::new()),
                // Sequence 0 is the waker token.
                next_seq: AtomicU64::new(1),
                next_timer: AtomicU64::new(1),
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                mode: Mutex::new(None),
            }),
        })
    }

    /// Bind this loop as the process-wide main loop or as a secondary loop.
    ///
    /// Either way the loop becomes the current loop of the calling thread.
    /// Only one main loop may be registered at a time; release it with
    /// [`EventLoop::clear_main`].
    pub fn init(&self, mode: LoopMode) -> Result<(), LoopError> {
        if mode == LoopMode::Main {
            let mut main = lock(&MAIN_LOOP);
            if let Some(existing) = main.as_ref().and_then(WeakEventLoop::upgrade)
                && !existing.ptr_eq(self)
            {
                return Err(LoopError::MainLoopAlreadySet);
            }
            *main = Some(self.downgrade());
        }
        *lock(&self.shared.mode) = Some(mode);
        CURRENT.with(|current| *current.borrow_mut() = Some(self.downgrade()));
        debug!("event loop initialised as {mode:?}");
        Ok(())
    }

    /// The registered main loop, if one is alive
    pub fn main() -> Option<EventLoop> {
        lock(&MAIN_LOOP).as_ref().and_then(WeakEventLoop::upgrade)
    }

    /// Forget the registered main loop so another one may be initialised
    pub fn clear_main() {
        lock(&MAIN_LOOP).take();
    }

    /// The loop bound to (or running on) the calling thread
    pub fn current() -> Option<EventLoop> {
        CURRENT.with(|current| current.borrow().as_ref().and_then(WeakEventLoop::upgrade))
    }

    pub fn mode(&self) -> Option<LoopMode> {
        *lock(&self.shared.mode)
    }

    pub fn is_main(&self) -> bool {
        Self::main().is_some_and(|main| main.ptr_eq(self))
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn ptr_eq(&self, other: &EventLoop) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Watch `descriptor` for the given readiness.
    ///
    /// Notification is edge-triggered: the callback runs when the descriptor
    /// becomes ready, not while it stays ready. A callback must consume until
    /// `WouldBlock`, or it will not be called again for data already pending.
    ///
    /// Registering an already watched descriptor replaces its interest and
    /// callback in place, keeping its position in the dispatch order. A
    /// descriptor that is already closed is silently ignored.
    pub fn register_descriptor<F>(
        &self,
        descriptor: Descriptor,
        interest: Interest,
        callback: F,
    ) -> Result<(), LoopError>
    where
        F: Fn(&EventLoop, Descriptor, Readiness) + Send + Sync + 'static,
    {
        let callback: DescriptorCallback = Arc::new(callback);
        let mut guard = lock(&self.shared.registrations);
        let registrations = &mut *guard;

        let result = match registrations.by_fd.get_mut(&descriptor) {
            Some(entry) => {
                let result = self.shared.registry.reregister(
                    &mut SourceFd(&descriptor),
                    Token(entry.seq as usize),
                    interest.to_mio(),
                );
                if result.is_ok() {
                    entry.interest = interest;
                    entry.callback = callback;
                }
                result
            }
            None => {
                let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
                let result = self.shared.registry.register(
                    &mut SourceFd(&descriptor),
                    Token(seq as usize),
                    interest.to_mio(),
                );
                if result.is_ok() {
                    registrations.by_token.insert(seq as usize, descriptor);
                    registrations.by_fd.insert(
                        descriptor,
                        DescriptorEntry {
                            seq,
                            interest,
                            callback,
                        },
                    );
                }
                result
            }
        };

        match result {
            Ok(()) => {
                trace!("registered fd {descriptor} for {interest:?}");
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(Errno::EBADF as i32) => {
                debug!("fd {descriptor} is closed, ignoring registration");
                Ok(())
            }
            Err(e) => {
                warn!("failed to register fd {descriptor}: {e}");
                Err(LoopError::Register(e))
            }
        }
    }

    /// Stop watching `descriptor`. Returns false if it was not registered.
    pub fn unregister_descriptor(&self, descriptor: Descriptor) -> bool {
        let mut registrations = lock(&self.shared.registrations);
        let Some(entry) = registrations.by_fd.remove(&descriptor) else {
            return false;
        };
        registrations.by_token.remove(&(entry.seq as usize));

        // The kernel drops the interest by itself when the descriptor was closed first.
        if let Err(e) = self.shared.registry.deregister(&mut SourceFd(&descriptor)) {
            debug!("deregistering fd {descriptor}: {e}");
        }
        trace!("unregistered fd {descriptor}");
        true
    }

    pub fn is_registered(&self, descriptor: Descriptor) -> bool {
        lock(&self.shared.registrations)
            .by_fd
            .contains_key(&descriptor)
    }

    /// Arm a timer firing after `interval`, and then every `interval` when `repeating`.
    ///
    /// A one-shot timer is disarmed before its callback runs, so the callback
    /// may arm a new one.
    pub fn register_timer<F>(&self, interval: Duration, repeating: bool, callback: F) -> TimerId
    where
        F: Fn(&EventLoop, TimerId) + Send + Sync + 'static,
    {
        let id = TimerId(self.shared.next_timer.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.timers).insert(
            id,
            TimerEntry {
                deadline: Instant::now().checked_add(interval),
                interval,
                repeating,
                callback: Arc::new(callback),
            },
        );
        // A loop blocked on an older budget must recompute it.
        self.wake();
        id
    }

    /// Disarm a timer. Returns false if it already fired (one-shot) or never existed.
    pub fn unregister_timer(&self, id: TimerId) -> bool {
        lock(&self.shared.timers).remove(&id).is_some()
    }

    /// Queue `callback` to run on this loop's thread during its next iteration.
    ///
    /// Safe to call from any thread; wakes the loop if it is blocked.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce(&EventLoop) + Send + 'static,
    {
        lock(&self.shared.posted).push_back(Box::new(callback));
        self.wake();
    }

    /// Ask the running `exec` to return after the current iteration.
    ///
    /// A quit issued while the loop is idle makes the next `exec` return
    /// after its first pass.
    pub fn quit(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.wake();
    }

    /// Run iterations until [`EventLoop::quit`] is called or `timeout` elapses.
    ///
    /// `None` runs until quit. Calling `exec` on a loop that is already
    /// running fails with [`LoopError::Reentrant`]. A failure of the
    /// readiness primitive aborts the loop.
    pub fn exec(&self, timeout: Option<Duration>) -> Result<(), LoopError> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(LoopError::Reentrant);
        }
        let _guard = RunGuard::enter(self);
        // A budget past the representable range runs until quit.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        debug!("event loop running (timeout={timeout:?})");

        loop {
            let ready = self.wait(self.wait_budget(deadline))?;
            self.run_posted();
            self.fire_timers();
            self.dispatch(ready);

            if self.shared.stop.load(Ordering::Acquire) {
                debug!("event loop quit requested");
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
        }
        Ok(())
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            warn!("failed to wake event loop: {e}");
        }
    }

    fn wait_budget(&self, deadline: Option<Instant>) -> Option<Duration> {
        if self.shared.stop.load(Ordering::Acquire) || !lock(&self.shared.posted).is_empty() {
            return Some(Duration::ZERO);
        }

        let now = Instant::now();
        let nearest_timer = lock(&self.shared.timers)
            .values()
            .filter_map(|timer| timer.deadline)
            .min();

        [deadline, nearest_timer]
            .into_iter()
            .flatten()
            .map(|d| d.saturating_duration_since(now))
            .min()
    }

    fn wait(&self, budget: Option<Duration>) -> Result<Vec<(usize, Readiness)>, LoopError> {
        let mut poller = lock(&self.shared.poller);
        let Poller { poll, events } = &mut *poller;

        if let Err(e) = poll.poll(events, budget) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            error!("readiness wait failed, aborting event loop: {e}");
            return Err(LoopError::Poll(e));
        }

        Ok(events
            .iter()
            .filter(|event| event.token() != WAKE_TOKEN)
            .map(|event| (event.token().0, Readiness::from_event(event)))
            .collect())
    }

    fn run_posted(&self) {
        let batch: Vec<PostedCallback> = lock(&self.shared.posted).drain(..).collect();
        for callback in batch {
            callback(self);
        }
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        let mut expired: Vec<(Instant, TimerId)> = lock(&self.shared.timers)
            .iter()
            .filter_map(|(id, timer)| {
                let deadline = timer.deadline.filter(|d| *d <= now)?;
                Some((deadline, *id))
            })
            .collect();
        expired.sort();

        for (_, id) in expired {
            let callback = {
                let mut timers = lock(&self.shared.timers);
                match timers.get_mut(&id) {
                    Some(timer) if timer.repeating => {
                        timer.deadline = now.checked_add(timer.interval);
                        timer.callback.clone()
                    }
                    Some(_) => match timers.remove(&id) {
                        Some(timer) => timer.callback,
                        None => continue,
                    },
                    // Disarmed by an earlier callback in this pass.
                    None => continue,
                }
            };
            callback(self, id);
        }
    }

    fn dispatch(&self, ready: Vec<(usize, Readiness)>) {
        let mut ordered: Vec<(u64, Descriptor, Readiness)> = {
            let registrations = lock(&self.shared.registrations);
            ready
                .into_iter()
                .filter_map(|(token, readiness)| {
                    let fd = *registrations.by_token.get(&token)?;
                    Some((token as u64, fd, readiness))
                })
                .collect()
        };
        ordered.sort_by_key(|(seq, _, _)| *seq);

        for (seq, fd, readiness) in ordered {
            // Re-resolve at call time: an earlier callback may have replaced
            // or removed this registration.
            let resolved = lock(&self.shared.registrations)
                .by_fd
                .get(&fd)
                .filter(|entry| entry.seq == seq)
                .map(|entry| (entry.callback.clone(), readiness.masked(entry.interest)));

            if let Some((callback, readiness)) = resolved
                && !readiness.is_empty()
            {
                callback(self, fd, readiness);
            }
        }
    }
}

/// Marks a loop as running on the calling thread for the duration of `exec`
struct RunGuard<'a> {
    event_loop: &'a EventLoop,
    previous: Option<WeakEventLoop>,
}

impl<'a> RunGuard<'a> {
    fn enter(event_loop: &'a EventLoop) -> Self {
        let previous =
            CURRENT.with(|current| current.borrow_mut().replace(event_loop.downgrade()));
        Self {
            event_loop,
            previous,
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
        self.event_loop.shared.stop.store(false, Ordering::Release);
        self.event_loop.shared.running.store(false, Ordering::Release);
        debug!("event loop stopped");
    }
}

impl Drop for LoopShared {
    fn drop(&mut self) {
        let registrations = self
            .registrations
            .get_mut()
            .map(|r| r.by_fd.len())
            .unwrap_or_default();
        if registrations > 0 {
            info!("event loop destroyed with {registrations} descriptor registration(s) pending");
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("mode", &self.mode())
            .field("running", &self.is_running())
            .field(
                "descriptors",
                &lock(&self.shared.registrations).by_fd.len(),
            )
            .field("timers", &lock(&self.shared.timers).len())
            .finish()
    }
}
