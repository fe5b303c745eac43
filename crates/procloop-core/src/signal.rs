use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handle returned by [`Signal::connect`], used to disconnect the listener later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slot<T: ?Sized> {
    id: u64,
    active: Arc<AtomicBool>,
    listener: Listener<T>,
}

/// Typed one-to-many notification channel
///
/// Listeners are invoked synchronously, in the order they were connected.
/// Emission works on a snapshot of the listener list taken when `emit`
/// starts, so a listener connected during delivery only sees the next
/// emission. Every slot also carries an `active` flag checked right before
/// its invocation, so a listener disconnected during delivery (by itself or
/// by an earlier listener) is skipped for the rest of that emission.
pub struct Signal<T: ?Sized> {
    slots: Mutex<Vec<Slot<T>>>,
    next_id: AtomicU64,
}

impl<T: ?Sized> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener; it receives every subsequent emission
    pub fn connect<F>(&self, listener: F) -> Connection
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots().push(Slot {
            id,
            active: Arc::new(AtomicBool::new(true)),
            listener: Arc::new(listener),
        });
        Connection(id)
    }

    /// Remove a listener. Returns false if it was not (or no longer) connected.
    pub fn disconnect(&self, connection: Connection) -> bool {
        let mut slots = self.slots();
        match slots.iter().position(|slot| slot.id == connection.0) {
            Some(index) => {
                let slot = slots.remove(index);
                slot.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Remove every listener without notifying them
    pub fn disconnect_all(&self) {
        for slot in self.slots().drain(..) {
            slot.active.store(false, Ordering::Release);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Deliver `args` to every listener connected at the time of the call
    pub fn emit(&self, args: &T) {
        let snapshot: Vec<(Arc<AtomicBool>, Listener<T>)> = self
            .slots()
            .iter()
            .map(|slot| (slot.active.clone(), slot.listener.clone()))
            .collect();

        // The lock is released here: listeners may connect or disconnect freely.
        for (active, listener) in snapshot {
            if active.load(Ordering::Acquire) {
                listener(args);
            }
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot<T>>> {
        // A listener panicking mid-emission does not hold the lock, so a
        // poisoned mutex still guards a consistent list.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: ?Sized> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
