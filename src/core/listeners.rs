//! Weakly-held observer registry.
//!
//! The registry never keeps a listener alive: it stores `Weak` handles and
//! skips (then purges) any whose owner has dropped the last `Arc`. Membership
//! is by identity of the `Arc` allocation. The lock is only held to edit or
//! snapshot the slot list, never while listener code runs.

use crate::core::error::{panic_message, EngineError};
use crate::core::events::{DownloadEvent, DownloadProgress};
use crate::core::fetch::Fetch;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error};

/// Lifecycle observer. Every method defaults to doing nothing.
///
/// Event methods run on the facade's main context, in the order the engine
/// raised the events.
pub trait FetchListener: Send + Sync + 'static {
    fn on_attach(&self, _fetch: &Fetch) {}
    fn on_detach(&self, _fetch: &Fetch) {}
    fn on_complete(&self, _progress: &DownloadProgress) {}
    fn on_error(&self, _progress: &DownloadProgress, _error: &EngineError) {}
    fn on_progress(&self, _progress: &DownloadProgress) {}
    fn on_paused(&self, _progress: &DownloadProgress) {}
    fn on_cancelled(&self, _progress: &DownloadProgress) {}
    fn on_removed(&self, _progress: &DownloadProgress) {}
}

struct Slot {
    key: usize,
    listener: Weak<dyn FetchListener>,
    // false while on_attach is still running
    attached: bool,
}

impl Slot {
    fn is_alive(&self) -> bool {
        self.listener.strong_count() > 0
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    slots: Mutex<Vec<Slot>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the listener was already registered.
    ///
    /// `on_attach` runs without the lock held, so it may call back into the
    /// registry. Until it returns the slot is invisible to `remove`, `clear`
    /// and `dispatch`: `on_detach` can never precede `on_attach`.
    pub fn add(&self, listener: Arc<dyn FetchListener>, owner: &Fetch) -> bool {
        let key = key_of(&listener);
        {
            let mut slots = self.lock();
            slots.retain(Slot::is_alive);
            if slots.iter().any(|s| s.key == key) {
                return false;
            }
            slots.push(Slot {
                key,
                listener: Arc::downgrade(&listener),
                attached: false,
            });
        }

        guarded("on_attach", || listener.on_attach(owner));

        if let Some(slot) = self.lock().iter_mut().find(|s| s.key == key) {
            slot.attached = true;
        }
        debug!(listeners = self.len(), "listener attached");
        true
    }

    /// Returns `false` if the listener was not registered.
    pub fn remove(&self, listener: &Arc<dyn FetchListener>, owner: &Fetch) -> bool {
        let key = key_of(listener);
        let removed = {
            let mut slots = self.lock();
            slots
                .iter()
                .position(|s| s.key == key && s.attached && s.is_alive())
                .map(|idx| slots.remove(idx))
        };

        if removed.is_none() {
            return false;
        }
        guarded("on_detach", || listener.on_detach(owner));
        debug!(listeners = self.len(), "listener detached");
        true
    }

    /// Detach everything, in registration order. Returns how many live
    /// listeners were detached; dead handles are dropped silently. Listeners
    /// still inside `on_attach` are left in place.
    pub fn clear(&self, owner: &Fetch) -> usize {
        let slots: Vec<Slot> = {
            let mut slots = self.lock();
            let (attached, pending): (Vec<Slot>, Vec<Slot>) =
                std::mem::take(&mut *slots).into_iter().partition(|s| s.attached);
            *slots = pending;
            attached
        };
        let mut detached = 0;
        for slot in slots {
            if let Some(listener) = slot.listener.upgrade() {
                guarded("on_detach", || listener.on_detach(owner));
                detached += 1;
            }
        }
        detached
    }

    /// Deliver `event` to every live listener in registration order and
    /// return how many were invoked. A panicking listener is logged and
    /// does not stop delivery to the rest.
    pub fn dispatch(&self, event: &DownloadEvent) -> usize {
        let live: Vec<Arc<dyn FetchListener>> = {
            let mut slots = self.lock();
            slots.retain(Slot::is_alive);
            slots
                .iter()
                .filter(|s| s.attached)
                .filter_map(|s| s.listener.upgrade())
                .collect()
        };

        for listener in &live {
            guarded("event", || deliver(listener.as_ref(), event));
        }
        live.len()
    }

    pub fn len(&self) -> usize {
        self.lock().iter().filter(|s| s.is_alive()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key_of(listener: &Arc<dyn FetchListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

fn deliver(listener: &dyn FetchListener, event: &DownloadEvent) {
    match event {
        DownloadEvent::Complete(p) => listener.on_complete(p),
        DownloadEvent::Error { progress, error } => listener.on_error(progress, error),
        DownloadEvent::Progress(p) => listener.on_progress(p),
        DownloadEvent::Paused(p) => listener.on_paused(p),
        DownloadEvent::Cancelled(p) => listener.on_cancelled(p),
        DownloadEvent::Removed(p) => listener.on_removed(p),
    }
}

fn guarded(hook: &'static str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        error!(hook, panic = %panic_message(&*payload), "listener panicked");
    }
}
