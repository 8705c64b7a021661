//! Execution contexts: named task inboxes drained in order by their owner.
//!
//! A context is the unit callers are "called back on". Whoever owns the
//! [`ContextLoop`] decides how it is drained: an async task (`run`), a UI
//! loop pumping it between frames (`run_pending`) or a dedicated thread
//! (`spawn_thread`). Posting never blocks and never fails loudly.

use crate::core::error::panic_message;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

pub type ContextId = Uuid;

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT: RefCell<Option<ContextHandle>> = const { RefCell::new(None) };
}

/// Create a context. The handle posts into it; the loop drains it.
pub fn channel(name: impl Into<String>) -> (ContextHandle, ContextLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = Uuid::new_v4();
    let name: Arc<str> = Arc::from(name.into());
    let handle = ContextHandle { id, name: name.clone(), inbox: tx };
    let ctx_loop = ContextLoop {
        id,
        name,
        inbox: rx,
        self_ref: handle.inbox.downgrade(),
    };
    (handle, ctx_loop)
}

#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    name: Arc<str>,
    inbox: mpsc::UnboundedSender<Task>,
}

impl ContextHandle {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `task` behind everything already posted. Returns `false` when the
    /// loop has been dropped; the task is discarded in that case.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inbox.send(Box::new(task)).is_err() {
            debug!(context = %self.name, "context is gone, dropping task");
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// The context whose task is running on this thread, if any.
    pub fn current() -> Option<ContextHandle> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Mark this thread as running on `self` until the guard drops.
    ///
    /// Useful for a thread that owns a loop and also calls into the facade
    /// outside of posted tasks.
    pub fn enter(&self) -> ContextGuard {
        let prev = CURRENT.with(|c| c.replace(Some(self.clone())));
        ContextGuard { prev, _not_send: PhantomData }
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContextHandle {}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

pub struct ContextGuard {
    prev: Option<ContextHandle>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

pub struct ContextLoop {
    id: ContextId,
    name: Arc<str>,
    inbox: mpsc::UnboundedReceiver<Task>,
    self_ref: mpsc::WeakUnboundedSender<Task>,
}

impl ContextLoop {
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Drain tasks until every handle is dropped.
    pub async fn run(&mut self) {
        while let Some(task) = self.inbox.recv().await {
            self.execute(task);
        }
        debug!(context = %self.name, "context loop finished");
    }

    /// Run whatever is queued right now and return how many tasks ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.inbox.try_recv() {
            self.execute(task);
            ran += 1;
        }
        ran
    }

    /// Blocking drain for a thread dedicated to this context. Must not be
    /// called from inside an async runtime.
    pub fn run_blocking(mut self) {
        while let Some(task) = self.inbox.blocking_recv() {
            self.execute(task);
        }
        debug!(context = %self.name, "context loop finished");
    }

    pub fn spawn_thread(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || self.run_blocking())
    }

    fn execute(&self, task: Task) {
        let handle = self.self_ref.upgrade().map(|inbox| ContextHandle {
            id: self.id,
            name: self.name.clone(),
            inbox,
        });
        let _guard = handle.as_ref().map(ContextHandle::enter);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            error!(context = %self.name, panic = %panic_message(&*payload), "task panicked");
        }
    }
}

impl fmt::Debug for ContextLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextLoop")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_tasks_run_in_post_order() {
        let (ctx, mut ctx_loop) = channel("ui");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            assert!(ctx.post(move || seen.lock().unwrap().push(i)));
        }
        assert_eq!(ctx_loop.run_pending(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(ctx_loop.run_pending(), 0);
    }

    #[test]
    fn test_current_is_set_while_task_runs() {
        let (ctx, mut ctx_loop) = channel("ui");
        let observed = Arc::new(Mutex::new(None));
        let observed2 = observed.clone();
        ctx.post(move || {
            *observed2.lock().unwrap() = ContextHandle::current().map(|c| c.id());
        });
        assert!(ContextHandle::current().is_none());
        ctx_loop.run_pending();
        assert_eq!(*observed.lock().unwrap(), Some(ctx.id()));
        assert!(ContextHandle::current().is_none());
    }

    #[test]
    fn test_enter_guard_nests_and_restores() {
        let (a, _a_loop) = channel("a");
        let (b, _b_loop) = channel("b");
        {
            let _outer = a.enter();
            assert_eq!(ContextHandle::current(), Some(a.clone()));
            {
                let _inner = b.enter();
                assert_eq!(ContextHandle::current(), Some(b.clone()));
            }
            assert_eq!(ContextHandle::current(), Some(a.clone()));
        }
        assert!(ContextHandle::current().is_none());
    }

    #[test]
    fn test_post_after_loop_dropped_is_noop() {
        let (ctx, ctx_loop) = channel("gone");
        drop(ctx_loop);
        assert!(ctx.is_closed());
        assert!(!ctx.post(|| panic!("must not run")));
    }

    #[test]
    fn test_panicking_task_does_not_stop_loop() {
        let (ctx, mut ctx_loop) = channel("ui");
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        ctx.post(|| panic!("listener blew up"));
        ctx.post(move || *ran2.lock().unwrap() = true);
        assert_eq!(ctx_loop.run_pending(), 2);
        assert!(*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_run_finishes_when_handles_dropped() {
        let (ctx, mut ctx_loop) = channel("ui");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            ctx.post(move || seen.lock().unwrap().push(i));
        }
        drop(ctx);
        ctx_loop.run().await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_spawned_thread_drains_on_named_thread() {
        let (ctx, ctx_loop) = channel("fetch-test-main");
        let join = ctx_loop.spawn_thread().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        ctx.post(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        });
        let name = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("fetch-test-main"));
        drop(ctx);
        join.join().unwrap();
    }
}
