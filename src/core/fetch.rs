//! The `Fetch` facade.
//!
//! Every operation validates its arguments on the caller's thread, wraps the
//! engine call in a command and returns without waiting. Results meant for
//! the caller are posted back to the context the call was made from (or the
//! main context when the caller is not running on one). Lifecycle events
//! from the engine always land on the main context.

use crate::config::{FetchConfig, DEFAULT_MAIN_CONTEXT_NAME};
use crate::core::context::{self, ContextHandle};
use crate::core::engine::{EventSink, FetchEngine};
use crate::core::error::{EngineError, FetchError};
use crate::core::events::DownloadEvent;
use crate::core::listeners::{FetchListener, ListenerRegistry};
use crate::core::model::{DownloadId, Request, RequestData, Status, Target};
use crate::core::queue::CommandQueue;
use crate::core::redirect::{redirect_once_to, redirect_to};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Outcome handler for enqueue operations. For a list, it is told once per
/// request, in list order.
pub trait Callback: Send + Sync + 'static {
    fn on_queued(&self, request: &Request);
    fn on_failure(&self, request: &Request, error: &EngineError);
}

type Engine = Box<dyn FetchEngine>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Pause,
    Resume,
    Retry,
    Cancel,
    Remove,
    Delete,
}

impl Action {
    fn name(self) -> &'static str {
        match self {
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Retry => "retry",
            Action::Cancel => "cancel",
            Action::Remove => "remove",
            Action::Delete => "delete",
        }
    }

    fn apply(self, engine: &mut dyn FetchEngine, target: Target) -> BoxFuture<'_, Result<(), EngineError>> {
        match self {
            Action::Pause => engine.pause(target),
            Action::Resume => engine.resume(target),
            Action::Retry => engine.retry(target),
            Action::Cancel => engine.cancel(target),
            Action::Remove => engine.remove(target),
            Action::Delete => engine.delete(target),
        }
    }
}

pub struct Fetch {
    queue: CommandQueue<Engine>,
    listeners: Arc<ListenerRegistry>,
    main: ContextHandle,
    events: broadcast::Sender<DownloadEvent>,
}

impl Fetch {
    pub(crate) fn new<E, F>(config: FetchConfig, factory: F) -> Result<Self, FetchError>
    where
        E: FetchEngine,
        F: FnOnce(EventSink) -> E,
    {
        let main = match config.main_context {
            Some(ctx) => ctx,
            None => {
                let (ctx, ctx_loop) = context::channel(DEFAULT_MAIN_CONTEXT_NAME);
                ctx_loop
                    .spawn_thread()
                    .map_err(|e| FetchError::WorkerSpawn(e.to_string()))?;
                ctx
            }
        };

        let listeners = Arc::new(ListenerRegistry::new());
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let sink = EventSink::new(main.clone(), listeners.clone(), events.clone());
        let engine: Engine = Box::new(factory(sink));

        info!(
            worker = %config.worker_name,
            main = %main.name(),
            queue_capacity = ?config.queue_capacity,
            "fetch ready"
        );

        Ok(Self {
            queue: CommandQueue::new(config.worker_name, engine, config.queue_capacity),
            listeners,
            main,
            events,
        })
    }

    pub fn enqueue(&self, request: Request) -> Result<(), FetchError> {
        let id = request.id;
        debug!(id, "enqueue");
        self.submit(move |engine| {
            async move {
                if let Err(e) = guarded(engine.enqueue(request)).await.and_then(|r| r) {
                    warn!(id, error = %e, "enqueue failed");
                }
            }
            .boxed()
        })
    }

    pub fn enqueue_with_callback<C: Callback>(&self, request: Request, callback: C) -> Result<(), FetchError> {
        debug!(id = request.id, "enqueue with callback");
        let notify = self.enqueue_notifier(Arc::new(callback));
        self.submit(move |engine| {
            async move {
                let outcome = guarded(engine.enqueue(request.clone())).await.and_then(|r| r);
                notify((request, outcome));
            }
            .boxed()
        })
    }

    pub fn enqueue_all(&self, requests: Vec<Request>) -> Result<(), FetchError> {
        ensure_not_empty(&requests, "request list")?;
        debug!(count = requests.len(), "enqueue batch");
        self.submit(move |engine| {
            async move {
                let ids: Vec<DownloadId> = requests.iter().map(|r| r.id).collect();
                match guarded(engine.enqueue_batch(requests)).await {
                    Ok(outcomes) => {
                        for (id, outcome) in ids.into_iter().zip(outcomes) {
                            if let Err(e) = outcome {
                                warn!(id, error = %e, "enqueue failed");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "enqueue batch failed"),
                }
            }
            .boxed()
        })
    }

    pub fn enqueue_all_with_callback<C: Callback>(&self, requests: Vec<Request>, callback: C) -> Result<(), FetchError> {
        ensure_not_empty(&requests, "request list")?;
        debug!(count = requests.len(), "enqueue batch with callback");
        let notify = self.enqueue_notifier(Arc::new(callback));
        self.submit(move |engine| {
            async move {
                let outcomes = match guarded(engine.enqueue_batch(requests.clone())).await {
                    Ok(outcomes) => outcomes,
                    Err(e) => vec![Err(e); requests.len()],
                };
                let mut outcomes = outcomes.into_iter();
                for request in requests {
                    let outcome = outcomes
                        .next()
                        .unwrap_or_else(|| Err(EngineError::new("engine reported no outcome for request")));
                    notify((request, outcome));
                }
            }
            .boxed()
        })
    }

    pub fn pause(&self, id: DownloadId) -> Result<(), FetchError> {
        self.control(Action::Pause, Target::Id(id))
    }

    pub fn pause_group(&self, group_id: impl Into<String>) -> Result<(), FetchError> {
        self.control(Action::Pause, Target::Group(group_id.into()))
    }

    pub fn pause_all(&self) -> Result<(), FetchError> {
        self.control(Action::Pause, Target::All)
    }

    pub fn resume(&self, id: DownloadId) -> Result<(), FetchError> {
        self.control(Action::Resume, Target::Id(id))
    }

    pub fn resume_group(&self, group_id: impl Into<String>) -> Result<(), FetchError> {
        self.control(Action::Resume, Target::Group(group_id.into()))
    }

    pub fn resume_all(&self) -> Result<(), FetchError> {
        self.control(Action::Resume, Target::All)
    }

    pub fn retry(&self, id: DownloadId) -> Result<(), FetchError> {
        self.control(Action::Retry, Target::Id(id))
    }

    pub fn retry_group(&self, group_id: impl Into<String>) -> Result<(), FetchError> {
        self.control(Action::Retry, Target::Group(group_id.into()))
    }

    pub fn retry_all(&self) -> Result<(), FetchError> {
        self.control(Action::Retry, Target::All)
    }

    pub fn cancel(&self, id: DownloadId) -> Result<(), FetchError> {
        self.control(Action::Cancel, Target::Id(id))
    }

    pub fn cancel_group(&self, group_id: impl Into<String>) -> Result<(), FetchError> {
        self.control(Action::Cancel, Target::Group(group_id.into()))
    }

    pub fn cancel_all(&self) -> Result<(), FetchError> {
        self.control(Action::Cancel, Target::All)
    }

    pub fn remove(&self, id: DownloadId) -> Result<(), FetchError> {
        self.control(Action::Remove, Target::Id(id))
    }

    pub fn remove_group(&self, group_id: impl Into<String>) -> Result<(), FetchError> {
        self.control(Action::Remove, Target::Group(group_id.into()))
    }

    pub fn remove_all(&self) -> Result<(), FetchError> {
        self.control(Action::Remove, Target::All)
    }

    pub fn delete(&self, id: DownloadId) -> Result<(), FetchError> {
        self.control(Action::Delete, Target::Id(id))
    }

    pub fn delete_group(&self, group_id: impl Into<String>) -> Result<(), FetchError> {
        self.control(Action::Delete, Target::Group(group_id.into()))
    }

    pub fn delete_all(&self) -> Result<(), FetchError> {
        self.control(Action::Delete, Target::All)
    }

    pub fn query<Q>(&self, id: DownloadId, query: Q) -> Result<(), FetchError>
    where
        Q: FnOnce(Option<RequestData>) + Send + 'static,
    {
        self.ask(query, move |engine| engine.query(id))
    }

    pub fn query_many<Q>(&self, ids: Vec<DownloadId>, query: Q) -> Result<(), FetchError>
    where
        Q: FnOnce(Option<Vec<RequestData>>) + Send + 'static,
    {
        ensure_not_empty(&ids, "id list")?;
        self.ask(query, move |engine| engine.query_many(ids).map(Some).boxed())
    }

    pub fn query_all<Q>(&self, query: Q) -> Result<(), FetchError>
    where
        Q: FnOnce(Option<Vec<RequestData>>) + Send + 'static,
    {
        self.ask(query, |engine| engine.query_all().map(Some).boxed())
    }

    pub fn query_by_status<Q>(&self, status: Status, query: Q) -> Result<(), FetchError>
    where
        Q: FnOnce(Option<Vec<RequestData>>) + Send + 'static,
    {
        self.ask(query, move |engine| engine.query_by_status(status).map(Some).boxed())
    }

    pub fn query_by_group_id<Q>(&self, group_id: impl Into<String>, query: Q) -> Result<(), FetchError>
    where
        Q: FnOnce(Option<Vec<RequestData>>) + Send + 'static,
    {
        let group_id = group_id.into();
        ensure_group(&group_id)?;
        self.ask(query, move |engine| engine.query_by_group(group_id).map(Some).boxed())
    }

    pub fn query_group_by_status<Q>(&self, group_id: impl Into<String>, status: Status, query: Q) -> Result<(), FetchError>
    where
        Q: FnOnce(Option<Vec<RequestData>>) + Send + 'static,
    {
        let group_id = group_id.into();
        ensure_group(&group_id)?;
        self.ask(query, move |engine| {
            engine.query_group_by_status(group_id, status).map(Some).boxed()
        })
    }

    pub fn contains<Q>(&self, id: DownloadId, query: Q) -> Result<(), FetchError>
    where
        Q: FnOnce(Option<bool>) + Send + 'static,
    {
        self.ask(query, move |engine| engine.contains(id).map(Some).boxed())
    }

    /// Registers `listener` and calls its `on_attach` before returning.
    /// Returns `false` if it was already registered. The facade only keeps a
    /// weak handle: dropping the last `Arc` silently unregisters it.
    pub fn add_listener<L: FetchListener>(&self, listener: &Arc<L>) -> bool {
        self.listeners.add(listener.clone(), self)
    }

    pub fn remove_listener<L: FetchListener>(&self, listener: &Arc<L>) -> bool {
        let listener: Arc<dyn FetchListener> = listener.clone();
        self.listeners.remove(&listener, self)
    }

    pub fn remove_listeners(&self) -> usize {
        self.listeners.clear(self)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Async view of the event stream. Receivers that fall behind miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    pub fn main_context(&self) -> &ContextHandle {
        &self.main
    }

    /// Stop accepting commands. Already accepted commands still run; join the
    /// returned handle to wait for them.
    pub fn shutdown(&self) -> Option<JoinHandle<()>> {
        info!("fetch shutting down");
        self.queue.shutdown()
    }

    pub(crate) fn submit<F>(&self, command: F) -> Result<(), FetchError>
    where
        F: for<'a> FnOnce(&'a mut Engine) -> BoxFuture<'a, ()> + Send + 'static,
    {
        self.queue.submit(command)
    }

    fn control(&self, action: Action, target: Target) -> Result<(), FetchError> {
        if let Target::Group(group_id) = &target {
            ensure_group(group_id)?;
        }
        debug!(action = action.name(), ?target, "control");
        self.submit(move |engine| {
            async move {
                let result = guarded(action.apply(&mut **engine, target.clone())).await;
                if let Err(e) = result.and_then(|r| r) {
                    warn!(action = action.name(), ?target, error = %e, "engine rejected command");
                }
            }
            .boxed()
        })
    }

    fn ask<T, Q, F>(&self, query: Q, call: F) -> Result<(), FetchError>
    where
        T: Send + 'static,
        Q: FnOnce(Option<T>) + Send + 'static,
        F: for<'a> FnOnce(&'a mut dyn FetchEngine) -> BoxFuture<'a, Option<T>> + Send + 'static,
    {
        let deliver = redirect_once_to(&self.origin(), query);
        self.submit(move |engine| {
            async move {
                let result = guarded(call(&mut **engine)).await.unwrap_or_else(|e| {
                    warn!(error = %e, "query failed");
                    None
                });
                deliver(result);
            }
            .boxed()
        })
    }

    fn enqueue_notifier(
        &self,
        callback: Arc<dyn Callback>,
    ) -> impl Fn((Request, Result<(), EngineError>)) + Send + Sync + 'static {
        redirect_to(&self.origin(), move |(request, outcome): (Request, Result<(), EngineError>)| {
            match outcome {
                Ok(()) => callback.on_queued(&request),
                Err(e) => callback.on_failure(&request, &e),
            }
        })
    }

    fn origin(&self) -> ContextHandle {
        ContextHandle::current().unwrap_or_else(|| self.main.clone())
    }
}

async fn guarded<T>(call: BoxFuture<'_, T>) -> Result<T, EngineError> {
    AssertUnwindSafe(call).catch_unwind().await.map_err(EngineError::panicked)
}

fn ensure_not_empty<T>(items: &[T], what: &str) -> Result<(), FetchError> {
    if items.is_empty() {
        return Err(FetchError::illegal(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn ensure_group(group_id: &str) -> Result<(), FetchError> {
    if group_id.trim().is_empty() {
        return Err(FetchError::illegal("group id must not be empty"));
    }
    Ok(())
}

static INSTANCE: OnceLock<Fetch> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// Create the process-wide `Fetch`. Fails with `AlreadyInitialized` on every
/// call after the first successful one, including after `shutdown`.
pub fn initialize<E, F>(config: FetchConfig, factory: F) -> Result<&'static Fetch, FetchError>
where
    E: FetchEngine,
    F: FnOnce(EventSink) -> E,
{
    let _guard = INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if INSTANCE.get().is_some() {
        return Err(FetchError::AlreadyInitialized);
    }
    let fetch = Fetch::new(config, factory)?;
    Ok(INSTANCE.get_or_init(|| fetch))
}

pub fn instance() -> Result<&'static Fetch, FetchError> {
    INSTANCE.get().ok_or(FetchError::NotInitialized)
}
