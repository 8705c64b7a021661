use crate::core::context::ContextHandle;
use crate::core::error::EngineError;
use crate::core::events::DownloadEvent;
use crate::core::listeners::ListenerRegistry;
use crate::core::model::{DownloadId, Request, RequestData, Status, Target};
use crate::core::redirect::redirect_to;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// The download engine behind the facade.
///
/// Every call arrives on the single worker, one at a time, so implementations
/// can keep plain `&mut self` state. Results are returned; the facade relays
/// them to whoever asked. Lifecycle events go through the [`EventSink`] the
/// engine was built with.
#[async_trait]
pub trait FetchEngine: Send + 'static {
    async fn enqueue(&mut self, request: Request) -> Result<(), EngineError>;

    /// One outcome per request, in input order.
    async fn enqueue_batch(&mut self, requests: Vec<Request>) -> Vec<Result<(), EngineError>> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            outcomes.push(self.enqueue(request).await);
        }
        outcomes
    }

    async fn pause(&mut self, target: Target) -> Result<(), EngineError>;
    async fn resume(&mut self, target: Target) -> Result<(), EngineError>;
    async fn retry(&mut self, target: Target) -> Result<(), EngineError>;
    async fn cancel(&mut self, target: Target) -> Result<(), EngineError>;
    async fn remove(&mut self, target: Target) -> Result<(), EngineError>;
    async fn delete(&mut self, target: Target) -> Result<(), EngineError>;

    async fn query(&mut self, id: DownloadId) -> Option<RequestData>;
    async fn query_many(&mut self, ids: Vec<DownloadId>) -> Vec<RequestData>;
    async fn query_all(&mut self) -> Vec<RequestData>;
    async fn query_by_status(&mut self, status: Status) -> Vec<RequestData>;
    async fn query_by_group(&mut self, group_id: String) -> Vec<RequestData>;
    async fn query_group_by_status(&mut self, group_id: String, status: Status) -> Vec<RequestData>;
    async fn contains(&mut self, id: DownloadId) -> bool;
}

/// The engine's only way to report lifecycle events.
///
/// Each event is redirected to the main context, where the listener registry
/// fans it out, and is also published on the broadcast stream returned by
/// `Fetch::subscribe`. Emitting never blocks.
#[derive(Clone)]
pub struct EventSink {
    dispatch: Arc<dyn Fn(DownloadEvent) + Send + Sync>,
    stream: broadcast::Sender<DownloadEvent>,
}

impl EventSink {
    pub(crate) fn new(
        main: ContextHandle,
        listeners: Arc<ListenerRegistry>,
        stream: broadcast::Sender<DownloadEvent>,
    ) -> Self {
        let dispatch = redirect_to(&main, move |event: DownloadEvent| {
            listeners.dispatch(&event);
        });
        Self {
            dispatch: Arc::new(dispatch),
            stream,
        }
    }

    pub fn emit(&self, event: DownloadEvent) {
        trace!(id = event.id(), kind = ?event.kind(), "event");
        let _ = self.stream.send(event.clone());
        (self.dispatch)(event);
    }
}
