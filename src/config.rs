use crate::core::context::ContextHandle;

/// Default capacity of the broadcast stream behind `Fetch::subscribe`.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

pub const DEFAULT_WORKER_NAME: &str = "fetch-worker";

pub const DEFAULT_MAIN_CONTEXT_NAME: &str = "fetch-main";

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Thread name of the command worker.
    pub worker_name: String,
    /// `None` keeps the command queue unbounded; `Some(n)` rejects
    /// submissions with `QueueFull` once `n` commands are waiting.
    pub queue_capacity: Option<usize>,
    /// Context that receives listener events and, when the caller is not
    /// running on a context of its own, callback and query results. When
    /// unset, the facade drains its own `fetch-main` thread.
    pub main_context: Option<ContextHandle>,
    pub event_buffer: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            worker_name: DEFAULT_WORKER_NAME.to_string(),
            queue_capacity: None,
            main_context: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl FetchConfig {
    pub fn with_main_context(mut self, ctx: ContextHandle) -> Self {
        self.main_context = Some(ctx);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }
}
