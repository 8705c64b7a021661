use std::any::Any;
use thiserror::Error;

/// Errors raised synchronously by the `Fetch` facade and its lifecycle gate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("fetch was already initialized")]
    AlreadyInitialized,

    #[error("fetch was not initialized")]
    NotInitialized,

    #[error("fetch has been shut down")]
    Shutdown,

    /// Only produced when the command queue was configured with a capacity.
    #[error("command queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("failed to start worker: {0}")]
    WorkerSpawn(String),
}

impl FetchError {
    pub(crate) fn illegal(what: impl Into<String>) -> Self {
        Self::IllegalArgument(what.into())
    }
}

/// Opaque failure reported by the engine.
///
/// Never raised across the worker boundary; it reaches callers through a
/// callback's failure path, an absent query result or an `Error` event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        Self::new(format!("engine panicked: {}", panic_message(&*payload)))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(format!("{:#}", e))
    }
}
