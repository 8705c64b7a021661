//! Asynchronous download-manager facade.
//!
//! [`Fetch`] accepts commands from any thread, runs them one at a time on a
//! dedicated worker against a [`FetchEngine`], and hands results back on the
//! caller's execution context. Lifecycle events are fanned out to weakly
//! held [`FetchListener`]s on the main context.

pub mod config;
pub mod core;
pub mod logging;
pub mod plugins;

pub use crate::config::FetchConfig;
pub use crate::core::context::{channel, ContextHandle, ContextLoop};
pub use crate::core::engine::{EventSink, FetchEngine};
pub use crate::core::error::{EngineError, FetchError};
pub use crate::core::events::{DownloadEvent, DownloadProgress, EventKind};
pub use crate::core::fetch::{initialize, instance, Callback, Fetch};
pub use crate::core::listeners::FetchListener;
pub use crate::core::model::{DownloadId, Request, RequestData, Status, Target};
pub use crate::plugins::memory::{MemoryEngine, MemorySettings};
