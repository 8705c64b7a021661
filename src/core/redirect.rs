//! Handler redirection: run a handler on the context that asked for it.
//!
//! The worker never calls user code directly. Anything it produces for a
//! caller goes through one of these combinators, which turn "call handler"
//! into "post handler to context". Posts from the worker happen in command
//! order, so callbacks reach a context in the order their commands ran.

use crate::core::context::ContextHandle;
use std::sync::Arc;

/// Wrap a reusable handler so every invocation is posted to `ctx`.
pub fn redirect_to<T, F>(ctx: &ContextHandle, handler: F) -> impl Fn(T) + Send + Sync + 'static
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let ctx = ctx.clone();
    let handler = Arc::new(handler);
    move |value| {
        let handler = Arc::clone(&handler);
        ctx.post(move || handler(value));
    }
}

/// One-shot variant of [`redirect_to`].
pub fn redirect_once_to<T, F>(ctx: &ContextHandle, handler: F) -> impl FnOnce(T) + Send + 'static
where
    T: Send + 'static,
    F: FnOnce(T) + Send + 'static,
{
    let ctx = ctx.clone();
    move |value| {
        ctx.post(move || handler(value));
    }
}
