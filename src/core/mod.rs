pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetch;
pub mod listeners;
pub mod model;
pub mod queue;
pub mod redirect;

#[cfg(test)]
pub(crate) mod testing;
