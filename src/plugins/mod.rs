//! Engine collaborators that can sit behind the facade.

pub mod memory;
