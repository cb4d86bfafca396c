//! Error types for resource-acquisition failures.
//!
//! Precondition violations are not represented here; those are fatal
//! assertions (see [`crate::util::fatal`]). Only failures that a caller
//! can meaningfully observe at construction time surface as `Result`s.

use std::io;
use thiserror::Error;

/// Errors surfaced by fiber and scheduler construction.
#[derive(Debug, Error)]
pub enum Error {
    /// Allocating a fiber stack failed.
    #[error("failed to allocate a {size}-byte fiber stack: {source}")]
    StackAlloc {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// Spawning an OS worker thread failed.
    #[error("failed to spawn thread {name:?}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: io::Error,
    },
}
