//! Error types surfaced by the engine.
//!
//! Only two conditions ever reach a caller: a reaction graph that refuses to
//! settle, and malformed configuration. Cyclic computed values and failing
//! reaction bodies are reported through `tracing` and the manager's
//! diagnostics instead.

use thiserror::Error;

/// Boxed error returned by fallible reaction bodies.
pub type BoxError = Box<dyn std::error::Error + 'static>;

/// Errors returned by [`Manager`](crate::Manager) operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The pending reaction set did not drain within `max_iterations` passes.
    ///
    /// The pending set has been cleared by the time this is returned.
    #[error("reactions did not settle after {iterations} passes ({dropped} pending reactions dropped)")]
    RunawayReactionGraph {
        /// Number of full passes executed before giving up.
        iterations: usize,
        /// Number of reactions that were still queued and have been dropped.
        dropped: usize,
    },

    /// Options text could not be parsed.
    #[error("invalid manager options: {0}")]
    InvalidOptions(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
