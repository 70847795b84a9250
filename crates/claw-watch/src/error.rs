//! Error types for the claw-watch crate.

use thiserror::Error;

/// Errors that can occur while watching the fleet.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The observation source failed to produce a result.
    #[error("observation failed: {reason}")]
    Observation {
        /// The reason the observation failed.
        reason: String,
    },

    /// The observation source did not answer in time.
    #[error("observation timed out after {secs}s")]
    ObservationTimeout {
        /// The timeout that elapsed, in seconds.
        secs: u64,
    },

    /// An observed record could not be turned into an instance.
    #[error("malformed record {key}: {reason}")]
    MalformedRecord {
        /// Best-effort identifier of the offending record.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A dispatcher failed to hand a batch to its transport.
    #[error("dispatch to {destination} failed: {reason}")]
    Dispatch {
        /// The destination of the batch.
        destination: String,
        /// The reason the dispatch failed.
        reason: String,
    },

    /// The batching scheduler is no longer running.
    #[error("scheduler is closed")]
    SchedulerClosed,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for WatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for watch operations.
pub type Result<T> = std::result::Result<T, WatchError>;
