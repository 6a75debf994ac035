//! The `error` module defines the error taxonomy used across `relayq`.
//!
//! Transient link failures are recovered internally (reconnect, redeliver);
//! data and logic failures (conflicting queue declaration, malformed
//! configuration) are surfaced to the caller immediately.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The broker endpoint is unreachable or the link was lost. Transient:
    /// the transport retries these with backoff.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid or missing configuration. Fatal, never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A queue was re-declared with a different durability flag.
    #[error("queue '{name}' already declared with durable={existing}")]
    QueueConflict { name: String, existing: bool },

    /// Publishing was attempted on a channel that is not open.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The producer's retry budget is spent; carries the last failure.
    #[error("send failed after {attempts} attempts: {source}")]
    SendFailed {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Channel-level misuse: not open, invalid prefetch, and the like.
    #[error("channel error: {0}")]
    Channel(String),

    /// A consumer handler reported failure; converted to a nack at the
    /// dispatch boundary, never propagated past it.
    #[error("handler error: {0}")]
    Handler(String),

    /// An operation referenced a queue that was never declared.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// Whether a publish-side caller should retry this error with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Publish(_))
    }
}
