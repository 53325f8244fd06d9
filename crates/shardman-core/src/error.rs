//! Error taxonomy shared across the coordinator and the shard keeper.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required node or record is missing (e.g. the guard lease at
    /// startup, or an application drop of an unknown shard).
    #[error("does not exist")]
    NotExist,

    /// The target already exists (application add of a live shard).
    #[error("already exists")]
    AlreadyExists,

    /// A conditional write lost against the current value.
    #[error("value mismatch on conditional write to {key}")]
    ValueMismatch { key: String },

    /// A shard spec carries a lease that is not the current guard.
    #[error("lease mismatch for shard {shard}: expected {expected}, got {actual}")]
    LeaseMismatch {
        shard: String,
        expected: i64,
        actual: i64,
    },

    /// Malformed JSON in a store value or request body.
    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// HTTP failure or non-200 response from a worker endpoint.
    #[error("transport: {0}")]
    Transport(String),

    /// Underlying consistent-store failure.
    #[error("store: {0}")]
    Store(#[from] etcd_client::Error),

    /// Durable local shard log failure.
    #[error("shard log: {0}")]
    Log(String),

    /// Illegal event shape or state transition.
    #[error("unexpected: {0}")]
    Unexpected(String),
}
