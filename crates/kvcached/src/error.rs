//! Crate-boundary error type.
//!
//! `KvError` covers category-4 ("fatal") errors from spec section 7: bind
//! failure, out-of-memory at init. Everything else — malformed client input,
//! cas mismatches, non-numeric increments, capacity exhaustion — is *data*,
//! represented by [`crate::types::StatusCode`] and returned from the hot
//! path as a plain value, never as a `Result::Err`. Mixing the two would
//! force every `get`/`upsert` caller to match on an error enum for outcomes
//! that are routine, expected parts of the protocol.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("table initialization failed: {0}")]
    TableInit(String),
}
