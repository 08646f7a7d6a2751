//! Crate-wide error taxonomy.
//!
//! Component-local failures (`StoreError`, `ProtocolError`) convert into
//! [`CoreError`], which is what every public operation returns. Decode
//! failures on incoming document updates are not swallowed: the dispatch
//! layer turns them into an explicit `updateRejected` frame for the sender.

use crate::protocol::ProtocolError;
use crate::store::StoreError;

/// Errors surfaced by the sync core.
#[derive(Debug, Clone)]
pub enum CoreError {
    /// Missing or invalid field in a request
    Validation(String),
    /// Node (or other referenced entity) does not exist
    NotFound(String),
    /// Operation conflicts with an invariant (e.g. root-delete attempt)
    Conflict(String),
    /// Row-store read/write failure
    Storage(String),
    /// Malformed replicated-document payload or wire frame
    Decode(String),
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::Validation(msg) => write!(f, "Validation error: {msg}"),
            CoreError::NotFound(what) => write!(f, "Not found: {what}"),
            CoreError::Conflict(msg) => write!(f, "Conflict: {msg}"),
            CoreError::Storage(msg) => write!(f, "Storage error: {msg}"),
            CoreError::Decode(msg) => write!(f, "Decode error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => CoreError::NotFound(id),
            other => CoreError::Storage(other.to_string()),
        }
    }
}

impl From<ProtocolError> for CoreError {
    fn from(e: ProtocolError) -> Self {
        CoreError::Decode(e.to_string())
    }
}
