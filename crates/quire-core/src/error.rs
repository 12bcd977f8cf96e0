//! Error taxonomy for page store interactions.
//!
//! Remote failures are observability events: callers log them and abort the
//! operation at hand without retrying. Expected misses (reading an absent
//! key, deleting an already-absent key) are successes and never surface here.

use serde::{Deserialize, Serialize};

/// Error returned by page store backends and the client layers above them.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum StoreError {
    /// The connection to the store is gone; no further calls will succeed.
    #[error("connection closed: {message}")]
    ConnectionClosed {
        /// What was being attempted when the connection dropped
        message: String,
    },

    /// The store reported a failure for this call.
    #[error("remote store failure: {message}")]
    Remote {
        /// Failure detail as reported by the store
        message: String,
    },

    /// Transaction misuse, e.g. nested begin or commit without begin.
    #[error("invalid transaction state: {message}")]
    InvalidTransaction {
        /// Which invariant was violated
        message: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Underlying encode/decode failure
        message: String,
    },

    /// Internal invariant violation in a client or backend.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the broken invariant
        message: String,
    },
}

impl StoreError {
    /// Create a connection-closed error.
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            message: message.into(),
        }
    }

    /// Create a remote failure error.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Create a transaction misuse error.
    pub fn invalid_transaction(message: impl Into<String>) -> Self {
        Self::InvalidTransaction {
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Standard result type for store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
