use thiserror::Error;

/// Responder error types covering configuration, register access, and lifecycle failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MbError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Listening socket could not be bound.
    #[error("failed to bind {addr}: {reason}")]
    Bind {
        /// Requested bind address.
        addr: String,
        /// Underlying failure.
        reason: String,
    },

    /// I/O operation error.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Register index outside the store.
    #[error("register address {address} out of range (store size {size})")]
    AddressOutOfRange {
        /// Requested register index.
        address: usize,
        /// Number of registers in the store.
        size: usize,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl From<std::io::Error> for MbError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

/// Convenience type alias for responder operations.
pub type MbResult<T> = Result<T, MbError>;
