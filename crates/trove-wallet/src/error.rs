//! Wallet error types.

use trove_backend::BackendError;
use trove_core::error::{SessionError, ValidationError};
use thiserror::Error;

use crate::builder::RowError;

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Malformed address, amount or key.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Spendable outputs do not cover the amount plus fee.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds {
        /// Spendable balance in satoshis.
        have: u64,
        /// Required amount in satoshis.
        need: u64,
    },

    /// One or more output rows failed validation.
    #[error("invalid outputs: {} row error(s)", .0.len())]
    InvalidOutputs(Vec<RowError>),

    /// The operation was cancelled, by the user or for lack of outputs.
    #[error("cancelled")]
    Cancelled,

    /// Backend request failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The signer failed.
    #[error("signer: {0}")]
    Signer(SessionError),

    /// The signed transaction was rejected on broadcast.
    #[error("broadcast failed: {message}")]
    Broadcast {
        /// Hex-encoded raw transaction, for manual retry.
        raw_tx: String,
        /// Backend error text.
        message: String,
    },

    /// A branch was used before its first update arrived.
    #[error("branch not initialized")]
    NotInitialized,

    /// A referenced transaction is missing from every cache and the backend.
    #[error("unknown transaction: {0}")]
    UnknownTransaction(String),

    /// Configuration could not be loaded.
    #[error("config: {0}")]
    Config(String),
}

impl From<SessionError> for WalletError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Cancelled => Self::Cancelled,
            other => Self::Signer(other),
        }
    }
}

impl From<config::ConfigError> for WalletError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
