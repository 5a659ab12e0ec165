//! Device error types.

use trove_backend::BackendError;
use trove_core::error::{SessionError, ValidationError};
use trove_wallet::WalletError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error(transparent)] Session(#[from] SessionError),
    #[error(transparent)] Wallet(#[from] WalletError),
    #[error(transparent)] Backend(#[from] BackendError),
    #[error(transparent)] Validation(#[from] ValidationError),
    #[error("device is not connected")] NotConnected,
    #[error("device has no features yet")] NotInitialized,
    #[error("no supported coin: {0}")] UnsupportedCoin(String),
    #[error("device xpub does not match its node at {0}")] XpubMismatch(String),
    #[error("device child node does not match local derivation at {0}")] ChildMismatch(String),
    #[error("cannot add another account")] CannotAddAccount,
    #[error("account {0} cannot be hidden")] CannotHideAccount(u32),
    #[error("storage: {0}")] Storage(String),
}

impl From<serde_json::Error> for DeviceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
