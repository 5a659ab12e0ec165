//! Error types shared across Trove crates.
use thiserror::Error;

/// Malformed keys, addresses, amounts or derivation requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid base58: {0}")] InvalidBase58(String),
    #[error("invalid checksum")] InvalidChecksum,
    #[error("invalid length: expected {expected}, got {got}")] InvalidLength { expected: usize, got: usize },
    #[error("hardened index {0} cannot be derived from a public node")] HardenedDerivation(u32),
    #[error("invalid public key")] InvalidPublicKey,
    #[error("invalid private key")] InvalidPrivateKey,
    #[error("invalid private key marker byte: {0:#04x}")] InvalidPrivateKeyMarker(u8),
    #[error("derived key is out of range at index {0}")] InvalidTweak(u32),
    #[error("unexpected extended key version: {0:#010x}")] UnexpectedVersion(u32),
    #[error("unsupported address version: {0}")] UnsupportedAddressVersion(u8),
    #[error("invalid address: {0}")] InvalidAddress(String),
    #[error("invalid amount: {0}")] InvalidAmount(String),
    #[error("amount {amount} is below the dust threshold {dust}")] BelowDust { amount: u64, dust: u64 },
    #[error("invalid mnemonic: {0}")] InvalidMnemonic(String),
    #[error("value overflow")] ValueOverflow,
}

/// Failures of a device session call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The device answered with a `Failure` message.
    #[error("device failure {code}: {message}")]
    Device {
        /// Device failure code.
        code: i32,
        /// Human-readable failure text.
        message: String,
    },

    /// The transport could not deliver a request or read a response.
    #[error("transport: {0}")]
    Transport(String),

    /// The session has been disconnected.
    #[error("device disconnected")]
    Disconnected,

    /// The user dismissed an interaction prompt.
    #[error("cancelled")]
    Cancelled,

    /// The device answered with a message the call did not expect.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl SessionError {
    /// Whether the error means the device went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_device_failure() {
        let e = SessionError::Device {
            code: 4,
            message: "Action cancelled by user".into(),
        };
        assert_eq!(e.to_string(), "device failure 4: Action cancelled by user");
    }

    #[test]
    fn display_dust() {
        let e = ValidationError::BelowDust { amount: 100, dust: 5430 };
        assert_eq!(e.to_string(), "amount 100 is below the dust threshold 5430");
    }

    #[test]
    fn transport_and_disconnect_are_disconnects() {
        assert!(SessionError::Disconnected.is_disconnect());
        assert!(SessionError::Transport("io".into()).is_disconnect());
        assert!(!SessionError::Cancelled.is_disconnect());
    }
}
