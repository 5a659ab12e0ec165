//! Backend error types.

use thiserror::Error;

/// Errors talking to the account backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Request could not be sent or the connection dropped.
    #[error("transport: {0}")]
    Transport(String),

    /// The backend answered with a non-success status.
    #[error("http status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// A response body could not be decoded.
    #[error("decode: {0}")]
    Decode(String),

    /// No backend is configured for the coin.
    #[error("unknown coin: {0}")]
    UnknownCoin(String),

    /// The subscription was cancelled or the backend shut down.
    #[error("subscription closed")]
    Closed,
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_status() {
        let e = BackendError::Status {
            status: 503,
            body: "busy".into(),
        };
        assert_eq!(e.to_string(), "http status 503: busy");
    }

    #[test]
    fn from_json_error() {
        let err = serde_json::from_str::<u32>("x").unwrap_err();
        assert!(matches!(BackendError::from(err), BackendError::Decode(_)));
    }
}
