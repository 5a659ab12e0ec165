//! # trove-backend — account history and balance feed.
//!
//! One [`BackendSync`] per coin multiplexes many xpub subscriptions over a
//! single long-poll stream.
//!
//! # Modules
//!
//! - [`error`] — `BackendError` enum
//! - [`config`] — endpoint and subscription parameters
//! - [`protocol`] — JSON wire records and their conversion to ledger types
//! - [`api`] — `BackendApi` trait and the reqwest-based `HttpBackend`
//! - [`sync`] — connection state machine, listener task and subscriptions
//! - [`registry`] — lazily created per-coin backends

pub mod api;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod sync;

pub use api::{BackendApi, HttpBackend};
pub use config::BackendConfig;
pub use error::BackendError;
pub use protocol::{PushMessage, SubscribeRequest, UpdateStatus, WireTransaction, WireUtxo};
pub use registry::BackendRegistry;
pub use sync::{BackendSync, ConnectionState, Subscription};
