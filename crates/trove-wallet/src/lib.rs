//! # trove-wallet — accounts over a synchronized backend.
//!
//! An [`Account`] pairs an external and a change [`Branch`], each kept in
//! sync with the backend. Transactions are built against a [`TxSigner`]
//! that reports the signed size, iterating until the fee converges.
//!
//! # Modules
//!
//! - [`error`] — `WalletError` enum
//! - [`amount`] — decimal amount parsing and formatting
//! - [`config`] — wallet policy and per-coin settings
//! - [`history`] — transaction merging, analysis and running balances
//! - [`branch`] — one derivation branch and its cached ledger
//! - [`coin_selection`] — confirmed-first greedy UTXO selection
//! - [`builder`] — output validation and the fee loop
//! - [`account`] — account composition, sending and address views
//!
//! [`TxSigner`]: trove_core::TxSigner

pub mod account;
pub mod amount;
pub mod branch;
pub mod builder;
pub mod coin_selection;
pub mod config;
pub mod error;
pub mod history;

pub use account::{Account, AccountPolicy, UsedAddress};
pub use amount::{format_amount, parse_amount};
pub use branch::{Branch, BranchEvent};
pub use builder::{FeePolicy, OutputRow, Recipient, RowError, RowField, TransactionBuilder};
pub use coin_selection::{CoinSelection, CoinSelector};
pub use config::{CoinPolicy, WalletConfig};
pub use error::WalletError;
