//! # trove-core
//! Foundation types for Trove: BIP32 public derivation, base58check
//! addresses and extended keys, ledger records and the signer seam.

pub mod address;
pub mod coin;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod hdnode;
pub mod traits;
pub mod types;

pub use address::{decode_address, encode_address, DecodedAddress};
pub use coin::{CoinParams, ScriptType, ScriptTypeRule};
pub use error::{SessionError, ValidationError};
pub use hdnode::{derive_child, derive_path, format_path, harden, HdNode, PrivateKey};
pub use traits::TxSigner;
