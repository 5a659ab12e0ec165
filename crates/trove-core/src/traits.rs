//! Trait interfaces between crates.
//!
//! - [`TxSigner`] — size measurement and signing (trove-device implements)

use async_trait::async_trait;

use crate::coin::CoinParams;
use crate::error::SessionError;
use crate::types::{RefTransaction, SignInput, SignOutput};

/// Something that can measure and sign a transaction, normally a device
/// session.
#[async_trait]
pub trait TxSigner: Send + Sync {
    /// Serialized size in bytes of the signed form of this transaction.
    async fn measure_tx(
        &self,
        inputs: &[SignInput],
        outputs: &[SignOutput],
        coin: &CoinParams,
    ) -> Result<u32, SessionError>;

    /// Sign the transaction, returning the raw serialized bytes.
    async fn sign_tx(
        &self,
        inputs: &[SignInput],
        outputs: &[SignOutput],
        refs: &[RefTransaction],
        coin: &CoinParams,
    ) -> Result<Vec<u8>, SessionError>;
}
