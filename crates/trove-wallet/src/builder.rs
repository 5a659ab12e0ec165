//! Transaction construction with fee negotiation.
//!
//! The fee depends on the signed size, which depends on how many inputs are
//! needed, which depends on the fee. [`TransactionBuilder::build`] breaks
//! the cycle by asking the signer to measure a candidate and retrying with
//! the measured fee until the selected inputs cover it:
//!
//! 1. select inputs for `amount + fee_attempt` (starting at zero)
//! 2. measure the candidate including a change output
//! 3. `fee = ceil(size / 1000) * fee_per_kb`
//! 4. if `fee` fits in `total - amount`, settle the change (dropping it into
//!    the fee when below dust); otherwise retry with `fee_attempt = fee`
//!
//! Each retry strictly raises the selection target, so the loop ends either
//! with a transaction or with `InsufficientFunds`.

use serde::{Deserialize, Serialize};
use tracing::debug;
use trove_core::address::decode_address;
use trove_core::coin::{resolve_script_type, CoinParams, ScriptTypeRule};
use trove_core::constants::{DEFAULT_DUST_THRESHOLD, DEFAULT_FEE_PER_KB, FEE_SIZE_UNIT};
use trove_core::error::ValidationError;
use trove_core::traits::TxSigner;
use trove_core::types::{PreparedTx, SignInput, SignOutput, Utxo};

use crate::amount::parse_amount;
use crate::coin_selection::CoinSelector;
use crate::error::WalletError;

/// Fee rate and dust threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub fee_per_kb: u64,
    pub dust_threshold: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            fee_per_kb: DEFAULT_FEE_PER_KB,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
        }
    }
}

impl FeePolicy {
    /// Fee for a transaction of `size` bytes, charged per started kilobyte.
    pub fn fee_for_size(&self, size: u32) -> u64 {
        u64::from(size).div_ceil(FEE_SIZE_UNIT) * self.fee_per_kb
    }
}

/// A transaction recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    /// Amount in satoshis.
    pub amount: u64,
}

/// A raw, unvalidated output as entered by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputRow {
    pub address: String,
    pub amount: String,
}

impl OutputRow {
    pub fn new(address: impl Into<String>, amount: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            amount: amount.into(),
        }
    }

    fn is_blank(&self) -> bool {
        self.address.trim().is_empty() && self.amount.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowField {
    Address,
    Amount,
}

/// A validation failure on one field of one output row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub row: usize,
    pub field: RowField,
    pub message: String,
}

/// Builds a [`PreparedTx`] for one coin.
pub struct TransactionBuilder {
    coin: CoinParams,
    policy: FeePolicy,
    script_types: Vec<ScriptTypeRule>,
    recipients: Vec<Recipient>,
}

impl TransactionBuilder {
    pub fn new(coin: CoinParams, policy: FeePolicy, script_types: Vec<ScriptTypeRule>) -> Self {
        Self {
            coin,
            policy,
            script_types,
            recipients: Vec::new(),
        }
    }

    pub fn add_recipient(&mut self, address: impl Into<String>, amount: u64) -> &mut Self {
        self.recipients.push(Recipient {
            address: address.into(),
            amount,
        });
        self
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    /// Validate free-form rows and add the valid ones as recipients.
    ///
    /// Blank rows are skipped. Any invalid row fails the whole batch with
    /// every field error collected; a batch with no valid rows is cancelled.
    pub fn add_rows(&mut self, rows: &[OutputRow]) -> Result<&mut Self, WalletError> {
        let mut errors = Vec::new();
        let mut valid = Vec::new();

        for (row, entry) in rows.iter().enumerate() {
            if entry.is_blank() {
                continue;
            }
            let address = entry.address.trim();
            let address_ok = match self.output_for(address, 0) {
                Ok(_) => true,
                Err(e) => {
                    errors.push(RowError {
                        row,
                        field: RowField::Address,
                        message: e.to_string(),
                    });
                    false
                }
            };
            let amount = match parse_amount(&entry.amount).and_then(|v| self.check_dust(v)) {
                Ok(v) => Some(v),
                Err(e) => {
                    errors.push(RowError {
                        row,
                        field: RowField::Amount,
                        message: e.to_string(),
                    });
                    None
                }
            };
            if let (true, Some(amount)) = (address_ok, amount) {
                valid.push(Recipient {
                    address: address.to_string(),
                    amount,
                });
            }
        }

        if !errors.is_empty() {
            return Err(WalletError::InvalidOutputs(errors));
        }
        if valid.is_empty() {
            return Err(WalletError::Cancelled);
        }
        self.recipients.extend(valid);
        Ok(self)
    }

    fn check_dust(&self, amount: u64) -> Result<u64, ValidationError> {
        if amount < self.policy.dust_threshold {
            return Err(ValidationError::BelowDust {
                amount,
                dust: self.policy.dust_threshold,
            });
        }
        Ok(amount)
    }

    fn output_for(&self, address: &str, amount: u64) -> Result<SignOutput, ValidationError> {
        let decoded = decode_address(address)?;
        let script_type = resolve_script_type(&self.coin, &self.script_types, decoded.version)
            .ok_or(ValidationError::UnsupportedAddressVersion(decoded.version))?;
        Ok(SignOutput::to_address(address, amount, script_type))
    }

    fn outputs(&self) -> Result<(Vec<SignOutput>, u64), WalletError> {
        if self.recipients.is_empty() {
            return Err(WalletError::Cancelled);
        }
        let mut amount: u64 = 0;
        let mut outputs = Vec::with_capacity(self.recipients.len() + 1);
        for recipient in &self.recipients {
            self.check_dust(recipient.amount)?;
            outputs.push(self.output_for(&recipient.address, recipient.amount)?);
            amount = amount
                .checked_add(recipient.amount)
                .ok_or(ValidationError::ValueOverflow)?;
        }
        Ok((outputs, amount))
    }

    /// Select inputs and negotiate the fee against `signer`.
    pub async fn build(
        &self,
        utxos: &[Utxo],
        change_path: Vec<u32>,
        signer: &dyn TxSigner,
    ) -> Result<PreparedTx, WalletError> {
        let (outputs, amount) = self.outputs()?;
        let mut fee_attempt: u64 = 0;

        loop {
            let need = amount
                .checked_add(fee_attempt)
                .ok_or(ValidationError::ValueOverflow)?;
            let selection = CoinSelector::select(utxos, need)?;
            let change = selection
                .total
                .checked_sub(need)
                .ok_or(WalletError::InsufficientFunds {
                    have: selection.total,
                    need,
                })?;

            let inputs: Vec<SignInput> = selection.selected.iter().map(SignInput::from).collect();
            let mut candidate = outputs.clone();
            candidate.push(SignOutput::change(change_path.clone(), change));

            let size = signer.measure_tx(&inputs, &candidate, &self.coin).await?;
            let fee = self.policy.fee_for_size(size);
            let space = selection.total - amount;
            debug!(size, fee, fee_attempt, inputs = inputs.len(), "measured candidate");

            if fee <= space {
                let remainder = space - fee;
                let fee = if remainder < self.policy.dust_threshold {
                    candidate.pop();
                    space
                } else {
                    if let Some(change) = candidate.last_mut() {
                        change.amount = remainder;
                    }
                    fee
                };
                return Ok(PreparedTx {
                    inputs,
                    outputs: candidate,
                    fee,
                    total: selection.total,
                });
            }
            fee_attempt = fee;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use trove_core::error::SessionError;
    use trove_core::types::{RefTransaction, UtxoState};

    const ADDRESS: &str = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH";

    /// Reports a fixed base size plus a per-input size.
    struct SizeSigner {
        base: u32,
        per_input: u32,
        calls: AtomicUsize,
    }

    impl SizeSigner {
        fn fixed(size: u32) -> Self {
            Self {
                base: size,
                per_input: 0,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TxSigner for SizeSigner {
        async fn measure_tx(
            &self,
            inputs: &[SignInput],
            _outputs: &[SignOutput],
            _coin: &CoinParams,
        ) -> Result<u32, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.base + self.per_input * inputs.len() as u32)
        }

        async fn sign_tx(
            &self,
            _inputs: &[SignInput],
            _outputs: &[SignOutput],
            _refs: &[RefTransaction],
            _coin: &CoinParams,
        ) -> Result<Vec<u8>, SessionError> {
            Ok(vec![0x01])
        }
    }

    fn utxo(hash: &str, value: u64) -> Utxo {
        Utxo {
            tx_hash: hash.into(),
            index: 0,
            value,
            path: vec![0, 2],
            state: UtxoState::Confirmed,
        }
    }

    fn builder() -> TransactionBuilder {
        TransactionBuilder::new(CoinParams::bitcoin(), FeePolicy::default(), Vec::new())
    }

    #[test]
    fn fee_is_charged_per_started_kilobyte() {
        let policy = FeePolicy::default();
        assert_eq!(policy.fee_for_size(250), 10_000);
        assert_eq!(policy.fee_for_size(1_000), 10_000);
        assert_eq!(policy.fee_for_size(1_001), 20_000);
        assert_eq!(policy.fee_for_size(0), 0);
    }

    #[tokio::test]
    async fn dust_change_is_folded_into_fee() {
        let mut b = builder();
        b.add_recipient(ADDRESS, 10_000);
        let signer = SizeSigner::fixed(250);
        let tx = b.build(&[utxo("a", 25_000)], vec![1, 0], &signer).await.unwrap();
        assert_eq!(tx.fee, 15_000);
        assert_eq!(tx.total, 25_000);
        assert_eq!(tx.outputs.len(), 1);
        assert!(tx.change().is_none());
    }

    #[tokio::test]
    async fn change_output_gets_remainder() {
        let mut b = builder();
        b.add_recipient(ADDRESS, 10_000);
        let signer = SizeSigner::fixed(250);
        let tx = b.build(&[utxo("a", 100_000)], vec![1, 4], &signer).await.unwrap();
        assert_eq!(tx.fee, 10_000);
        let change = tx.change().unwrap();
        assert_eq!(change.amount, 80_000);
        assert_eq!(tx.outputs[0].amount + change.amount + tx.fee, tx.total);
    }

    #[tokio::test]
    async fn retries_with_measured_fee() {
        let mut b = builder();
        b.add_recipient(ADDRESS, 20_000);
        let signer = SizeSigner::fixed(300);
        let utxos = [utxo("a", 21_000), utxo("b", 15_000)];
        let tx = b.build(&utxos, vec![1, 0], &signer).await.unwrap();
        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(tx.fee, 10_000);
        assert_eq!(tx.change().unwrap().amount, 6_000);
    }

    #[tokio::test]
    async fn exhaustion_is_insufficient_funds() {
        let mut b = builder();
        b.add_recipient(ADDRESS, 20_000);
        let signer = SizeSigner::fixed(300);
        let err = b.build(&[utxo("a", 25_000)], vec![1, 0], &signer).await.unwrap_err();
        assert_eq!(err, WalletError::InsufficientFunds { have: 25_000, need: 30_000 });
    }

    #[tokio::test]
    async fn recipient_below_dust_rejected() {
        let mut b = builder();
        b.add_recipient(ADDRESS, 100);
        let signer = SizeSigner::fixed(250);
        let err = b.build(&[utxo("a", 25_000)], vec![1, 0], &signer).await.unwrap_err();
        assert_eq!(
            err,
            WalletError::Validation(ValidationError::BelowDust { amount: 100, dust: 5_430 })
        );
    }

    #[tokio::test]
    async fn foreign_version_needs_rule() {
        let p2sh = trove_core::address::encode_hash(5, &[7u8; 20]);
        let mut b = builder();
        b.add_recipient(p2sh.clone(), 10_000);
        let signer = SizeSigner::fixed(250);
        let err = b.build(&[utxo("a", 50_000)], vec![1, 0], &signer).await.unwrap_err();
        assert_eq!(err, WalletError::Validation(ValidationError::UnsupportedAddressVersion(5)));

        let rules = vec![ScriptTypeRule::new(5, trove_core::ScriptType::PayToScriptHash)];
        let mut b = TransactionBuilder::new(CoinParams::bitcoin(), FeePolicy::default(), rules);
        b.add_recipient(p2sh, 10_000);
        let tx = b.build(&[utxo("a", 50_000)], vec![1, 0], &signer).await.unwrap();
        assert_eq!(tx.outputs[0].script_type, trove_core::ScriptType::PayToScriptHash);
    }

    #[test]
    fn rows_skip_blanks_and_collect_errors() {
        let mut b = builder();
        let rows = [
            OutputRow::new(ADDRESS, "0.001"),
            OutputRow::default(),
            OutputRow::new("not-an-address", "abc"),
        ];
        let err = b.add_rows(&rows).err().unwrap();
        match err {
            WalletError::InvalidOutputs(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors.iter().all(|e| e.row == 2));
                assert_eq!(errors[0].field, RowField::Address);
                assert_eq!(errors[1].field, RowField::Amount);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(b.recipients().is_empty());
    }

    #[test]
    fn rows_all_blank_cancel() {
        let mut b = builder();
        let rows = [OutputRow::default(), OutputRow::new("  ", " ")];
        assert_eq!(b.add_rows(&rows).err(), Some(WalletError::Cancelled));
    }

    #[test]
    fn valid_rows_become_recipients() {
        let mut b = builder();
        let rows = [OutputRow::new(ADDRESS, "0.001"), OutputRow::new(ADDRESS, "0.0002")];
        b.add_rows(&rows).unwrap();
        assert_eq!(b.recipients().len(), 2);
        assert_eq!(b.recipients()[1].amount, 20_000);
    }
}
