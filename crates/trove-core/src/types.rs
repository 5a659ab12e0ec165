//! Ledger records shared by the backend, wallet and device crates.

use serde::{Deserialize, Serialize};

use crate::coin::ScriptType;

/// Which bucket of a balance update a UTXO was reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UtxoState {
    Confirmed,
    /// Unconfirmed change returning to this wallet.
    Change,
    /// Being spent by an unconfirmed transaction.
    Sending,
    /// Unconfirmed incoming.
    Receiving,
}

impl UtxoState {
    /// Whether outputs in this state count towards the balance and may be
    /// selected for spending.
    pub fn is_spendable(self) -> bool {
        !matches!(self, Self::Sending)
    }
}

/// An unspent output owned by a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub tx_hash: String,
    pub index: u32,
    pub value: u64,
    /// Full derivation path of the owning address.
    pub path: Vec<u32>,
    pub state: UtxoState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub source_hash: String,
    pub index: u32,
    pub script: Vec<u8>,
    pub sequence: u32,
}

/// A transaction output. `path` is set iff the output pays this wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub script: Vec<u8>,
    pub value: u64,
    pub index: u32,
    pub path: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub hash: String,
    pub height: u64,
}

/// Direction of a transaction relative to the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TxKind {
    Sent,
    SelfTransfer,
    Received,
}

/// Net effect of a transaction on the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAnalysis {
    pub kind: TxKind,
    /// Signed change in wallet balance, in satoshis.
    pub impact: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub version: u32,
    pub lock_time: u32,
    /// Block time in seconds; `None` while unconfirmed.
    pub timestamp: Option<i64>,
    pub block: Option<BlockRef>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub analysis: Option<TxAnalysis>,
    /// Running wallet balance after this transaction.
    pub balance: Option<i64>,
}

impl Transaction {
    /// Outputs paying this wallet.
    pub fn own_outputs(&self) -> impl Iterator<Item = &TxOutput> {
        self.outputs.iter().filter(|o| o.path.is_some())
    }
}

/// A receive or change address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub path: Vec<u32>,
    pub address: String,
    pub index: u32,
}

/// An input as handed to the device for signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInput {
    pub prev_hash: String,
    pub prev_index: u32,
    pub address_n: Vec<u32>,
}

impl From<&Utxo> for SignInput {
    fn from(utxo: &Utxo) -> Self {
        Self {
            prev_hash: utxo.tx_hash.clone(),
            prev_index: utxo.index,
            address_n: utxo.path.clone(),
        }
    }
}

/// Where an output pays: an external address or one of our own paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputTarget {
    Address(String),
    Path(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignOutput {
    pub target: OutputTarget,
    pub amount: u64,
    pub script_type: ScriptType,
}

impl SignOutput {
    pub fn to_address(address: impl Into<String>, amount: u64, script_type: ScriptType) -> Self {
        Self {
            target: OutputTarget::Address(address.into()),
            amount,
            script_type,
        }
    }

    pub fn change(path: Vec<u32>, amount: u64) -> Self {
        Self {
            target: OutputTarget::Path(path),
            amount,
            script_type: ScriptType::PayToAddress,
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self.target, OutputTarget::Path(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefInput {
    pub prev_hash: String,
    pub prev_index: u32,
    /// Hex-encoded signature script.
    pub script_sig: String,
    /// Omitted when zero.
    pub sequence: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefOutput {
    pub amount: u64,
    /// Hex-encoded output script.
    pub script_pubkey: String,
}

/// A previous transaction in the form the device verifies input amounts
/// against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefTransaction {
    pub hash: String,
    pub version: u32,
    pub inputs: Vec<RefInput>,
    pub bin_outputs: Vec<RefOutput>,
    pub lock_time: u32,
}

impl From<&Transaction> for RefTransaction {
    fn from(tx: &Transaction) -> Self {
        Self {
            hash: tx.hash.clone(),
            version: tx.version,
            inputs: tx
                .inputs
                .iter()
                .map(|input| RefInput {
                    prev_hash: input.source_hash.clone(),
                    prev_index: input.index,
                    script_sig: hex::encode(&input.script),
                    sequence: (input.sequence > 0).then_some(input.sequence),
                })
                .collect(),
            bin_outputs: tx
                .outputs
                .iter()
                .map(|output| RefOutput {
                    amount: output.value,
                    script_pubkey: hex::encode(&output.script),
                })
                .collect(),
            lock_time: tx.lock_time,
        }
    }
}

/// A transaction ready for signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedTx {
    pub inputs: Vec<SignInput>,
    pub outputs: Vec<SignOutput>,
    pub fee: u64,
    /// Sum of the selected inputs.
    pub total: u64,
}

impl PreparedTx {
    pub fn change(&self) -> Option<&SignOutput> {
        self.outputs.iter().find(|o| o.is_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            hash: "aa".into(),
            version: 1,
            lock_time: 0,
            timestamp: Some(1_400_000_000),
            block: None,
            inputs: vec![
                TxInput {
                    source_hash: "bb".into(),
                    index: 2,
                    script: vec![0x51, 0x52],
                    sequence: 0,
                },
                TxInput {
                    source_hash: "cc".into(),
                    index: 0,
                    script: vec![],
                    sequence: 0xffff_ffff,
                },
            ],
            outputs: vec![TxOutput {
                script: vec![0x76, 0xa9],
                value: 5000,
                index: 0,
                path: Some(vec![0, 1]),
            }],
            analysis: None,
            balance: None,
        }
    }

    #[test]
    fn ref_transaction_hex_encodes_scripts() {
        let r = RefTransaction::from(&sample_tx());
        assert_eq!(r.inputs[0].script_sig, "5152");
        assert_eq!(r.bin_outputs[0].script_pubkey, "76a9");
        assert_eq!(r.bin_outputs[0].amount, 5000);
    }

    #[test]
    fn ref_transaction_omits_zero_sequence() {
        let r = RefTransaction::from(&sample_tx());
        assert_eq!(r.inputs[0].sequence, None);
        assert_eq!(r.inputs[1].sequence, Some(0xffff_ffff));
    }

    #[test]
    fn sending_is_not_spendable() {
        assert!(!UtxoState::Sending.is_spendable());
        assert!(UtxoState::Receiving.is_spendable());
        assert!(UtxoState::Change.is_spendable());
    }

    #[test]
    fn change_output_pays_to_address() {
        let out = SignOutput::change(vec![1, 3], 700);
        assert!(out.is_change());
        assert_eq!(out.script_type, ScriptType::PayToAddress);
    }
}
