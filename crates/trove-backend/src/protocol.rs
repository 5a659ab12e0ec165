//! JSON wire records exchanged with the backend.
//!
//! Field names are camelCase on the wire. Scripts travel base64-encoded.
//! Address ids are paths relative to the subscribed node; conversion to
//! ledger types prefixes them with the node's own path.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use trove_core::types::{BlockRef, Transaction, TxInput, TxOutput, Utxo, UtxoState};

use crate::error::BackendError;

/// Returned by `POST /lp` when a stream is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHandle {
    pub client_id: String,
}

/// Body of `POST /lp/{clientId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub public_master: String,
    pub after: String,
    pub look_ahead: u32,
    pub first_index: u32,
}

/// Body of `POST /trezor/send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Base64 raw transaction.
    pub transaction: String,
    /// Base64 double-SHA256 of the raw transaction.
    pub transaction_hash: String,
}

impl SendRequest {
    pub fn new(raw_tx: &[u8]) -> Self {
        Self {
            transaction: STANDARD.encode(raw_tx),
            transaction_hash: STANDARD.encode(trove_core::crypto::double_sha256(raw_tx)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Intermediate scan result; consumers wait for the next update.
    Pending,
    Final,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUtxo {
    pub transaction_hash: String,
    pub ix: u32,
    pub value: u64,
    #[serde(default)]
    pub address_id: Option<Vec<u32>>,
}

impl WireUtxo {
    pub fn into_utxo(self, base_path: &[u32], state: UtxoState) -> Utxo {
        let mut path = base_path.to_vec();
        path.extend(self.address_id.unwrap_or_default());
        Utxo {
            tx_hash: self.transaction_hash,
            index: self.ix,
            value: self.value,
            path,
            state,
        }
    }
}

/// A balance update for one subscribed xpub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub public_master: String,
    pub status: String,
    #[serde(default)]
    pub confirmed: Vec<WireUtxo>,
    #[serde(default)]
    pub change: Vec<WireUtxo>,
    #[serde(default)]
    pub sending: Vec<WireUtxo>,
    #[serde(default)]
    pub receiving: Vec<WireUtxo>,
}

impl PushMessage {
    pub fn update_status(&self) -> UpdateStatus {
        if self.status.eq_ignore_ascii_case("PENDING") {
            UpdateStatus::Pending
        } else {
            UpdateStatus::Final
        }
    }

    /// Flatten every bucket into ledger UTXOs under `base_path`.
    pub fn utxos(&self, base_path: &[u32]) -> Vec<Utxo> {
        let buckets = [
            (&self.confirmed, UtxoState::Confirmed),
            (&self.change, UtxoState::Change),
            (&self.sending, UtxoState::Sending),
            (&self.receiving, UtxoState::Receiving),
        ];
        buckets
            .into_iter()
            .flat_map(|(records, state)| {
                records
                    .iter()
                    .cloned()
                    .map(move |record| record.into_utxo(base_path, state))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireInput {
    pub source_hash: String,
    pub ix: u32,
    pub script: String,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOutput {
    pub script: String,
    pub value: u64,
    pub ix: u32,
    #[serde(default)]
    pub address_id: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTransaction {
    pub hash: String,
    pub version: u32,
    pub lock_time: u32,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default)]
    pub inputs: Vec<WireInput>,
    #[serde(default)]
    pub outputs: Vec<WireOutput>,
}

fn decode_script(script: &str) -> Result<Vec<u8>, BackendError> {
    STANDARD
        .decode(script)
        .map_err(|e| BackendError::Decode(format!("script: {e}")))
}

impl WireTransaction {
    /// Convert into a ledger transaction, resolving output address ids
    /// against `base_path`.
    pub fn into_transaction(self, base_path: &[u32]) -> Result<Transaction, BackendError> {
        let inputs = self
            .inputs
            .into_iter()
            .map(|input| {
                Ok(TxInput {
                    source_hash: input.source_hash,
                    index: input.ix,
                    script: decode_script(&input.script)?,
                    sequence: input.sequence,
                })
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        let outputs = self
            .outputs
            .into_iter()
            .map(|output| {
                let path = output.address_id.map(|id| {
                    let mut path = base_path.to_vec();
                    path.extend(id);
                    path
                });
                Ok(TxOutput {
                    script: decode_script(&output.script)?,
                    value: output.value,
                    index: output.ix,
                    path,
                })
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        let block = match (self.block_hash, self.height) {
            (Some(hash), Some(height)) => Some(BlockRef { hash, height }),
            _ => None,
        };

        Ok(Transaction {
            hash: self.hash,
            version: self.version,
            lock_time: self.lock_time,
            timestamp: self.block_time,
            block,
            inputs,
            outputs,
            analysis: None,
            balance: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUSH: &str = r#"{
        "publicMaster": "xpub-test",
        "status": "FINISHED",
        "confirmed": [{"transactionHash": "aa", "ix": 0, "value": 1000, "addressId": [3]}],
        "change": [],
        "sending": [{"transactionHash": "bb", "ix": 1, "value": 50, "addressId": [4]}],
        "receiving": [{"transactionHash": "cc", "ix": 2, "value": 70}]
    }"#;

    #[test]
    fn push_message_parses_camel_case() {
        let msg: PushMessage = serde_json::from_str(PUSH).unwrap();
        assert_eq!(msg.public_master, "xpub-test");
        assert_eq!(msg.update_status(), UpdateStatus::Final);
        assert_eq!(msg.confirmed[0].address_id, Some(vec![3]));
    }

    #[test]
    fn pending_status_detected() {
        let mut msg: PushMessage = serde_json::from_str(PUSH).unwrap();
        msg.status = "PENDING".into();
        assert_eq!(msg.update_status(), UpdateStatus::Pending);
    }

    #[test]
    fn utxos_prefix_branch_path() {
        let msg: PushMessage = serde_json::from_str(PUSH).unwrap();
        let utxos = msg.utxos(&[7, 0]);
        assert_eq!(utxos.len(), 3);
        assert_eq!(utxos[0].path, vec![7, 0, 3]);
        assert_eq!(utxos[0].state, UtxoState::Confirmed);
        assert_eq!(utxos[1].state, UtxoState::Sending);
        assert_eq!(utxos[2].path, vec![7, 0]);
    }

    #[test]
    fn subscribe_request_serializes_camel_case() {
        let req = SubscribeRequest {
            public_master: "xpub".into(),
            after: "2014-01-01".into(),
            look_ahead: 20,
            first_index: 0,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["publicMaster"], "xpub");
        assert_eq!(json["lookAhead"], 20);
        assert_eq!(json["firstIndex"], 0);
    }

    #[test]
    fn transaction_decodes_scripts_and_paths() {
        let json = r#"{
            "hash": "ff", "version": 1, "lockTime": 0,
            "blockTime": 1400000000, "blockHash": "00ab", "height": 300000,
            "inputs": [{"sourceHash": "ee", "ix": 1, "script": "UVI=", "sequence": 4294967295}],
            "outputs": [
                {"script": "dqk=", "value": 900, "ix": 0, "addressId": [2]},
                {"script": "dqk=", "value": 100, "ix": 1}
            ]
        }"#;
        let wire: WireTransaction = serde_json::from_str(json).unwrap();
        let tx = wire.into_transaction(&[5, 0]).unwrap();
        assert_eq!(tx.inputs[0].script, vec![0x51, 0x52]);
        assert_eq!(tx.outputs[0].path, Some(vec![5, 0, 2]));
        assert_eq!(tx.outputs[1].path, None);
        assert_eq!(tx.block.unwrap().height, 300_000);
        assert_eq!(tx.timestamp, Some(1_400_000_000));
    }

    #[test]
    fn transaction_rejects_bad_base64() {
        let wire = WireTransaction {
            hash: "ff".into(),
            version: 1,
            lock_time: 0,
            block_time: None,
            block_hash: None,
            height: None,
            inputs: vec![],
            outputs: vec![WireOutput {
                script: "***".into(),
                value: 1,
                ix: 0,
                address_id: None,
            }],
        };
        assert!(matches!(
            wire.into_transaction(&[]),
            Err(BackendError::Decode(_))
        ));
    }

    #[test]
    fn send_request_hashes_raw_bytes() {
        let req = SendRequest::new(&[1, 2, 3]);
        assert_eq!(req.transaction, "AQID");
        assert_eq!(
            STANDARD.decode(&req.transaction_hash).unwrap(),
            trove_core::crypto::double_sha256(&[1, 2, 3]).to_vec()
        );
    }
}
