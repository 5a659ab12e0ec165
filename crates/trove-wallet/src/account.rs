//! Accounts: an external and a change branch under one account node.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use trove_backend::BackendSync;
use trove_core::coin::{CoinParams, ScriptTypeRule};
use trove_core::error::ValidationError;
use trove_core::hdnode::{derive_child, encode_xpub, HdNode};
use trove_core::traits::TxSigner;
use trove_core::types::{Address, PreparedTx, RefTransaction, Transaction, TxKind, Utxo};

use crate::branch::Branch;
use crate::builder::{FeePolicy, OutputRow, Recipient, TransactionBuilder};
use crate::error::WalletError;
use crate::history;

const EXTERNAL: u32 = 0;
const CHANGE: u32 = 1;

/// Per-coin policy an account builds transactions with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPolicy {
    pub fees: FeePolicy,
    pub xpub_version: u32,
    pub script_types: Vec<ScriptTypeRule>,
}

/// A receiving address that has seen funds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsedAddress {
    pub address: String,
    pub path: Option<Vec<u32>>,
    pub timestamp: Option<i64>,
    /// Unspent value still held at the address.
    pub balance: u64,
}

pub struct Account {
    id: u32,
    coin: CoinParams,
    node: HdNode,
    external: Branch,
    change: Branch,
    backend: BackendSync,
    policy: AccountPolicy,
}

impl Account {
    /// Create an account over `node`, deriving its two branches.
    pub fn new(
        id: u32,
        coin: CoinParams,
        node: HdNode,
        backend: BackendSync,
        policy: AccountPolicy,
    ) -> Result<Self, ValidationError> {
        let external = derive_child(&node, EXTERNAL)?;
        let change = derive_child(&node, CHANGE)?;
        Ok(Self::from_nodes(id, coin, node, external, change, backend, policy))
    }

    /// Rebuild an account from previously derived nodes.
    pub fn from_nodes(
        id: u32,
        coin: CoinParams,
        node: HdNode,
        external: HdNode,
        change: HdNode,
        backend: BackendSync,
        policy: AccountPolicy,
    ) -> Self {
        let version = coin.address_type;
        Self {
            id,
            external: Branch::new(external, version, backend.clone()),
            change: Branch::new(change, version, backend.clone()),
            coin,
            node,
            backend,
            policy,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn label(&self) -> String {
        format!("Account #{}", self.id + 1)
    }

    pub fn coin(&self) -> &CoinParams {
        &self.coin
    }

    pub fn node(&self) -> &HdNode {
        &self.node
    }

    pub fn external(&self) -> &Branch {
        &self.external
    }

    pub fn change(&self) -> &Branch {
        &self.change
    }

    pub fn policy(&self) -> &AccountPolicy {
        &self.policy
    }

    /// Account-level extended public key.
    pub fn public_key(&self) -> String {
        encode_xpub(&self.node, self.policy.xpub_version)
    }

    /// Subscribe both branches and wait until each has its first update.
    pub async fn subscribe(&self) -> Result<(), WalletError> {
        futures::try_join!(self.external.subscribe(), self.change.subscribe())?;
        info!(account = self.id, coin = %self.coin.coin_name, balance = self.balance(), "account subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self) {
        self.external.unsubscribe();
        self.change.unsubscribe();
        debug!(account = self.id, "account unsubscribed");
    }

    pub fn is_initialized(&self) -> bool {
        self.external.is_initialized() && self.change.is_initialized()
    }

    /// Whether the account has never transacted.
    pub fn is_empty(&self) -> bool {
        self.external.transactions().is_empty() && self.change.transactions().is_empty()
    }

    pub fn address(&self, n: u32) -> Result<Address, ValidationError> {
        self.external.address(n)
    }

    pub fn change_address(&self, n: u32) -> Result<Address, ValidationError> {
        self.change.address(n)
    }

    pub fn utxos(&self) -> Vec<Utxo> {
        let mut utxos = self.external.utxos();
        utxos.extend(self.change.utxos());
        utxos
    }

    pub fn balance(&self) -> u64 {
        self.external.balance() + self.change.balance()
    }

    /// Merged history, newest first, with analysis and running balances.
    pub fn transactions(&self) -> Vec<Transaction> {
        history::build_history([self.external.transactions(), self.change.transactions()])
    }

    /// The newest running balance disagrees with the UTXO balance.
    pub fn is_inconsistent(&self) -> bool {
        if !self.is_initialized() {
            return false;
        }
        let txs = self.transactions();
        match txs.first().and_then(|tx| tx.balance) {
            Some(newest) => newest != i64::try_from(self.balance()).unwrap_or(i64::MAX),
            None => false,
        }
    }

    fn address_for_path(&self, path: &[u32]) -> Option<String> {
        let (index, parent) = path.split_last()?;
        [&self.external, &self.change]
            .into_iter()
            .find(|b| b.node().path == parent)
            .and_then(|b| b.address_at(*index).ok())
            .map(|a| a.address)
    }

    /// Receiving addresses with the unspent value they still hold, newest
    /// first.
    pub fn used_addresses(&self) -> Vec<UsedAddress> {
        let utxos = self.utxos();
        let mut rows: Vec<UsedAddress> = self
            .transactions()
            .into_iter()
            .filter(|tx| tx.analysis.is_some_and(|a| a.kind == TxKind::Received))
            .filter_map(|tx| {
                let matching: Vec<&Utxo> = utxos.iter().filter(|u| u.tx_hash == tx.hash).collect();
                let balance = matching.iter().map(|u| u.value).sum();
                let path = tx.own_outputs().next()?.path.clone()?;
                Some(UsedAddress {
                    address: self.address_for_path(&path)?,
                    path: matching.first().map(|u| u.path.clone()).or(Some(path)),
                    timestamp: tx.timestamp,
                    balance,
                })
            })
            .collect();

        rows.sort_by(|a, b| a.address.cmp(&b.address));
        let mut aggregated: Vec<UsedAddress> = Vec::with_capacity(rows.len());
        for row in rows {
            match aggregated.last_mut() {
                Some(prev) if prev.address == row.address => prev.balance += row.balance,
                _ => aggregated.push(row),
            }
        }
        aggregated.sort_by(|a, b| {
            b.timestamp
                .unwrap_or(i64::MAX)
                .cmp(&a.timestamp.unwrap_or(i64::MAX))
        });
        aggregated
    }

    pub fn builder(&self) -> TransactionBuilder {
        TransactionBuilder::new(
            self.coin.clone(),
            self.policy.fees,
            self.policy.script_types.clone(),
        )
    }

    /// Build a transaction paying `recipients`, with change to the next
    /// change address.
    pub async fn build_tx(
        &self,
        recipients: &[Recipient],
        signer: &dyn TxSigner,
    ) -> Result<PreparedTx, WalletError> {
        let mut builder = self.builder();
        for r in recipients {
            builder.add_recipient(r.address.clone(), r.amount);
        }
        self.finish(builder, signer).await
    }

    /// Build from free-form output rows; see [`TransactionBuilder::add_rows`].
    pub async fn build_tx_from_rows(
        &self,
        rows: &[OutputRow],
        signer: &dyn TxSigner,
    ) -> Result<PreparedTx, WalletError> {
        let mut builder = self.builder();
        builder.add_rows(rows)?;
        self.finish(builder, signer).await
    }

    async fn finish(
        &self,
        builder: TransactionBuilder,
        signer: &dyn TxSigner,
    ) -> Result<PreparedTx, WalletError> {
        if !self.is_initialized() {
            return Err(WalletError::NotInitialized);
        }
        let change = self.change.address(0)?;
        let tx = builder.build(&self.utxos(), change.path, signer).await?;
        debug!(account = self.id, fee = tx.fee, inputs = tx.inputs.len(), "transaction built");
        Ok(tx)
    }

    async fn reference_transaction(&self, hash: &str) -> Result<Transaction, WalletError> {
        if let Some(tx) = self
            .external
            .cached_transaction(hash)
            .or_else(|| self.change.cached_transaction(hash))
        {
            return Ok(tx);
        }
        let node = self.external.node();
        let wire = self.backend.transaction(node, hash).await?;
        Ok(wire.into_transaction(&node.path)?)
    }

    /// Sign `tx` and broadcast it. Returns the raw signed bytes.
    pub async fn send_tx(
        &self,
        tx: &PreparedTx,
        signer: &dyn TxSigner,
    ) -> Result<Vec<u8>, WalletError> {
        let mut seen = HashSet::new();
        let mut refs = Vec::new();
        for input in &tx.inputs {
            if seen.insert(input.prev_hash.as_str()) {
                let source = self.reference_transaction(&input.prev_hash).await?;
                refs.push(RefTransaction::from(&source));
            }
        }

        let raw = signer
            .sign_tx(&tx.inputs, &tx.outputs, &refs, &self.coin)
            .await?;
        self.backend
            .send(&raw)
            .await
            .map_err(|e| WalletError::Broadcast {
                raw_tx: hex::encode(&raw),
                message: e.to_string(),
            })?;
        info!(account = self.id, fee = tx.fee, "transaction sent");
        Ok(raw)
    }
}
