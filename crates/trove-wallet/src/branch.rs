//! One derivation branch (external or change) of an account.
//!
//! A branch caches the UTXOs and transactions the backend reports for its
//! node. Updates are applied under a single lock, so readers see either the
//! previous or the next snapshot, never a mix.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trove_backend::{BackendError, BackendSync, PushMessage, Subscription, UpdateStatus};
use trove_core::address::encode_address;
use trove_core::error::ValidationError;
use trove_core::hdnode::{derive_child, HdNode};
use trove_core::types::{Address, Transaction, Utxo};

use crate::error::WalletError;
use crate::history::merge_transactions;

/// Published after every applied or failed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchEvent {
    Updated { balance: u64, offset: u32 },
    Failed(String),
}

#[derive(Debug, Default)]
struct BranchCache {
    offset: u32,
    utxos: Option<Vec<Utxo>>,
    transactions: Option<Vec<Transaction>>,
}

pub struct Branch {
    node: HdNode,
    address_version: u8,
    backend: BackendSync,
    cache: Arc<Mutex<BranchCache>>,
    events: broadcast::Sender<BranchEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// One past the highest address index among own outputs, never lower than
/// `offset`.
pub fn next_offset(offset: u32, txs: &[Transaction]) -> u32 {
    txs.iter()
        .flat_map(|tx| tx.own_outputs())
        .filter_map(|o| o.path.as_ref().and_then(|p| p.last()))
        .fold(offset, |acc, &index| acc.max(index.saturating_add(1)))
}

fn apply_update(
    cache: &Mutex<BranchCache>,
    base_path: &[u32],
    message: &PushMessage,
    txs: Vec<Transaction>,
) -> BranchEvent {
    let utxos = message.utxos(base_path);
    let mut merged = Vec::with_capacity(txs.len());
    merge_transactions(&mut merged, txs);

    let mut cache = cache.lock();
    cache.offset = next_offset(cache.offset, &merged);
    let balance = utxos
        .iter()
        .filter(|u| u.state.is_spendable())
        .map(|u| u.value)
        .sum();
    cache.utxos = Some(utxos);
    cache.transactions = Some(merged);
    BranchEvent::Updated {
        balance,
        offset: cache.offset,
    }
}

async fn fetch_history(
    backend: &BackendSync,
    node: &HdNode,
) -> Result<Vec<Transaction>, BackendError> {
    backend
        .transactions(node)
        .await?
        .into_iter()
        .map(|wire| wire.into_transaction(&node.path))
        .collect()
}

async fn run_updates(
    mut subscription: Subscription,
    node: HdNode,
    backend: BackendSync,
    cache: Arc<Mutex<BranchCache>>,
    events: broadcast::Sender<BranchEvent>,
    ready: oneshot::Sender<Result<(), WalletError>>,
) {
    let mut ready = Some(ready);
    while let Some(message) = subscription.next().await {
        if message.update_status() == UpdateStatus::Pending {
            debug!(xpub = %subscription.xpub(), "pending update ignored");
            continue;
        }
        match fetch_history(&backend, &node).await {
            Ok(txs) => {
                let event = apply_update(&cache, &node.path, &message, txs);
                debug!(xpub = %subscription.xpub(), ?event, "branch updated");
                let _ = events.send(event);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(xpub = %subscription.xpub(), error = %e, "history fetch failed");
                let _ = events.send(BranchEvent::Failed(e.to_string()));
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e.into()));
                    return;
                }
            }
        }
    }
}

impl Branch {
    pub fn new(node: HdNode, address_version: u8, backend: BackendSync) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            node,
            address_version,
            backend,
            cache: Arc::new(Mutex::new(BranchCache::default())),
            events,
            task: Mutex::new(None),
        }
    }

    pub fn node(&self) -> &HdNode {
        &self.node
    }

    pub fn offset(&self) -> u32 {
        self.cache.lock().offset
    }

    /// Whether the first update has been applied.
    pub fn is_initialized(&self) -> bool {
        let cache = self.cache.lock();
        cache.utxos.is_some() && cache.transactions.is_some()
    }

    pub fn events(&self) -> broadcast::Receiver<BranchEvent> {
        self.events.subscribe()
    }

    /// Address `n` positions past the first unused one. Does not advance
    /// the offset.
    pub fn address(&self, n: u32) -> Result<Address, ValidationError> {
        let index = self
            .offset()
            .checked_add(n)
            .ok_or(ValidationError::ValueOverflow)?;
        self.address_at(index)
    }

    pub fn address_at(&self, index: u32) -> Result<Address, ValidationError> {
        let child = derive_child(&self.node, index)?;
        Ok(Address {
            address: encode_address(&child, self.address_version),
            path: child.path,
            index,
        })
    }

    /// Spendable UTXOs: confirmed, change and receiving.
    pub fn utxos(&self) -> Vec<Utxo> {
        self.cache
            .lock()
            .utxos
            .iter()
            .flatten()
            .filter(|u| u.state.is_spendable())
            .cloned()
            .collect()
    }

    pub fn balance(&self) -> u64 {
        self.utxos().iter().map(|u| u.value).sum()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.cache.lock().transactions.clone().unwrap_or_default()
    }

    pub fn cached_transaction(&self, hash: &str) -> Option<Transaction> {
        self.cache
            .lock()
            .transactions
            .as_ref()?
            .iter()
            .find(|tx| tx.hash == hash)
            .cloned()
    }

    /// Subscribe and wait for the first applied update. Subscribing an
    /// already subscribed branch returns immediately.
    pub async fn subscribe(&self) -> Result<(), WalletError> {
        let Some(subscription) = self.backend.subscribe(&self.node).await? else {
            return Ok(());
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run_updates(
            subscription,
            self.node.clone(),
            self.backend.clone(),
            self.cache.clone(),
            self.events.clone(),
            ready_tx,
        ));
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        let result = ready_rx
            .await
            .map_err(|_| WalletError::Backend(BackendError::Closed))?;
        if result.is_ok() {
            info!(xpub = %self.backend.xpub(&self.node), offset = self.offset(), "branch initialized");
        }
        result
    }

    /// Stop updates and drop the cached ledger. The offset is kept.
    pub fn unsubscribe(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.backend.unsubscribe(&self.node);
        let mut cache = self.cache.lock();
        cache.utxos = None;
        cache.transactions = None;
    }

    /// Apply a balance update with its history; the update task does the same.
    pub fn apply(&self, message: &PushMessage, txs: Vec<Transaction>) -> BranchEvent {
        let event = apply_update(&self.cache, &self.node.path, message, txs);
        let _ = self.events.send(event.clone());
        event
    }
}

impl Drop for Branch {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use trove_backend::{BackendConfig, HttpBackend, WireUtxo};
    use trove_core::hdnode::decode_xpub;
    use trove_core::types::TxOutput;

    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    fn branch() -> Branch {
        let config = BackendConfig::default();
        let api = Arc::new(HttpBackend::new(config.clone()).unwrap());
        let backend = BackendSync::new("Bitcoin", api, config);
        let node = decode_xpub(XPUB).unwrap().1.with_path(vec![0]);
        Branch::new(node, 0, backend)
    }

    fn owned_tx(hash: &str, index: u32) -> Transaction {
        Transaction {
            hash: hash.into(),
            version: 1,
            lock_time: 0,
            timestamp: Some(1),
            block: None,
            inputs: vec![],
            outputs: vec![TxOutput {
                script: vec![],
                value: 1_000,
                index: 0,
                path: Some(vec![0, index]),
            }],
            analysis: None,
            balance: None,
        }
    }

    fn update(values: &[(u64, bool)]) -> PushMessage {
        let record = |(i, &(value, _)): (usize, &(u64, bool))| WireUtxo {
            transaction_hash: format!("tx{i}"),
            ix: 0,
            value,
            address_id: Some(vec![i as u32]),
        };
        PushMessage {
            public_master: XPUB.into(),
            status: "FINISHED".into(),
            confirmed: values.iter().enumerate().filter(|(_, v)| !v.1).map(record).collect(),
            change: vec![],
            sending: values.iter().enumerate().filter(|(_, v)| v.1).map(record).collect(),
            receiving: vec![],
        }
    }

    #[test]
    fn offset_advances_past_highest_own_output() {
        let txs = vec![owned_tx("a", 3), owned_tx("b", 1)];
        assert_eq!(next_offset(0, &txs), 4);
        assert_eq!(next_offset(9, &txs), 9);
    }

    #[test]
    fn address_uses_offset_without_advancing() {
        let b = branch();
        b.apply(&update(&[]), vec![owned_tx("a", 4)]);
        let addr = b.address(1).unwrap();
        assert_eq!(addr.index, 6);
        assert_eq!(addr.path, vec![0, 6]);
        assert_eq!(b.offset(), 5);
    }

    #[test]
    fn apply_initializes_and_excludes_sending() {
        let b = branch();
        assert!(!b.is_initialized());
        let event = b.apply(&update(&[(1_000, false), (500, true)]), vec![]);
        assert!(b.is_initialized());
        assert_eq!(event, BranchEvent::Updated { balance: 1_000, offset: 0 });
        assert_eq!(b.utxos().len(), 1);
        assert_eq!(b.utxos()[0].path, vec![0, 0]);
    }

    #[test]
    fn duplicate_hashes_in_one_batch_are_merged() {
        let b = branch();
        b.apply(&update(&[]), vec![owned_tx("a", 0), owned_tx("a", 0)]);
        assert_eq!(b.transactions().len(), 1);
        assert!(b.cached_transaction("a").is_some());
        assert!(b.cached_transaction("z").is_none());
    }

    #[tokio::test]
    async fn unsubscribe_drops_cache_but_keeps_offset() {
        let b = branch();
        b.apply(&update(&[(1_000, false)]), vec![owned_tx("a", 2)]);
        b.unsubscribe();
        assert!(!b.is_initialized());
        assert_eq!(b.balance(), 0);
        assert_eq!(b.offset(), 3);
    }

    proptest! {
        #[test]
        fn offset_is_monotonic(start in 0u32..1_000, indices in proptest::collection::vec(0u32..2_000, 0..20)) {
            let txs: Vec<Transaction> = indices
                .iter()
                .enumerate()
                .map(|(i, &index)| owned_tx(&format!("t{i}"), index))
                .collect();
            let next = next_offset(start, &txs);
            let expected = indices.iter().map(|&i| i + 1).fold(start, u32::max);
            prop_assert_eq!(next, expected);
        }
    }
}
