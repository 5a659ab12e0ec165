//! Transaction history: merging, analysis and running balances.

use std::cmp::Ordering;
use std::collections::HashMap;

use trove_core::types::{Transaction, TxAnalysis, TxKind};

/// Merge `incoming` into `existing`, deduplicating by hash. Outputs seen
/// with a path in either copy keep it.
pub fn merge_transactions(existing: &mut Vec<Transaction>, incoming: Vec<Transaction>) {
    let mut positions: HashMap<String, usize> = existing
        .iter()
        .enumerate()
        .map(|(i, tx)| (tx.hash.clone(), i))
        .collect();

    for tx in incoming {
        match positions.get(&tx.hash) {
            Some(&i) => merge_into(&mut existing[i], tx),
            None => {
                positions.insert(tx.hash.clone(), existing.len());
                existing.push(tx);
            }
        }
    }
}

fn merge_into(target: &mut Transaction, other: Transaction) {
    for output in other.outputs {
        match target.outputs.iter_mut().find(|o| o.index == output.index) {
            Some(existing) => {
                if existing.path.is_none() {
                    existing.path = output.path;
                }
            }
            None => target.outputs.push(output),
        }
    }
    if target.timestamp.is_none() {
        target.timestamp = other.timestamp;
    }
    if target.block.is_none() {
        target.block = other.block;
    }
    target.analysis = None;
    target.balance = None;
}

/// Classify every transaction against the wallet's own outputs.
///
/// An input is ours when it spends an output of a transaction in `txs` that
/// carries a path. Inputs spending outputs we never saw are not counted.
pub fn analyze(txs: &mut [Transaction]) {
    let owned: HashMap<(String, u32), u64> = txs
        .iter()
        .flat_map(|tx| {
            tx.own_outputs()
                .map(move |o| ((tx.hash.clone(), o.index), o.value))
        })
        .collect();

    for tx in txs.iter_mut() {
        let received: u64 = tx.own_outputs().map(|o| o.value).sum();
        let spent: u64 = tx
            .inputs
            .iter()
            .filter_map(|i| owned.get(&(i.source_hash.clone(), i.index)))
            .sum();
        let kind = if spent == 0 {
            TxKind::Received
        } else if tx.outputs.iter().all(|o| o.path.is_some()) {
            TxKind::SelfTransfer
        } else {
            TxKind::Sent
        };
        let impact = i64::try_from(received).unwrap_or(i64::MAX)
            - i64::try_from(spent).unwrap_or(i64::MAX);
        tx.analysis = Some(TxAnalysis { kind, impact });
    }
}

/// Newest first; unconfirmed before confirmed; within one timestamp,
/// `Sent` before `SelfTransfer` before `Received`.
fn newest_first(a: &Transaction, b: &Transaction) -> Ordering {
    let ta = a.timestamp.unwrap_or(i64::MAX);
    let tb = b.timestamp.unwrap_or(i64::MAX);
    tb.cmp(&ta).then_with(|| {
        let ka = a.analysis.map(|x| x.kind);
        let kb = b.analysis.map(|x| x.kind);
        ka.cmp(&kb)
    })
}

/// Sort newest first and assign each transaction the running balance
/// accumulated from the oldest.
pub fn assign_balances(txs: &mut [Transaction]) {
    txs.sort_by(newest_first);
    let mut running: i64 = 0;
    for tx in txs.iter_mut().rev() {
        match tx.analysis {
            Some(analysis) => {
                running += analysis.impact;
                tx.balance = Some(running);
            }
            None => tx.balance = None,
        }
    }
}

/// Merge, analyze and balance in one pass.
pub fn build_history(sources: impl IntoIterator<Item = Vec<Transaction>>) -> Vec<Transaction> {
    let mut merged = Vec::new();
    for source in sources {
        merge_transactions(&mut merged, source);
    }
    analyze(&mut merged);
    assign_balances(&mut merged);
    merged
}
