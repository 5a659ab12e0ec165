//! Coin selection.
//!
//! Confirmed outputs are spent before unconfirmed ones; within each group
//! the largest outputs go first, taken greedily until the target is met.

use trove_core::types::{Utxo, UtxoState};

use crate::error::WalletError;

/// Result of coin selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
    /// Selected UTXOs, in spending order.
    pub selected: Vec<Utxo>,
    /// Sum of the selected values.
    pub total: u64,
}

/// Confirmed-first, largest-first greedy selector.
pub struct CoinSelector;

impl CoinSelector {
    /// Select spendable UTXOs whose values sum to at least `target`.
    pub fn select(utxos: &[Utxo], target: u64) -> Result<CoinSelection, WalletError> {
        let mut candidates: Vec<&Utxo> = utxos.iter().filter(|u| u.state.is_spendable()).collect();
        candidates.sort_by(|a, b| {
            let a_unconfirmed = a.state != UtxoState::Confirmed;
            let b_unconfirmed = b.state != UtxoState::Confirmed;
            a_unconfirmed
                .cmp(&b_unconfirmed)
                .then(b.value.cmp(&a.value))
        });

        let mut selected = Vec::new();
        let mut total: u64 = 0;
        for utxo in candidates {
            if total >= target && !selected.is_empty() {
                break;
            }
            total = total.saturating_add(utxo.value);
            selected.push(utxo.clone());
        }

        if total < target || selected.is_empty() {
            return Err(WalletError::InsufficientFunds {
                have: total,
                need: target,
            });
        }
        Ok(CoinSelection { selected, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(hash: &str, value: u64, state: UtxoState) -> Utxo {
        Utxo {
            tx_hash: hash.into(),
            index: 0,
            value,
            path: vec![0, 0],
            state,
        }
    }

    #[test]
    fn confirmed_are_spent_first() {
        let utxos = vec![
            utxo("big-unconfirmed", 10_000, UtxoState::Receiving),
            utxo("small-confirmed", 3_000, UtxoState::Confirmed),
            utxo("mid-confirmed", 5_000, UtxoState::Confirmed),
        ];
        let sel = CoinSelector::select(&utxos, 7_000).unwrap();
        let order: Vec<&str> = sel.selected.iter().map(|u| u.tx_hash.as_str()).collect();
        assert_eq!(order, vec!["mid-confirmed", "small-confirmed"]);
        assert_eq!(sel.total, 8_000);
    }

    #[test]
    fn single_large_confirmed_covers_target() {
        let utxos = vec![
            utxo("a", 100_000, UtxoState::Confirmed),
            utxo("b", 50_000, UtxoState::Receiving),
            utxo("c", 20_000, UtxoState::Confirmed),
        ];
        let sel = CoinSelector::select(&utxos, 60_000).unwrap();
        assert_eq!(sel.selected, vec![utxos[0].clone()]);
        assert_eq!(sel.total, 100_000);
    }

    #[test]
    fn falls_through_to_unconfirmed() {
        let utxos = vec![
            utxo("confirmed", 1_000, UtxoState::Confirmed),
            utxo("change", 2_000, UtxoState::Change),
        ];
        let sel = CoinSelector::select(&utxos, 2_500).unwrap();
        assert_eq!(sel.selected.len(), 2);
        assert_eq!(sel.selected[0].tx_hash, "confirmed");
    }

    #[test]
    fn sending_outputs_are_never_selected() {
        let utxos = vec![utxo("sending", 50_000, UtxoState::Sending)];
        assert_eq!(
            CoinSelector::select(&utxos, 1_000),
            Err(WalletError::InsufficientFunds { have: 0, need: 1_000 })
        );
    }

    #[test]
    fn insufficient_reports_spendable_total() {
        let utxos = vec![
            utxo("a", 400, UtxoState::Confirmed),
            utxo("b", 500, UtxoState::Receiving),
        ];
        assert_eq!(
            CoinSelector::select(&utxos, 1_000),
            Err(WalletError::InsufficientFunds { have: 900, need: 1_000 })
        );
    }

    #[test]
    fn stops_once_target_met() {
        let utxos = vec![
            utxo("a", 9_000, UtxoState::Confirmed),
            utxo("b", 8_000, UtxoState::Confirmed),
        ];
        let sel = CoinSelector::select(&utxos, 9_000).unwrap();
        assert_eq!(sel.selected.len(), 1);
    }
}
