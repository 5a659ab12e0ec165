//! Wallet configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, an
//! optional file (any format the `config` crate recognises by extension),
//! and `TROVE__*` environment variables (`TROVE__FEE_PER_KB=20000`).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use trove_backend::BackendConfig;
use trove_core::coin::{ScriptType, ScriptTypeRule};
use trove_core::constants::{
    BITCOIN_XPUB_VERSION, DEFAULT_DUST_THRESHOLD, DEFAULT_FEE_PER_KB, TESTNET_XPUB_VERSION,
};

use crate::builder::FeePolicy;
use crate::error::WalletError;

/// Settings for one coin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinPolicy {
    pub coin_name: String,
    /// SLIP-44 coin index used in account paths.
    pub bip32_index: u32,
    pub xpub_version: u32,
    /// Version byte of this coin's own pay-to-pubkey-hash addresses.
    pub address_version: u8,
    /// Foreign address versions accepted as recipients.
    pub script_types: Vec<ScriptTypeRule>,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub fee_per_kb: u64,
    pub dust_threshold: u64,
    /// Coin used for new accounts when the device supports it.
    pub default_coin: String,
    /// Derive accounts at `m/44'/coin'/account'` rather than the legacy
    /// `m/coin/0'/account'` layout.
    pub use_bip44: bool,
    /// Persisted device records with a different version are discarded.
    pub storage_version: u32,
    pub coins: Vec<CoinPolicy>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            fee_per_kb: DEFAULT_FEE_PER_KB,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            default_coin: "Bitcoin".to_string(),
            use_bip44: true,
            storage_version: 1,
            coins: vec![
                CoinPolicy {
                    coin_name: "Bitcoin".to_string(),
                    bip32_index: 0,
                    xpub_version: BITCOIN_XPUB_VERSION,
                    address_version: 0,
                    script_types: vec![ScriptTypeRule::new(5, ScriptType::PayToScriptHash)],
                    backend: BackendConfig {
                        xpub_version: BITCOIN_XPUB_VERSION,
                        ..BackendConfig::with_endpoint("http://127.0.0.1:3000/bitcoin")
                    },
                },
                CoinPolicy {
                    coin_name: "Testnet".to_string(),
                    bip32_index: 1,
                    xpub_version: TESTNET_XPUB_VERSION,
                    address_version: 111,
                    script_types: vec![ScriptTypeRule::new(196, ScriptType::PayToScriptHash)],
                    backend: BackendConfig {
                        xpub_version: TESTNET_XPUB_VERSION,
                        ..BackendConfig::with_endpoint("http://127.0.0.1:3000/testnet")
                    },
                },
            ],
        }
    }
}

impl WalletConfig {
    /// Layer an optional file and the environment over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, WalletError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let loaded = builder
            .add_source(config::Environment::with_prefix("TROVE").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(loaded)
    }

    pub fn coin(&self, coin_name: &str) -> Option<&CoinPolicy> {
        self.coins.iter().find(|c| c.coin_name == coin_name)
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            fee_per_kb: self.fee_per_kb,
            dust_threshold: self.dust_threshold,
        }
    }

    /// Backend configs keyed by coin name.
    pub fn backends(&self) -> HashMap<String, BackendConfig> {
        self.coins
            .iter()
            .map(|c| (c.coin_name.clone(), c.backend.clone()))
            .collect()
    }
}
