//! Coin parameters as reported by the device, and the address-version to
//! script-type table used when building outputs.

use serde::{Deserialize, Serialize};

/// Per-coin parameters from the device features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinParams {
    pub coin_name: String,
    pub coin_shortcut: String,
    /// Version byte of this coin's pay-to-pubkey-hash addresses.
    pub address_type: u8,
    /// Maximum fee per kilobyte the device accepts without a warning.
    pub maxfee_kb: u64,
}

impl CoinParams {
    pub fn bitcoin() -> Self {
        Self {
            coin_name: "Bitcoin".into(),
            coin_shortcut: "BTC".into(),
            address_type: 0,
            maxfee_kb: 100_000,
        }
    }

    pub fn testnet() -> Self {
        Self {
            coin_name: "Testnet".into(),
            coin_shortcut: "TEST".into(),
            address_type: 111,
            maxfee_kb: 10_000_000,
        }
    }
}

/// Output script kinds understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptType {
    #[serde(rename = "PAYTOADDRESS")]
    PayToAddress,
    #[serde(rename = "PAYTOSCRIPTHASH")]
    PayToScriptHash,
}

/// Maps a foreign address version byte to the script type paying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptTypeRule {
    pub version: u8,
    pub script_type: ScriptType,
}

impl ScriptTypeRule {
    pub fn new(version: u8, script_type: ScriptType) -> Self {
        Self { version, script_type }
    }
}

/// Resolve the script type for an address version. The coin's own address
/// type always pays to address; anything else must appear in `rules`.
pub fn resolve_script_type(
    coin: &CoinParams,
    rules: &[ScriptTypeRule],
    version: u8,
) -> Option<ScriptType> {
    if version == coin.address_type {
        return Some(ScriptType::PayToAddress);
    }
    rules
        .iter()
        .find(|rule| rule.version == version)
        .map(|rule| rule.script_type)
}
