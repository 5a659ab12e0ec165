//! Protocol constants. All monetary values in satoshis (1 BTC = 10^8 satoshis).

pub const COIN: u64 = 100_000_000;

/// Number of decimal places shown for a coin amount.
pub const DECIMALS: u32 = 8;

/// First hardened child index (`2^31`).
pub const HARDENED: u32 = 0x8000_0000;

/// Extended public key version bytes for Bitcoin mainnet (`xpub`).
pub const BITCOIN_XPUB_VERSION: u32 = 0x0488_B21E;

/// Extended private key version bytes for Bitcoin mainnet (`xprv`).
pub const BITCOIN_XPRV_VERSION: u32 = 0x0488_ADE4;

/// Extended public key version bytes for Bitcoin testnet (`tpub`).
pub const TESTNET_XPUB_VERSION: u32 = 0x0435_87CF;

/// Serialized extended key length before the checksum.
pub const EXTENDED_KEY_LEN: usize = 78;

/// Serialized address length: version byte, hash160 and checksum.
pub const ADDRESS_LEN: usize = 25;

/// Length of the base58check checksum suffix.
pub const CHECKSUM_LEN: usize = 4;

/// Outputs below this value are rejected as recipients and folded into the
/// fee when they would be change.
pub const DEFAULT_DUST_THRESHOLD: u64 = 5_430;

/// Fee per started kilobyte of serialized transaction.
pub const DEFAULT_FEE_PER_KB: u64 = 10_000;

/// Transaction size unit the fee rate is quoted in.
pub const FEE_SIZE_UNIT: u64 = 1_000;

/// BIP44 purpose field.
pub const BIP44_PURPOSE: u32 = 44;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardened_is_two_to_the_31() {
        assert_eq!(HARDENED, 1 << 31);
    }

    #[test]
    fn address_len_matches_layout() {
        assert_eq!(ADDRESS_LEN, 1 + 20 + CHECKSUM_LEN);
    }
}
