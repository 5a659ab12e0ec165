//! Base58check pay-to-pubkey-hash addresses.
//!
//! Format: `base58check(version || HASH160(compressed pubkey))`, 25 bytes
//! once the checksum is appended.

use crate::constants::{ADDRESS_LEN, CHECKSUM_LEN};
use crate::crypto::{base58check_decode, base58check_encode, hash160};
use crate::error::ValidationError;
use crate::hdnode::HdNode;

/// The payload of a decoded address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodedAddress {
    pub version: u8,
    pub hash: [u8; 20],
}

/// Encode the address of `node`'s public key under `version`.
pub fn encode_address(node: &HdNode, version: u8) -> String {
    encode_hash(version, &hash160(&node.public_key_bytes()))
}

/// Encode an address from a raw 20-byte hash.
pub fn encode_hash(version: u8, hash: &[u8; 20]) -> String {
    let mut payload = [0u8; 21];
    payload[0] = version;
    payload[1..].copy_from_slice(hash);
    base58check_encode(&payload)
}

/// Decode and checksum-verify an address string.
pub fn decode_address(address: &str) -> Result<DecodedAddress, ValidationError> {
    let payload = base58check_decode(address.trim())?;
    if payload.len() + CHECKSUM_LEN != ADDRESS_LEN {
        return Err(ValidationError::InvalidLength {
            expected: ADDRESS_LEN,
            got: payload.len() + CHECKSUM_LEN,
        });
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[1..]);
    Ok(DecodedAddress {
        version: payload[0],
        hash,
    })
}
