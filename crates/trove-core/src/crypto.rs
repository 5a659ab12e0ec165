//! Hashing and base58check primitives.
//!
//! HASH160 is `RIPEMD160(SHA256(x))`; checksums are the first four bytes of
//! `SHA256(SHA256(payload))`.

use std::sync::OnceLock;

use ripemd::Ripemd160;
use secp256k1::{All, Secp256k1};
use sha2::{Digest, Sha256};

use crate::constants::CHECKSUM_LEN;
use crate::error::ValidationError;

static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();

/// Process-wide secp256k1 context.
pub fn secp() -> &'static Secp256k1<All> {
    SECP.get_or_init(Secp256k1::new)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(sha256(data)).into()
}

/// Append the double-SHA256 checksum and base58-encode.
pub fn base58check_encode(payload: &[u8]) -> String {
    let checksum = double_sha256(payload);
    let mut data = Vec::with_capacity(payload.len() + CHECKSUM_LEN);
    data.extend_from_slice(payload);
    data.extend_from_slice(&checksum[..CHECKSUM_LEN]);
    bs58::encode(data).into_string()
}

/// Decode base58 and verify the trailing checksum, returning the payload.
pub fn base58check_decode(encoded: &str) -> Result<Vec<u8>, ValidationError> {
    let mut data = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| ValidationError::InvalidBase58(e.to_string()))?;
    if data.len() < CHECKSUM_LEN {
        return Err(ValidationError::InvalidLength {
            expected: CHECKSUM_LEN,
            got: data.len(),
        });
    }
    let split = data.len() - CHECKSUM_LEN;
    let checksum = double_sha256(&data[..split]);
    if checksum[..CHECKSUM_LEN] != data[split..] {
        return Err(ValidationError::InvalidChecksum);
    }
    data.truncate(split);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_empty() {
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hash160_empty() {
        assert_eq!(
            hex::encode(hash160(b"")),
            "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb"
        );
    }

    #[test]
    fn base58check_roundtrip() {
        let payload = [0u8, 1, 2, 3, 250];
        let encoded = base58check_encode(&payload);
        assert_eq!(base58check_decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn base58check_rejects_flipped_checksum() {
        let mut data = vec![0u8, 9, 9, 9];
        let checksum = double_sha256(&data);
        data.extend_from_slice(&checksum[..CHECKSUM_LEN]);
        let last = data.len() - 1;
        data[last] ^= 0x01;
        let tampered = bs58::encode(data).into_string();
        assert_eq!(
            base58check_decode(&tampered),
            Err(ValidationError::InvalidChecksum)
        );
    }

    #[test]
    fn base58check_rejects_bad_alphabet() {
        assert!(matches!(
            base58check_decode("0OIl"),
            Err(ValidationError::InvalidBase58(_))
        ));
    }

    #[test]
    fn base58check_rejects_short_input() {
        assert!(matches!(
            base58check_decode("1"),
            Err(ValidationError::InvalidLength { .. })
        ));
    }
}
