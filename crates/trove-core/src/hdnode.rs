//! BIP32 hierarchical deterministic nodes.
//!
//! Only non-hardened (public) child derivation is supported here; hardened
//! account levels are derived on the device and handed back as public
//! nodes. A node carrying a private key (loaded from an `xprv`) derives the
//! matching private child alongside the public one.
//!
//! # Serialization
//!
//! Extended keys use the standard 78-byte layout followed by a 4-byte
//! checksum, base58-encoded:
//!
//! | bytes | field        |
//! |-------|--------------|
//! | 4     | version      |
//! | 1     | depth        |
//! | 4     | fingerprint  |
//! | 4     | child number |
//! | 32    | chain code   |
//! | 33    | key          |

use std::fmt;

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, SecretKey};
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{EXTENDED_KEY_LEN, HARDENED};
use crate::crypto::{base58check_decode, base58check_encode, hash160, secp};
use crate::error::ValidationError;

type HmacSha512 = Hmac<Sha512>;

/// 32-byte secp256k1 secret, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; 32]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, ValidationError> {
        SecretKey::from_slice(&bytes).map_err(|_| ValidationError::InvalidPrivateKey)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn secret_key(&self) -> Result<SecretKey, ValidationError> {
        SecretKey::from_slice(&self.0).map_err(|_| ValidationError::InvalidPrivateKey)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

/// A BIP32 node. Immutable; derivation returns new nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HdNode {
    pub depth: u8,
    /// First four bytes of the parent's HASH160, big-endian.
    pub fingerprint: u32,
    pub child_num: u32,
    pub chain_code: [u8; 32],
    pub public_key: PublicKey,
    pub private_key: Option<PrivateKey>,
    /// Full derivation path from the master node, when known.
    pub path: Vec<u32>,
}

impl HdNode {
    /// Build a public node from raw fields as reported by a device.
    pub fn from_parts(
        depth: u8,
        fingerprint: u32,
        child_num: u32,
        chain_code: [u8; 32],
        public_key: &[u8],
        path: Vec<u32>,
    ) -> Result<Self, ValidationError> {
        let public_key =
            PublicKey::from_slice(public_key).map_err(|_| ValidationError::InvalidPublicKey)?;
        Ok(Self {
            depth,
            fingerprint,
            child_num,
            chain_code,
            public_key,
            private_key: None,
            path,
        })
    }

    /// Compressed SEC1 public key.
    pub fn public_key_bytes(&self) -> [u8; 33] {
        self.public_key.serialize()
    }

    /// Same node without its private key.
    pub fn neuter(&self) -> Self {
        Self {
            private_key: None,
            ..self.clone()
        }
    }

    /// Attach a derivation path to a node decoded from an extended key.
    pub fn with_path(mut self, path: Vec<u32>) -> Self {
        self.path = path;
        self
    }
}

pub fn harden(index: u32) -> u32 {
    index | HARDENED
}

/// Derive the non-hardened child at `index`.
pub fn derive_child(node: &HdNode, index: u32) -> Result<HdNode, ValidationError> {
    if index >= HARDENED {
        return Err(ValidationError::HardenedDerivation(index));
    }

    let parent_key = node.public_key.serialize();
    let mut mac = HmacSha512::new_from_slice(&node.chain_code)
        .map_err(|_| ValidationError::InvalidTweak(index))?;
    mac.update(&parent_key);
    mac.update(&index.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let mut il = [0u8; 32];
    let mut chain_code = [0u8; 32];
    il.copy_from_slice(&digest[..32]);
    chain_code.copy_from_slice(&digest[32..]);

    let tweak = Scalar::from_be_bytes(il).map_err(|_| ValidationError::InvalidTweak(index))?;
    il.zeroize();
    let public_key = node
        .public_key
        .add_exp_tweak(secp(), &tweak)
        .map_err(|_| ValidationError::InvalidTweak(index))?;

    let private_key = match &node.private_key {
        Some(parent) => {
            let child = parent
                .secret_key()?
                .add_tweak(&tweak)
                .map_err(|_| ValidationError::InvalidTweak(index))?;
            Some(PrivateKey(child.secret_bytes()))
        }
        None => None,
    };

    let parent_hash = hash160(&parent_key);
    let mut path = node.path.clone();
    path.push(index);

    Ok(HdNode {
        depth: node.depth.wrapping_add(1),
        fingerprint: u32::from_be_bytes([parent_hash[0], parent_hash[1], parent_hash[2], parent_hash[3]]),
        child_num: index,
        chain_code,
        public_key,
        private_key,
        path,
    })
}

/// Derive along a relative path of non-hardened indices.
pub fn derive_path(node: &HdNode, path: &[u32]) -> Result<HdNode, ValidationError> {
    path.iter()
        .try_fold(node.clone(), |current, &index| derive_child(&current, index))
}

/// Render a path as `m/44'/0'/0'/0/1`.
pub fn format_path(path: &[u32]) -> String {
    let mut out = String::from("m");
    for &index in path {
        if index >= HARDENED {
            out.push_str(&format!("/{}'", index - HARDENED));
        } else {
            out.push_str(&format!("/{index}"));
        }
    }
    out
}

fn serialize_header(node: &HdNode, version: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(EXTENDED_KEY_LEN);
    data.extend_from_slice(&version.to_be_bytes());
    data.push(node.depth);
    data.extend_from_slice(&node.fingerprint.to_be_bytes());
    data.extend_from_slice(&node.child_num.to_be_bytes());
    data.extend_from_slice(&node.chain_code);
    data
}

/// Serialize the public half of `node` as an extended public key.
pub fn encode_xpub(node: &HdNode, version: u32) -> String {
    let mut data = serialize_header(node, version);
    data.extend_from_slice(&node.public_key.serialize());
    base58check_encode(&data)
}

struct RawExtendedKey {
    version: u32,
    depth: u8,
    fingerprint: u32,
    child_num: u32,
    chain_code: [u8; 32],
    key: [u8; 33],
}

fn decode_raw(encoded: &str) -> Result<RawExtendedKey, ValidationError> {
    let data = base58check_decode(encoded)?;
    if data.len() != EXTENDED_KEY_LEN {
        return Err(ValidationError::InvalidLength {
            expected: EXTENDED_KEY_LEN,
            got: data.len(),
        });
    }
    let be32 = |at: usize| u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    let mut chain_code = [0u8; 32];
    chain_code.copy_from_slice(&data[13..45]);
    let mut key = [0u8; 33];
    key.copy_from_slice(&data[45..78]);
    Ok(RawExtendedKey {
        version: be32(0),
        depth: data[4],
        fingerprint: be32(5),
        child_num: be32(9),
        chain_code,
        key,
    })
}

/// Decode an extended public key, returning its version and node.
///
/// The returned node has an empty path; callers that know where it sits in
/// the tree attach it with [`HdNode::with_path`].
pub fn decode_xpub(encoded: &str) -> Result<(u32, HdNode), ValidationError> {
    let raw = decode_raw(encoded)?;
    let node = HdNode::from_parts(
        raw.depth,
        raw.fingerprint,
        raw.child_num,
        raw.chain_code,
        &raw.key,
        Vec::new(),
    )?;
    Ok((raw.version, node))
}

/// Decode an extended private key. The public key is recomputed from the
/// secret.
pub fn decode_xprv(encoded: &str) -> Result<HdNode, ValidationError> {
    let mut raw = decode_raw(encoded)?;
    if raw.key[0] != 0x00 {
        return Err(ValidationError::InvalidPrivateKeyMarker(raw.key[0]));
    }
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&raw.key[1..]);
    raw.key.zeroize();
    let private_key = PrivateKey::from_bytes(secret)?;
    secret.zeroize();
    let public_key = PublicKey::from_secret_key(secp(), &private_key.secret_key()?);
    Ok(HdNode {
        depth: raw.depth,
        fingerprint: raw.fingerprint,
        child_num: raw.child_num,
        chain_code: raw.chain_code,
        public_key,
        private_key: Some(private_key),
        path: Vec::new(),
    })
}
