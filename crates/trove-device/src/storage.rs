//! Versioned persistence of known devices and their accounts.
//!
//! Everything lives under one key as JSON:
//! `{version, devices: [{id, passphrase, features, accounts: [{id, coin,
//! nodes: {main, external, change}}]}]}`. A record with another version,
//! or one that fails to parse, restores as an empty list.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use trove_core::coin::CoinParams;
use trove_core::hdnode::HdNode;

use crate::error::DeviceError;
use crate::messages::Features;

const DEVICES_KEY: &str = "devices";

/// String key/value persistence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, DeviceError>;

    fn set(&self, key: &str, value: &str) -> Result<(), DeviceError>;
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, DeviceError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), DeviceError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One `<key>.json` file per key under a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/trove`, if the platform has a data directory.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("trove"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, DeviceError> {
        match fs::read_to_string(self.file(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), DeviceError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.file(key), value)?;
        Ok(())
    }
}

/// Serialized BIP32 node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub depth: u8,
    pub fingerprint: u32,
    pub child_num: u32,
    pub chain_code: String,
    pub public_key: String,
    pub path: Vec<u32>,
}

impl From<&HdNode> for NodeRecord {
    fn from(node: &HdNode) -> Self {
        Self {
            depth: node.depth,
            fingerprint: node.fingerprint,
            child_num: node.child_num,
            chain_code: hex::encode(node.chain_code),
            public_key: hex::encode(node.public_key_bytes()),
            path: node.path.clone(),
        }
    }
}

impl NodeRecord {
    pub fn to_node(&self) -> Result<HdNode, DeviceError> {
        let chain_code: [u8; 32] = hex::decode(&self.chain_code)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| DeviceError::Storage("invalid chain code".into()))?;
        let public_key = hex::decode(&self.public_key)
            .map_err(|e| DeviceError::Storage(format!("invalid public key: {e}")))?;
        Ok(HdNode::from_parts(
            self.depth,
            self.fingerprint,
            self.child_num,
            chain_code,
            &public_key,
            self.path.clone(),
        )?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountNodes {
    pub main: NodeRecord,
    pub external: NodeRecord,
    pub change: NodeRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: u32,
    pub coin: CoinParams,
    pub nodes: AccountNodes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    /// Hash of the accepted passphrase, never the passphrase itself.
    pub passphrase: Option<String>,
    pub features: Option<Features>,
    pub accounts: Vec<AccountRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub version: u32,
    pub devices: Vec<DeviceRecord>,
}

pub struct DeviceStorage {
    store: Arc<dyn KeyValueStore>,
    version: u32,
}

impl DeviceStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, version: u32) -> Self {
        Self { store, version }
    }

    pub fn restore(&self) -> Vec<DeviceRecord> {
        let raw = match self.store.get(DEVICES_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "failed to read device storage");
                return Vec::new();
            }
        };
        match serde_json::from_str::<StoredRecord>(&raw) {
            Ok(record) if record.version == self.version => {
                debug!(devices = record.devices.len(), "restored devices");
                record.devices
            }
            Ok(record) => {
                warn!(found = record.version, expected = self.version, "discarding stored devices");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "discarding unreadable device storage");
                Vec::new()
            }
        }
    }

    pub fn store(&self, devices: &[DeviceRecord]) -> Result<(), DeviceError> {
        let record = StoredRecord {
            version: self.version,
            devices: devices.to_vec(),
        };
        self.store.set(DEVICES_KEY, &serde_json::to_string(&record)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_core::hdnode::{decode_xpub, derive_child};

    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    fn record() -> DeviceRecord {
        let (_, main) = decode_xpub(XPUB).unwrap();
        let external = derive_child(&main, 0).unwrap();
        let change = derive_child(&main, 1).unwrap();
        DeviceRecord {
            id: "ABCD".into(),
            passphrase: None,
            features: Some(Features::default()),
            accounts: vec![AccountRecord {
                id: 0,
                coin: CoinParams::bitcoin(),
                nodes: AccountNodes {
                    main: (&main).into(),
                    external: (&external).into(),
                    change: (&change).into(),
                },
            }],
        }
    }

    #[test]
    fn node_record_restores_node() {
        let (_, main) = decode_xpub(XPUB).unwrap();
        let node = derive_child(&main, 3).unwrap();
        assert_eq!(NodeRecord::from(&node).to_node().unwrap(), node);
    }

    #[test]
    fn memory_store_keeps_devices() {
        let storage = DeviceStorage::new(Arc::new(MemoryStore::new()), 1);
        assert!(storage.restore().is_empty());
        storage.store(&[record()]).unwrap();
        assert_eq!(storage.restore(), vec![record()]);
    }

    #[test]
    fn version_mismatch_restores_empty() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        DeviceStorage::new(store.clone(), 1).store(&[record()]).unwrap();
        assert!(DeviceStorage::new(store, 2).restore().is_empty());
    }

    #[test]
    fn garbage_restores_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set(DEVICES_KEY, "{not json").unwrap();
        assert!(DeviceStorage::new(store, 1).restore().is_empty());
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        DeviceStorage::new(Arc::new(FileStore::new(&path)), 1)
            .store(&[record()])
            .unwrap();
        assert!(path.join("devices.json").exists());
        let restored = DeviceStorage::new(Arc::new(FileStore::new(&path)), 1).restore();
        assert_eq!(restored, vec![record()]);
    }

    #[test]
    fn file_store_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(FileStore::new(dir.path()).get("nothing").unwrap(), None);
    }
}
