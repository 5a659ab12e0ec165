//! A hardware device: connection state, cached features and its accounts.
//!
//! Lifecycle: `Disconnected -> Initializing -> Empty | Provisioned`. The
//! management calls (wipe, reset, recover, load) go through the session and
//! then re-run initialization; label and PIN changes re-initialize to
//! refresh the cached features. Account discovery runs on the first entry
//! into `Provisioned`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use trove_backend::BackendRegistry;
use trove_core::coin::CoinParams;
use trove_core::constants::{BIP44_PURPOSE, BITCOIN_XPUB_VERSION};
use trove_core::crypto::double_sha256;
use trove_core::error::ValidationError;
use trove_core::hdnode::{decode_xprv, derive_child, encode_xpub, format_path, harden};
use trove_wallet::{Account, AccountPolicy, WalletConfig};
use zeroize::Zeroizing;

use crate::endure::{endure, EndurePolicy};
use crate::error::DeviceError;
use crate::messages::{ApplySettings, Features, LoadPayload, LoadSettings, RecoverySettings, ResetSettings};
use crate::session::DeviceSession;
use crate::storage::{AccountNodes, AccountRecord, DeviceRecord};

pub const DEFAULT_LABEL: &str = "My TREZOR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    /// A management call or initialization is running.
    Initializing,
    /// Connected, no seed on the device.
    Empty,
    Provisioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PinStrength {
    Weak,
    Fine,
    Strong,
    Ultimate,
}

impl PinStrength {
    pub fn of(pin: &str) -> Self {
        match rate_pin(pin) {
            r if r < 3_000 => Self::Weak,
            r if r < 60_000 => Self::Fine,
            r if r < 360_000 => Self::Strong,
            _ => Self::Ultimate,
        }
    }
}

/// Number of PINs with as many distinct digits as `pin` (`9! / (9 - n)!`).
/// PINs longer than nine digits rate 0.
pub fn rate_pin(pin: &str) -> u64 {
    if pin.chars().count() > 9 {
        return 0;
    }
    let mut digits: Vec<char> = pin.chars().collect();
    digits.sort_unstable();
    digits.dedup();
    let unique = digits.len().min(9) as u64;
    (10 - unique..=9).product()
}

/// Interpret a load payload as an xprv, falling back to a mnemonic.
pub fn load_payload(text: &str, skip_checksum: bool) -> Result<LoadPayload, DeviceError> {
    let text = text.trim();
    if let Ok(node) = decode_xprv(text) {
        return Ok(LoadPayload::Node(node));
    }
    if skip_checksum {
        return Ok(LoadPayload::Mnemonic(text.to_string()));
    }
    let mnemonic = bip39::Mnemonic::parse_normalized(text)
        .map_err(|e| ValidationError::InvalidMnemonic(e.to_string()))?;
    Ok(LoadPayload::Mnemonic(mnemonic.to_string()))
}

#[derive(Default)]
struct DeviceInner {
    session: Option<Arc<DeviceSession>>,
    features: Option<Features>,
    accounts: Vec<Arc<Account>>,
    passphrase: Option<String>,
}

/// Marks the device busy for as long as it is alive.
struct Loading<'a>(&'a AtomicUsize);

impl<'a> Loading<'a> {
    fn start(level: &'a AtomicUsize) -> Self {
        level.fetch_add(1, Ordering::SeqCst);
        Self(level)
    }
}

impl Drop for Loading<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Device {
    id: String,
    registry: Arc<BackendRegistry>,
    config: Arc<WalletConfig>,
    endure: EndurePolicy,
    inner: Mutex<DeviceInner>,
    loading: AtomicUsize,
}

impl Device {
    pub fn new(id: impl Into<String>, registry: Arc<BackendRegistry>, config: Arc<WalletConfig>) -> Self {
        Self {
            id: id.into(),
            registry,
            config,
            endure: EndurePolicy::default(),
            inner: Mutex::new(DeviceInner::default()),
            loading: AtomicUsize::new(0),
        }
    }

    pub fn with_endure(mut self, policy: EndurePolicy) -> Self {
        self.endure = policy;
        self
    }

    /// Rebuild a device and its accounts from a stored record. Accounts are
    /// not subscribed until the device initializes.
    pub fn from_record(
        record: &DeviceRecord,
        registry: Arc<BackendRegistry>,
        config: Arc<WalletConfig>,
    ) -> Result<Self, DeviceError> {
        let device = Self::new(record.id.clone(), registry, config);
        let mut accounts = Vec::with_capacity(record.accounts.len());
        for stored in &record.accounts {
            let policy = device.policy(&stored.coin)?;
            let backend = device.registry.get(&stored.coin.coin_name)?;
            accounts.push(Arc::new(Account::from_nodes(
                stored.id,
                stored.coin.clone(),
                stored.nodes.main.to_node()?,
                stored.nodes.external.to_node()?,
                stored.nodes.change.to_node()?,
                backend,
                policy,
            )));
        }
        {
            let mut inner = device.inner.lock();
            inner.features = record.features.clone();
            inner.passphrase = record.passphrase.clone();
            inner.accounts = accounts;
        }
        Ok(device)
    }

    pub fn to_record(&self) -> DeviceRecord {
        let inner = self.inner.lock();
        DeviceRecord {
            id: self.id.clone(),
            passphrase: inner.passphrase.clone(),
            features: inner.features.clone(),
            accounts: inner
                .accounts
                .iter()
                .map(|acc| AccountRecord {
                    id: acc.id(),
                    coin: acc.coin().clone(),
                    nodes: AccountNodes {
                        main: acc.node().into(),
                        external: acc.external().node().into(),
                        change: acc.change().node().into(),
                    },
                })
                .collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn features(&self) -> Option<Features> {
        self.inner.lock().features.clone()
    }

    pub fn accounts(&self) -> Vec<Arc<Account>> {
        self.inner.lock().accounts.clone()
    }

    pub fn account(&self, id: u32) -> Option<Arc<Account>> {
        self.inner.lock().accounts.iter().find(|a| a.id() == id).cloned()
    }

    pub fn label(&self) -> String {
        self.inner
            .lock()
            .features
            .as_ref()
            .and_then(|f| f.label.clone())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LABEL.to_string())
    }

    /// Sum of all account balances.
    pub fn balance(&self) -> u64 {
        self.accounts().iter().map(|a| a.balance()).sum()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst) > 0
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    /// Whether the device has no seed, or has not reported features yet.
    pub fn is_empty(&self) -> bool {
        !self.inner.lock().features.as_ref().is_some_and(|f| f.initialized)
    }

    pub fn status(&self) -> DeviceState {
        if self.is_loading() {
            DeviceState::Initializing
        } else if !self.is_connected() {
            DeviceState::Disconnected
        } else if self.is_empty() {
            DeviceState::Empty
        } else {
            DeviceState::Provisioned
        }
    }

    /// The configured default coin, if the device supports it.
    pub fn default_coin(&self) -> Option<CoinParams> {
        let inner = self.inner.lock();
        inner
            .features
            .as_ref()?
            .coins
            .iter()
            .find(|c| c.coin_name == self.config.default_coin)
            .cloned()
    }

    /// `[44', coin', id']` with BIP44, otherwise `[coin, 0', id']`.
    pub fn account_path(&self, id: u32, coin: &CoinParams) -> Result<Vec<u32>, DeviceError> {
        let index = self
            .config
            .coin(&coin.coin_name)
            .map(|c| c.bip32_index)
            .ok_or_else(|| DeviceError::UnsupportedCoin(coin.coin_name.clone()))?;
        Ok(if self.config.use_bip44 {
            vec![harden(BIP44_PURPOSE), harden(index), harden(id)]
        } else {
            vec![index, harden(0), harden(id)]
        })
    }

    fn hash_passphrase(&self, passphrase: &str) -> String {
        let secret = Zeroizing::new(format!("TREZOR#{}#{}", self.id, passphrase));
        hex::encode(double_sha256(secret.as_bytes()))
    }

    pub fn has_saved_passphrase(&self) -> bool {
        self.inner.lock().passphrase.is_some()
    }

    /// Compare against the saved passphrase hash, saving it on first use.
    pub fn check_passphrase(&self, passphrase: &str) -> bool {
        let hash = self.hash_passphrase(passphrase);
        let mut inner = self.inner.lock();
        match &inner.passphrase {
            Some(saved) => *saved == hash,
            None => {
                inner.passphrase = Some(hash);
                true
            }
        }
    }

    pub fn connect(&self, session: Arc<DeviceSession>) {
        debug!(device_id = %self.id, "device connected");
        self.inner.lock().session = Some(session);
    }

    pub fn disconnect(&self) {
        if let Some(session) = self.inner.lock().session.take() {
            session.disconnect();
            debug!(device_id = %self.id, "device disconnected");
        }
    }

    pub fn session(&self) -> Result<Arc<DeviceSession>, DeviceError> {
        self.inner
            .lock()
            .session
            .clone()
            .ok_or(DeviceError::NotConnected)
    }

    /// Fetch features, retrying per the endure policy.
    pub async fn initialize_device(&self) -> Result<Features, DeviceError> {
        let session = self.session()?;
        let s = &*session;
        let result = endure(&self.endure, || s.is_connected(), move || s.initialize()).await;
        let mut inner = self.inner.lock();
        match result {
            Ok(features) => {
                info!(device_id = %self.id, version = %features.version(), initialized = features.initialized, "device initialized");
                inner.features = Some(features.clone());
                Ok(features)
            }
            Err(e) => {
                warn!(device_id = %self.id, error = %e, "device initialization failed");
                inner.features = None;
                Err(e.into())
            }
        }
    }

    /// Connect-time initialization: features, then accounts. A device that
    /// never answers is disconnected.
    pub async fn initialize(&self) -> Result<Features, DeviceError> {
        let _loading = Loading::start(&self.loading);
        let features = match self.initialize_device().await {
            Ok(features) => features,
            Err(e) => {
                self.disconnect();
                return Err(e);
            }
        };
        self.initialize_accounts().await?;
        Ok(features)
    }

    /// Bring accounts in line with the features: none on an empty device,
    /// discovery when there are none yet, otherwise subscribe those known.
    pub async fn initialize_accounts(&self) -> Result<Vec<Arc<Account>>, DeviceError> {
        if self.features().is_some_and(|f| f.bootloader_mode) {
            debug!(device_id = %self.id, "bootloader mode, skipping accounts");
            return Ok(self.accounts());
        }
        if self.is_empty() {
            self.unsubscribe();
            self.inner.lock().accounts.clear();
            return Ok(Vec::new());
        }
        if self.accounts().is_empty() {
            return self.discover().await;
        }
        for account in self.accounts() {
            account.subscribe().await?;
        }
        Ok(self.accounts())
    }

    pub fn unsubscribe(&self) {
        for account in self.accounts() {
            account.unsubscribe();
        }
    }

    /// Derive, subscribe and keep accounts from the current count upward,
    /// stopping after the first empty one.
    pub async fn discover(&self) -> Result<Vec<Arc<Account>>, DeviceError> {
        let mut next = self.accounts().len() as u32;
        loop {
            let account = Arc::new(self.create_account(next).await?);
            account.subscribe().await?;
            let empty = account.is_empty();
            debug!(device_id = %self.id, account = next, empty, "account discovered");
            self.inner.lock().accounts.push(account);
            if empty {
                break;
            }
            next += 1;
        }
        Ok(self.accounts())
    }

    fn policy(&self, coin: &CoinParams) -> Result<AccountPolicy, DeviceError> {
        let coin_policy = self
            .config
            .coin(&coin.coin_name)
            .ok_or_else(|| DeviceError::UnsupportedCoin(coin.coin_name.clone()))?;
        Ok(AccountPolicy {
            fees: self.config.fee_policy(),
            xpub_version: coin_policy.xpub_version,
            script_types: coin_policy.script_types.clone(),
        })
    }

    /// Fetch the account node and check it against its xpub and its first
    /// child.
    pub async fn create_account(&self, id: u32) -> Result<Account, DeviceError> {
        let session = self.session()?;
        let coin = self
            .default_coin()
            .ok_or_else(|| DeviceError::UnsupportedCoin(self.config.default_coin.clone()))?;
        let path = self.account_path(id, &coin)?;

        let (node, xpub) = session.get_public_key(&path).await?;
        // Devices always report Bitcoin-versioned keys.
        let computed = encode_xpub(&node, BITCOIN_XPUB_VERSION);
        if !xpub.is_empty() && xpub != computed {
            return Err(DeviceError::XpubMismatch(format_path(&path)));
        }

        let mut child_path = path.clone();
        child_path.push(0);
        let (reported, _) = session.get_public_key(&child_path).await?;
        let derived = derive_child(&node, 0)?;
        if encode_xpub(&reported, BITCOIN_XPUB_VERSION) != encode_xpub(&derived, BITCOIN_XPUB_VERSION) {
            return Err(DeviceError::ChildMismatch(format_path(&child_path)));
        }

        let backend = self.registry.get(&coin.coin_name)?;
        let policy = self.policy(&coin)?;
        Ok(Account::new(id, coin, node, backend, policy)?)
    }

    pub fn can_add_account(&self) -> bool {
        self.is_connected()
            && !self.is_empty()
            && self.inner.lock().accounts.last().is_none_or(|last| !last.is_empty())
    }

    pub async fn add_account(&self) -> Result<Arc<Account>, DeviceError> {
        if !self.can_add_account() {
            return Err(DeviceError::CannotAddAccount);
        }
        let id = self.accounts().len() as u32;
        let account = Arc::new(self.create_account(id).await?);
        if let Err(e) = account.subscribe().await {
            account.unsubscribe();
            return Err(e.into());
        }
        {
            let mut inner = self.inner.lock();
            if inner.accounts.len() as u32 != id {
                drop(inner);
                account.unsubscribe();
                return Err(DeviceError::CannotAddAccount);
            }
            inner.accounts.push(account.clone());
        }
        info!(device_id = %self.id, account = id, "account added");
        Ok(account)
    }

    /// Only the last account may be hidden, only when it is empty, and
    /// never the only one.
    pub fn can_hide_account(&self, id: u32) -> bool {
        hideable(&self.inner.lock().accounts, id)
    }

    pub fn hide_account(&self, id: u32) -> Result<Arc<Account>, DeviceError> {
        let account = {
            let mut inner = self.inner.lock();
            if !hideable(&inner.accounts, id) {
                return Err(DeviceError::CannotHideAccount(id));
            }
            inner.accounts.pop().ok_or(DeviceError::CannotHideAccount(id))?
        };
        account.unsubscribe();
        info!(device_id = %self.id, account = id, "account hidden");
        Ok(account)
    }

    async fn reinitialize(&self) -> Result<(), DeviceError> {
        self.initialize_device().await?;
        self.initialize_accounts().await?;
        Ok(())
    }

    /// Wipe the seed; accounts are dropped.
    pub async fn wipe(&self) -> Result<(), DeviceError> {
        let _loading = Loading::start(&self.loading);
        let session = self.session()?;
        session.initialize().await?;
        session.wipe().await?;
        self.unsubscribe();
        self.inner.lock().accounts.clear();
        info!(device_id = %self.id, "device wiped");
        self.reinitialize().await
    }

    pub async fn reset(&self, settings: ResetSettings) -> Result<(), DeviceError> {
        let _loading = Loading::start(&self.loading);
        let session = self.session()?;
        session.initialize().await?;
        session.reset(settings).await?;
        self.reinitialize().await
    }

    pub async fn recover(&self, settings: RecoverySettings) -> Result<(), DeviceError> {
        let _loading = Loading::start(&self.loading);
        let session = self.session()?;
        session.initialize().await?;
        session
            .recover(RecoverySettings {
                enforce_wordlist: true,
                ..settings
            })
            .await?;
        self.reinitialize().await
    }

    pub async fn load(&self, settings: LoadSettings) -> Result<(), DeviceError> {
        let _loading = Loading::start(&self.loading);
        let session = self.session()?;
        session.initialize().await?;
        session.load(settings).await?;
        self.reinitialize().await
    }

    pub async fn apply_settings(&self, settings: ApplySettings) -> Result<(), DeviceError> {
        let _loading = Loading::start(&self.loading);
        let session = self.session()?;
        session.initialize().await?;
        session.apply_settings(settings).await?;
        self.initialize_device().await.map(drop)
    }

    pub async fn change_label(&self, label: &str) -> Result<(), DeviceError> {
        self.apply_settings(ApplySettings {
            label: Some(label.to_string()),
            ..ApplySettings::default()
        })
        .await
    }

    pub async fn change_pin(&self, remove: bool) -> Result<(), DeviceError> {
        let _loading = Loading::start(&self.loading);
        let session = self.session()?;
        session.initialize().await?;
        session.change_pin(remove).await?;
        self.initialize_device().await.map(drop)
    }

    /// Erase the firmware and upload a new image.
    pub async fn flash(&self, firmware: &[u8]) -> Result<(), DeviceError> {
        let session = self.session()?;
        session.erase_firmware().await?;
        session.upload_firmware(firmware).await?;
        info!(device_id = %self.id, bytes = firmware.len(), "firmware uploaded");
        Ok(())
    }

    pub async fn sign_message(
        &self,
        path: &[u32],
        message: &[u8],
        coin: &CoinParams,
    ) -> Result<(String, Vec<u8>), DeviceError> {
        Ok(self.session()?.sign_message(path, message, coin).await?)
    }

    pub async fn verify_message(
        &self,
        address: &str,
        signature: &[u8],
        message: &[u8],
    ) -> Result<(), DeviceError> {
        Ok(self.session()?.verify_message(address, signature, message).await?)
    }
}

fn hideable(accounts: &[Arc<Account>], id: u32) -> bool {
    accounts.len() > 1
        && accounts
            .last()
            .is_some_and(|last| last.id() == id && last.is_empty())
}
