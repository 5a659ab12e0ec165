//! Shared test doubles for the end-to-end tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use trove_backend::protocol::{SendRequest, WireInput, WireOutput};
use trove_backend::{
    BackendApi, BackendConfig, BackendError, BackendRegistry, BackendSync, PushMessage,
    SubscribeRequest, WireTransaction, WireUtxo,
};
use trove_core::coin::CoinParams;
use trove_core::constants::{BITCOIN_XPUB_VERSION, HARDENED};
use trove_core::error::SessionError;
use trove_core::hdnode::{decode_xpub, derive_path, encode_xpub, harden, HdNode};
use trove_device::interaction::{Dismissed, InteractionHandler, InteractionRequest};
use trove_device::messages::{ButtonCode, PinKind};
use trove_device::{Descriptor, Enumerator, Features, Request, Response, Transport};

/// BIP32 test vector 1 master key; every mock device derives from it.
pub const MASTER_XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

pub fn master() -> HdNode {
    decode_xpub(MASTER_XPUB).expect("test vector decodes").1
}

/// Mock devices cannot derive hardened children from a public master, so
/// hardened indices are derived as their plain counterparts.
pub fn device_node(path: &[u32]) -> HdNode {
    let plain: Vec<u32> = path.iter().map(|i| i & !HARDENED).collect();
    derive_path(&master(), &plain)
        .expect("non-hardened derivation")
        .with_path(path.to_vec())
}

/// BIP44 Bitcoin account path.
pub fn account_path(id: u32) -> Vec<u32> {
    vec![harden(44), harden(0), harden(id)]
}

/// xpub of `branch` (0 external, 1 change) under account `id`, as the
/// backend sees it.
pub fn branch_xpub(id: u32, branch: u32) -> String {
    let mut path = account_path(id);
    path.push(branch);
    encode_xpub(&device_node(&path), BITCOIN_XPUB_VERSION)
}

pub fn utxo(hash: &str, ix: u32, value: u64, address: u32) -> WireUtxo {
    WireUtxo {
        transaction_hash: hash.to_string(),
        ix,
        value,
        address_id: Some(vec![address]),
    }
}

pub fn balance(xpub: &str, confirmed: Vec<WireUtxo>) -> PushMessage {
    PushMessage {
        public_master: xpub.to_string(),
        status: "FINISHED".to_string(),
        confirmed,
        change: Vec::new(),
        sending: Vec::new(),
        receiving: Vec::new(),
    }
}

/// A confirmed transaction paying `value` to address `address` of the
/// subscribed branch, funded by a foreign input.
pub fn receive_tx(hash: &str, value: u64, address: u32, block_time: i64) -> WireTransaction {
    WireTransaction {
        hash: hash.to_string(),
        version: 1,
        lock_time: 0,
        block_time: Some(block_time),
        block_hash: Some(format!("block-{hash}")),
        height: Some(300_000),
        inputs: vec![WireInput {
            source_hash: "ff".repeat(32),
            ix: 0,
            script: STANDARD.encode([0x51]),
            sequence: u32::MAX,
        }],
        outputs: vec![WireOutput {
            script: STANDARD.encode([0x76, 0xa9]),
            value,
            ix: 0,
            address_id: Some(vec![address]),
        }],
    }
}

/// Scripted backend. Subscriptions answer with the balance set for the
/// xpub (an empty final update by default); later updates are pushed with
/// [`MockBackendApi::push`].
pub struct MockBackendApi {
    balances: Mutex<HashMap<String, PushMessage>>,
    histories: Mutex<HashMap<String, Vec<WireTransaction>>>,
    sent: Mutex<Vec<SendRequest>>,
    subscribed: Mutex<Vec<String>>,
    fail_send: AtomicBool,
    fail_subscribe: AtomicBool,
    streams: AtomicUsize,
    pushes: mpsc::UnboundedSender<PushMessage>,
    pending: tokio::sync::Mutex<mpsc::UnboundedReceiver<PushMessage>>,
}

impl Default for MockBackendApi {
    fn default() -> Self {
        let (pushes, pending) = mpsc::unbounded_channel();
        Self {
            balances: Mutex::new(HashMap::new()),
            histories: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            fail_send: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            streams: AtomicUsize::new(0),
            pushes,
            pending: tokio::sync::Mutex::new(pending),
        }
    }
}

impl MockBackendApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_balance(&self, message: PushMessage) {
        self.balances.lock().insert(message.public_master.clone(), message);
    }

    pub fn set_history(&self, xpub: &str, txs: Vec<WireTransaction>) {
        self.histories.lock().insert(xpub.to_string(), txs);
    }

    /// Deliver an update on the open stream.
    pub fn push(&self, message: PushMessage) {
        let _ = self.pushes.send(message);
    }

    pub fn fail_sends(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    /// Reject subscriptions while `fail` is set.
    pub fn fail_subscribes(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    pub fn streams_opened(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    pub fn sync(self: &Arc<Self>, coin: &str) -> BackendSync {
        let config = BackendConfig {
            poll_interval_ms: 10,
            ..BackendConfig::default()
        };
        BackendSync::new(coin, self.clone(), config)
    }

    pub fn registry(self: &Arc<Self>) -> Arc<BackendRegistry> {
        let api = self.clone();
        Arc::new(BackendRegistry::new(move |coin| Ok(api.sync(coin))))
    }
}

#[async_trait]
impl BackendApi for MockBackendApi {
    async fn open_stream(&self) -> Result<String, BackendError> {
        let n = self.streams.fetch_add(1, Ordering::SeqCst);
        Ok(format!("client-{n}"))
    }

    async fn poll(&self, _client_id: &str) -> Result<Vec<PushMessage>, BackendError> {
        let mut pending = self.pending.lock().await;
        match pending.recv().await {
            Some(message) => Ok(vec![message]),
            None => Err(BackendError::Closed),
        }
    }

    async fn subscribe(
        &self,
        _client_id: &str,
        request: &SubscribeRequest,
    ) -> Result<Option<PushMessage>, BackendError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                status: 503,
                body: "subscriptions unavailable".into(),
            });
        }
        self.subscribed.lock().push(request.public_master.clone());
        let message = self
            .balances
            .lock()
            .get(&request.public_master)
            .cloned()
            .unwrap_or_else(|| balance(&request.public_master, Vec::new()));
        Ok(Some(message))
    }

    async fn transactions(&self, xpub: &str) -> Result<Vec<WireTransaction>, BackendError> {
        Ok(self.histories.lock().get(xpub).cloned().unwrap_or_default())
    }

    async fn transaction(&self, _xpub: &str, hash: &str) -> Result<WireTransaction, BackendError> {
        self.histories
            .lock()
            .values()
            .flatten()
            .find(|tx| tx.hash == hash)
            .cloned()
            .ok_or_else(|| BackendError::Status {
                status: 404,
                body: format!("unknown transaction {hash}"),
            })
    }

    async fn send(&self, request: &SendRequest) -> Result<(), BackendError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                status: 500,
                body: "node rejected transaction".into(),
            });
        }
        self.sent.lock().push(request.clone());
        Ok(())
    }
}

pub const SIGNED_TX: &[u8] = &[0xde, 0xad, 0xbe, 0xef];

#[derive(Debug, Clone, Default)]
pub struct DeviceScript {
    pub tamper_xpub: bool,
    pub tamper_child: bool,
}

/// Scripted device. Answers every request from its own state unless a
/// response has been queued with [`MockTransport::queue`].
pub struct MockTransport {
    features: Mutex<Features>,
    queued: Mutex<VecDeque<Response>>,
    requests: Mutex<Vec<&'static str>>,
    /// The request an interaction ack continues.
    interrupted: Mutex<Option<Request>>,
    tx_size: Mutex<u32>,
    script: Mutex<DeviceScript>,
}

pub fn default_features(initialized: bool) -> Features {
    Features {
        vendor: "bitcointrezor.com".into(),
        major_version: 1,
        minor_version: 3,
        patch_version: 0,
        device_id: "MOCK-DEVICE".into(),
        initialized,
        coins: vec![CoinParams::bitcoin(), CoinParams::testnet()],
        ..Features::default()
    }
}

impl MockTransport {
    pub fn new(initialized: bool) -> Arc<Self> {
        Arc::new(Self {
            features: Mutex::new(default_features(initialized)),
            queued: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            interrupted: Mutex::new(None),
            tx_size: Mutex::new(250),
            script: Mutex::new(DeviceScript::default()),
        })
    }

    pub fn queue(&self, response: Response) {
        self.queued.lock().push_back(response);
    }

    pub fn requests(&self) -> Vec<&'static str> {
        self.requests.lock().clone()
    }

    pub fn set_tx_size(&self, size: u32) {
        *self.tx_size.lock() = size;
    }

    pub fn set_script(&self, script: DeviceScript) {
        *self.script.lock() = script;
    }

    pub fn features(&self) -> Features {
        self.features.lock().clone()
    }

    fn success() -> Response {
        Response::Success {
            message: "ok".into(),
        }
    }

    fn answer(&self, request: Request) -> Response {
        match request {
            Request::Initialize => Response::Features(self.features()),
            Request::GetPublicKey { address_n } => {
                let script = self.script.lock().clone();
                let is_child = address_n.len() > 3;
                let mut node = device_node(&address_n);
                if is_child && script.tamper_child {
                    node = device_node(&[address_n[0], address_n[1], address_n[2], 7]);
                }
                let xpub = if script.tamper_xpub {
                    encode_xpub(&device_node(&[9]), BITCOIN_XPUB_VERSION)
                } else {
                    encode_xpub(&node, BITCOIN_XPUB_VERSION)
                };
                Response::PublicKey { node, xpub }
            }
            Request::MeasureTx { .. } => Response::TxSize {
                size: *self.tx_size.lock(),
            },
            Request::SignTx { .. } => Response::SignedTx {
                serialized: SIGNED_TX.to_vec(),
            },
            Request::WipeDevice => {
                let mut features = self.features.lock();
                features.initialized = false;
                features.label = None;
                Self::success()
            }
            Request::ResetDevice(settings) => {
                let mut features = self.features.lock();
                features.initialized = true;
                features.label = Some(settings.label);
                Self::success()
            }
            Request::LoadDevice(settings) => {
                let mut features = self.features.lock();
                features.initialized = true;
                features.label = Some(settings.label);
                Self::success()
            }
            Request::RecoveryDevice(settings) => {
                let mut features = self.features.lock();
                features.initialized = true;
                features.label = Some(settings.label);
                Self::success()
            }
            Request::ApplySettings(settings) => {
                if let Some(label) = settings.label {
                    self.features.lock().label = Some(label);
                }
                Self::success()
            }
            Request::ChangePin { remove } => {
                self.features.lock().pin_protection = !remove;
                Self::success()
            }
            Request::SignMessage { .. } => Response::MessageSignature {
                address: "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH".into(),
                signature: vec![0x1f; 65],
            },
            _ => Self::success(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn exchange(&self, request: Request) -> Result<Response, SessionError> {
        self.requests.lock().push(request.kind());
        let request = match request {
            Request::PinMatrixAck { .. }
            | Request::PassphraseAck { .. }
            | Request::ButtonAck
            | Request::WordAck { .. } => self.interrupted.lock().clone().unwrap_or(request),
            other => {
                *self.interrupted.lock() = Some(other.clone());
                other
            }
        };
        if let Some(response) = self.queued.lock().pop_front() {
            return Ok(response);
        }
        Ok(self.answer(request))
    }
}

/// Enumerator over a mutable set of attached mock devices.
#[derive(Default)]
pub struct MockEnumerator {
    attached: Mutex<Vec<(Descriptor, Arc<MockTransport>)>>,
}

impl MockEnumerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, path: &str, transport: Arc<MockTransport>) -> Descriptor {
        let descriptor = Descriptor::new(path);
        self.attached.lock().push((descriptor.clone(), transport));
        descriptor
    }

    pub fn detach(&self, path: &str) {
        self.attached.lock().retain(|(d, _)| d.path != path);
    }
}

#[async_trait]
impl Enumerator for MockEnumerator {
    async fn enumerate(&self) -> Result<Vec<Descriptor>, SessionError> {
        Ok(self.attached.lock().iter().map(|(d, _)| d.clone()).collect())
    }

    async fn acquire(&self, descriptor: &Descriptor) -> Result<Arc<dyn Transport>, SessionError> {
        let attached = self.attached.lock();
        let (_, transport) = attached
            .iter()
            .find(|(d, _)| d == descriptor)
            .ok_or_else(|| SessionError::Transport(format!("{} is not attached", descriptor.path)))?;
        Ok(transport.clone())
    }
}

/// Interaction handler that records prompts and answers from a script.
#[derive(Default)]
pub struct ScriptedInteraction {
    seen: Mutex<Vec<InteractionRequest>>,
    dismiss: AtomicBool,
    pin: Mutex<String>,
    passphrase: Mutex<String>,
    words: Mutex<VecDeque<String>>,
}

impl ScriptedInteraction {
    pub fn new() -> Arc<Self> {
        let handler = Self::default();
        *handler.pin.lock() = "1234".into();
        Arc::new(handler)
    }

    /// Dismiss every prompt from now on.
    pub fn dismiss_all(&self) {
        self.dismiss.store(true, Ordering::SeqCst);
    }

    pub fn set_passphrase(&self, passphrase: &str) {
        *self.passphrase.lock() = passphrase.to_string();
    }

    pub fn queue_words(&self, words: &[&str]) {
        self.words.lock().extend(words.iter().map(|w| w.to_string()));
    }

    pub fn seen(&self) -> Vec<InteractionRequest> {
        self.seen.lock().clone()
    }

    fn record(&self, request: InteractionRequest) -> Result<(), Dismissed> {
        self.seen.lock().push(request);
        if self.dismiss.load(Ordering::SeqCst) {
            Err(Dismissed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl InteractionHandler for ScriptedInteraction {
    async fn on_pin(&self, kind: PinKind) -> Result<String, Dismissed> {
        self.record(InteractionRequest::Pin(kind))?;
        Ok(self.pin.lock().clone())
    }

    async fn on_passphrase(&self) -> Result<String, Dismissed> {
        self.record(InteractionRequest::Passphrase)?;
        Ok(self.passphrase.lock().clone())
    }

    async fn on_button(&self, code: ButtonCode) -> Result<(), Dismissed> {
        self.record(InteractionRequest::Button(code))
    }

    async fn on_word(&self) -> Result<String, Dismissed> {
        self.record(InteractionRequest::Word)?;
        self.words.lock().pop_front().ok_or(Dismissed)
    }
}
