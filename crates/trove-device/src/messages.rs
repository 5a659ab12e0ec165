//! Device protocol messages.
//!
//! Requests carry secrets (PINs, passphrases, recovery words, mnemonics),
//! so `Debug` on [`Request`] prints only the message kind.

use std::fmt;

use serde::{Deserialize, Serialize};
use trove_core::coin::CoinParams;
use trove_core::hdnode::HdNode;
use trove_core::types::{RefTransaction, SignInput, SignOutput};

/// What the device is asking a PIN for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PinKind {
    Current,
    NewFirst,
    NewSecond,
}

/// Why the device wants a button press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonCode {
    ConfirmOutput,
    ConfirmWord,
    FeeOverThreshold,
    SignTx,
    WipeDevice,
    ProtectCall,
    FirmwareCheck,
    Other,
}

/// Device capabilities and state reported by `Initialize`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub vendor: String,
    pub major_version: u32,
    pub minor_version: u32,
    pub patch_version: u32,
    pub device_id: String,
    pub label: Option<String>,
    /// Whether a seed is present.
    pub initialized: bool,
    pub pin_protection: bool,
    pub passphrase_protection: bool,
    pub bootloader_mode: bool,
    pub coins: Vec<CoinParams>,
}

impl Features {
    pub fn version(&self) -> String {
        format!("{}.{}.{}", self.major_version, self.minor_version, self.patch_version)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ResetSettings {
    pub strength: u32,
    pub passphrase_protection: bool,
    pub pin_protection: bool,
    pub label: String,
    pub display_random: bool,
}

impl Default for ResetSettings {
    fn default() -> Self {
        Self {
            strength: 256,
            passphrase_protection: false,
            pin_protection: true,
            label: "My TREZOR".into(),
            display_random: false,
        }
    }
}

/// Key material for `LoadDevice`.
#[derive(Clone, PartialEq, Eq)]
pub enum LoadPayload {
    Node(HdNode),
    Mnemonic(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct LoadSettings {
    pub payload: LoadPayload,
    pub pin: Option<String>,
    pub passphrase_protection: bool,
    pub label: String,
    pub skip_checksum: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct RecoverySettings {
    pub word_count: u32,
    pub passphrase_protection: bool,
    pub pin_protection: bool,
    pub label: String,
    /// Reject words outside the BIP39 list on entry.
    pub enforce_wordlist: bool,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            word_count: 24,
            passphrase_protection: false,
            pin_protection: true,
            label: "My TREZOR".into(),
            enforce_wordlist: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySettings {
    pub label: Option<String>,
    pub language: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub enum Request {
    Initialize,
    GetPublicKey { address_n: Vec<u32> },
    MeasureTx { inputs: Vec<SignInput>, outputs: Vec<SignOutput>, coin_name: String },
    SignTx {
        inputs: Vec<SignInput>,
        outputs: Vec<SignOutput>,
        refs: Vec<RefTransaction>,
        coin_name: String,
    },
    WipeDevice,
    ResetDevice(ResetSettings),
    LoadDevice(LoadSettings),
    RecoveryDevice(RecoverySettings),
    ChangePin { remove: bool },
    ApplySettings(ApplySettings),
    SignMessage { address_n: Vec<u32>, message: Vec<u8>, coin_name: String },
    VerifyMessage { address: String, signature: Vec<u8>, message: Vec<u8> },
    FirmwareErase,
    FirmwareUpload { payload: Vec<u8> },
    PinMatrixAck { pin: String },
    PassphraseAck { passphrase: String },
    ButtonAck,
    WordAck { word: String },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialize => "Initialize",
            Self::GetPublicKey { .. } => "GetPublicKey",
            Self::MeasureTx { .. } => "MeasureTx",
            Self::SignTx { .. } => "SignTx",
            Self::WipeDevice => "WipeDevice",
            Self::ResetDevice(_) => "ResetDevice",
            Self::LoadDevice(_) => "LoadDevice",
            Self::RecoveryDevice(_) => "RecoveryDevice",
            Self::ChangePin { .. } => "ChangePin",
            Self::ApplySettings(_) => "ApplySettings",
            Self::SignMessage { .. } => "SignMessage",
            Self::VerifyMessage { .. } => "VerifyMessage",
            Self::FirmwareErase => "FirmwareErase",
            Self::FirmwareUpload { .. } => "FirmwareUpload",
            Self::PinMatrixAck { .. } => "PinMatrixAck",
            Self::PassphraseAck { .. } => "PassphraseAck",
            Self::ButtonAck => "ButtonAck",
            Self::WordAck { .. } => "WordAck",
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success { message: String },
    Failure { code: i32, message: String },
    Features(Features),
    PublicKey { node: HdNode, xpub: String },
    TxSize { size: u32 },
    SignedTx { serialized: Vec<u8> },
    MessageSignature { address: String, signature: Vec<u8> },
    PinMatrixRequest(PinKind),
    PassphraseRequest,
    ButtonRequest(ButtonCode),
    WordRequest,
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "Success",
            Self::Failure { .. } => "Failure",
            Self::Features(_) => "Features",
            Self::PublicKey { .. } => "PublicKey",
            Self::TxSize { .. } => "TxSize",
            Self::SignedTx { .. } => "SignedTx",
            Self::MessageSignature { .. } => "MessageSignature",
            Self::PinMatrixRequest(_) => "PinMatrixRequest",
            Self::PassphraseRequest => "PassphraseRequest",
            Self::ButtonRequest(_) => "ButtonRequest",
            Self::WordRequest => "WordRequest",
        }
    }
}
