//! Device session: one request in flight, suspended on user interaction.
//!
//! A call sends its request and reads responses until a terminal one
//! arrives. Interaction requests (PIN matrix, passphrase, button, word)
//! suspend the call on the [`InteractionHandler`]; the answer is sent back
//! as the matching ack and the loop continues. A dismissed prompt fails the
//! call with [`SessionError::Cancelled`] without sending an ack. Calls are
//! serialized on the transport lock, and a disconnect fails whatever call
//! is outstanding.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use trove_core::coin::CoinParams;
use trove_core::error::SessionError;
use trove_core::hdnode::HdNode;
use trove_core::traits::TxSigner;
use trove_core::types::{RefTransaction, SignInput, SignOutput};

use crate::interaction::{Dismissed, InteractionHandler};
use crate::messages::{
    ApplySettings, Features, LoadSettings, RecoverySettings, Request, ResetSettings, Response,
};
use crate::transport::Transport;

/// Traffic notifications, used to pause device enumeration while the link
/// is busy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Send(&'static str),
    Receive(&'static str),
    Error(String),
}

pub struct DeviceSession {
    transport: tokio::sync::Mutex<Arc<dyn Transport>>,
    handler: Arc<dyn InteractionHandler>,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<SessionEvent>,
    features: Mutex<Option<Features>>,
}

fn unexpected(response: Response) -> SessionError {
    SessionError::UnexpectedResponse(response.kind().to_string())
}

async fn disconnected(connected: &mut watch::Receiver<bool>) {
    let _ = connected.wait_for(|up| !*up).await;
}

async fn until_disconnected<T>(
    connected: &mut watch::Receiver<bool>,
    work: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    tokio::select! {
        biased;
        () = disconnected(connected) => {
            Err(SessionError::Transport("device disconnected during call".into()))
        }
        result = work => result,
    }
}

impl DeviceSession {
    pub fn new(transport: Arc<dyn Transport>, handler: Arc<dyn InteractionHandler>) -> Self {
        let (connected, _) = watch::channel(true);
        let (events, _) = broadcast::channel(64);
        Self {
            transport: tokio::sync::Mutex::new(transport),
            handler,
            connected,
            events,
            features: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Mark the device as gone. Any outstanding call fails.
    pub fn disconnect(&self) {
        if self.connected.send_replace(false) {
            debug!("session disconnected");
        }
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Features from the last successful `Initialize`.
    pub fn features(&self) -> Option<Features> {
        self.features.lock().clone()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn interact<T>(
        &self,
        connected: &mut watch::Receiver<bool>,
        prompt: impl Future<Output = Result<T, Dismissed>>,
    ) -> Result<T, SessionError> {
        let answer = until_disconnected(connected, async {
            prompt.await.map_err(|Dismissed| SessionError::Cancelled)
        })
        .await;
        if let Err(e) = &answer {
            self.emit(SessionEvent::Error(e.to_string()));
        }
        answer
    }

    /// Run one call to completion, answering interaction requests.
    pub async fn call(&self, request: Request) -> Result<Response, SessionError> {
        let mut connected = self.connected.subscribe();
        if !*connected.borrow() {
            return Err(SessionError::Disconnected);
        }
        let transport = self.transport.lock().await;
        // The device may have gone while an earlier call held the lock.
        if !*connected.borrow() {
            return Err(SessionError::Disconnected);
        }
        let mut request = request;

        loop {
            let kind = request.kind();
            debug!(request = kind, "device send");
            self.emit(SessionEvent::Send(kind));
            let response = match until_disconnected(&mut connected, transport.exchange(request)).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(request = kind, error = %e, "device exchange failed");
                    self.emit(SessionEvent::Error(e.to_string()));
                    return Err(e);
                }
            };
            debug!(response = response.kind(), "device receive");
            self.emit(SessionEvent::Receive(response.kind()));

            request = match response {
                Response::Failure { code, message } => {
                    self.emit(SessionEvent::Error(message.clone()));
                    return Err(SessionError::Device { code, message });
                }
                Response::PinMatrixRequest(kind) => Request::PinMatrixAck {
                    pin: self.interact(&mut connected, self.handler.on_pin(kind)).await?,
                },
                Response::PassphraseRequest => Request::PassphraseAck {
                    passphrase: self
                        .interact(&mut connected, self.handler.on_passphrase())
                        .await?,
                },
                Response::ButtonRequest(code) => {
                    self.interact(&mut connected, self.handler.on_button(code))
                        .await?;
                    Request::ButtonAck
                }
                Response::WordRequest => Request::WordAck {
                    word: self.interact(&mut connected, self.handler.on_word()).await?,
                },
                terminal => return Ok(terminal),
            };
        }
    }

    async fn expect_success(&self, request: Request) -> Result<String, SessionError> {
        match self.call(request).await? {
            Response::Success { message } => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    pub async fn initialize(&self) -> Result<Features, SessionError> {
        match self.call(Request::Initialize).await? {
            Response::Features(features) => {
                *self.features.lock() = Some(features.clone());
                Ok(features)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Public node at `path`, with the xpub the device computed for it.
    pub async fn get_public_key(&self, path: &[u32]) -> Result<(HdNode, String), SessionError> {
        let request = Request::GetPublicKey {
            address_n: path.to_vec(),
        };
        match self.call(request).await? {
            Response::PublicKey { node, xpub } => Ok((node.with_path(path.to_vec()), xpub)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn wipe(&self) -> Result<(), SessionError> {
        self.expect_success(Request::WipeDevice).await.map(drop)
    }

    pub async fn reset(&self, settings: ResetSettings) -> Result<(), SessionError> {
        self.expect_success(Request::ResetDevice(settings)).await.map(drop)
    }

    pub async fn load(&self, settings: LoadSettings) -> Result<(), SessionError> {
        self.expect_success(Request::LoadDevice(settings)).await.map(drop)
    }

    pub async fn recover(&self, settings: RecoverySettings) -> Result<(), SessionError> {
        self.expect_success(Request::RecoveryDevice(settings)).await.map(drop)
    }

    pub async fn change_pin(&self, remove: bool) -> Result<(), SessionError> {
        self.expect_success(Request::ChangePin { remove }).await.map(drop)
    }

    pub async fn apply_settings(&self, settings: ApplySettings) -> Result<(), SessionError> {
        self.expect_success(Request::ApplySettings(settings)).await.map(drop)
    }

    /// Returns the signing address and the signature.
    pub async fn sign_message(
        &self,
        path: &[u32],
        message: &[u8],
        coin: &CoinParams,
    ) -> Result<(String, Vec<u8>), SessionError> {
        let request = Request::SignMessage {
            address_n: path.to_vec(),
            message: message.to_vec(),
            coin_name: coin.coin_name.clone(),
        };
        match self.call(request).await? {
            Response::MessageSignature { address, signature } => Ok((address, signature)),
            other => Err(unexpected(other)),
        }
    }

    /// Fails with a device error when the signature does not verify.
    pub async fn verify_message(
        &self,
        address: &str,
        signature: &[u8],
        message: &[u8],
    ) -> Result<(), SessionError> {
        let request = Request::VerifyMessage {
            address: address.to_string(),
            signature: signature.to_vec(),
            message: message.to_vec(),
        };
        self.expect_success(request).await.map(drop)
    }

    pub async fn erase_firmware(&self) -> Result<(), SessionError> {
        self.expect_success(Request::FirmwareErase).await.map(drop)
    }

    pub async fn upload_firmware(&self, payload: &[u8]) -> Result<(), SessionError> {
        let request = Request::FirmwareUpload {
            payload: payload.to_vec(),
        };
        self.expect_success(request).await.map(drop)
    }
}

#[async_trait]
impl TxSigner for DeviceSession {
    async fn measure_tx(
        &self,
        inputs: &[SignInput],
        outputs: &[SignOutput],
        coin: &CoinParams,
    ) -> Result<u32, SessionError> {
        let request = Request::MeasureTx {
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            coin_name: coin.coin_name.clone(),
        };
        match self.call(request).await? {
            Response::TxSize { size } => Ok(size),
            other => Err(unexpected(other)),
        }
    }

    async fn sign_tx(
        &self,
        inputs: &[SignInput],
        outputs: &[SignOutput],
        refs: &[RefTransaction],
        coin: &CoinParams,
    ) -> Result<Vec<u8>, SessionError> {
        let request = Request::SignTx {
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            refs: refs.to_vec(),
            coin_name: coin.coin_name.clone(),
        };
        match self.call(request).await? {
            Response::SignedTx { serialized } => Ok(serialized),
            other => Err(unexpected(other)),
        }
    }
}
