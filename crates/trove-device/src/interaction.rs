//! User interaction prompts raised while a device call is suspended.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::messages::{ButtonCode, PinKind};

/// The user closed a prompt without answering.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("prompt dismissed")]
pub struct Dismissed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionRequest {
    Pin(PinKind),
    Passphrase,
    Button(ButtonCode),
    Word,
}

/// Answers device prompts. Each call resolves once the user responds.
#[async_trait]
pub trait InteractionHandler: Send + Sync {
    async fn on_pin(&self, kind: PinKind) -> Result<String, Dismissed>;

    async fn on_passphrase(&self) -> Result<String, Dismissed>;

    /// Called when the device waits for a button press. Resolves when the
    /// prompt may be acknowledged.
    async fn on_button(&self, code: ButtonCode) -> Result<(), Dismissed>;

    async fn on_word(&self) -> Result<String, Dismissed>;
}

/// A pending prompt handed to the UI. Dropping it dismisses the prompt.
#[derive(Debug)]
pub struct Prompt {
    pub request: InteractionRequest,
    responder: oneshot::Sender<Result<String, Dismissed>>,
}

impl Prompt {
    pub fn respond(self, value: impl Into<String>) {
        let _ = self.responder.send(Ok(value.into()));
    }

    /// Acknowledge a button prompt.
    pub fn confirm(self) {
        self.respond(String::new());
    }

    pub fn dismiss(self) {
        let _ = self.responder.send(Err(Dismissed));
    }
}

/// [`InteractionHandler`] that forwards prompts over a channel.
#[derive(Clone)]
pub struct PromptChannel {
    tx: mpsc::Sender<Prompt>,
}

impl PromptChannel {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Prompt>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    async fn ask(&self, request: InteractionRequest) -> Result<String, Dismissed> {
        let (responder, answer) = oneshot::channel();
        self.tx
            .send(Prompt { request, responder })
            .await
            .map_err(|_| Dismissed)?;
        answer.await.unwrap_or(Err(Dismissed))
    }
}

#[async_trait]
impl InteractionHandler for PromptChannel {
    async fn on_pin(&self, kind: PinKind) -> Result<String, Dismissed> {
        self.ask(InteractionRequest::Pin(kind)).await
    }

    async fn on_passphrase(&self) -> Result<String, Dismissed> {
        self.ask(InteractionRequest::Passphrase).await
    }

    async fn on_button(&self, code: ButtonCode) -> Result<(), Dismissed> {
        self.ask(InteractionRequest::Button(code)).await.map(|_| ())
    }

    async fn on_word(&self) -> Result<String, Dismissed> {
        self.ask(InteractionRequest::Word).await
    }
}
