//! Per-coin backend synchronization.
//!
//! A [`BackendSync`] owns one long-poll stream shared by every subscribed
//! xpub. The stream moves through `Disconnected -> Connecting -> Listening`;
//! concurrent callers of [`BackendSync::connect`] share a single in-flight
//! attempt, and a failed attempt clears the slot so the next caller starts
//! over. While listening, a spawned task polls the stream and routes each
//! push message to the subscription registered for its `publicMaster`.
//! A stream error drops back to `Disconnected`; if subscriptions remain the
//! task reconnects and re-registers them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use trove_core::hdnode::{encode_xpub, HdNode};

use crate::api::BackendApi;
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::protocol::{PushMessage, SendRequest, SubscribeRequest, WireTransaction};

type ConnectAttempt = Shared<BoxFuture<'static, Result<String, BackendError>>>;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Listening,
}

enum State {
    Disconnected,
    Connecting {
        generation: u64,
        attempt: ConnectAttempt,
    },
    Listening {
        generation: u64,
        client_id: String,
    },
}

struct Handler {
    id: u64,
    request: SubscribeRequest,
    tx: mpsc::UnboundedSender<PushMessage>,
}

struct Inner {
    coin: String,
    api: Arc<dyn BackendApi>,
    config: BackendConfig,
    state: Mutex<State>,
    handlers: Mutex<HashMap<String, Handler>>,
    next_id: AtomicU64,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        matches!(
            &*self.state.lock(),
            State::Listening { generation: g, .. } if *g == generation
        )
    }

    fn reset(&self, generation: u64) {
        let mut state = self.state.lock();
        if matches!(&*state, State::Listening { generation: g, .. } if *g == generation) {
            *state = State::Disconnected;
        }
    }

    fn dispatch(&self, message: PushMessage) {
        let mut handlers = self.handlers.lock();
        match handlers.get(&message.public_master) {
            Some(handler) => {
                let key = message.public_master.clone();
                if handler.tx.send(message).is_err() {
                    handlers.remove(&key);
                }
            }
            None => debug!(coin = %self.coin, xpub = %message.public_master, "update for unknown subscription"),
        }
    }

    fn remove_handler(&self, xpub: &str, id: u64) {
        let mut handlers = self.handlers.lock();
        if handlers.get(xpub).is_some_and(|h| h.id == id) {
            handlers.remove(xpub);
        }
    }
}

/// Shared handle to one coin's backend stream.
#[derive(Clone)]
pub struct BackendSync {
    inner: Arc<Inner>,
}

impl BackendSync {
    pub fn new(coin: impl Into<String>, api: Arc<dyn BackendApi>, config: BackendConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                coin: coin.into(),
                api,
                config,
                state: Mutex::new(State::Disconnected),
                handlers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn coin(&self) -> &str {
        &self.inner.coin
    }

    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.inner.state.lock() {
            State::Disconnected => ConnectionState::Disconnected,
            State::Connecting { .. } => ConnectionState::Connecting,
            State::Listening { .. } => ConnectionState::Listening,
        }
    }

    /// The xpub a node is subscribed under.
    pub fn xpub(&self, node: &HdNode) -> String {
        encode_xpub(node, self.inner.config.xpub_version)
    }

    /// Number of registered subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Open the stream if needed and return its client id.
    pub async fn connect(&self) -> Result<String, BackendError> {
        let attempt = {
            let mut state = self.inner.state.lock();
            match &*state {
                State::Listening { client_id, .. } => return Ok(client_id.clone()),
                State::Connecting { attempt, .. } => attempt.clone(),
                State::Disconnected => {
                    let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let attempt = open(self.inner.clone(), generation).shared();
                    *state = State::Connecting {
                        generation,
                        attempt: attempt.clone(),
                    };
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Register `node` for balance updates. Returns `Ok(None)` when the node
    /// is already subscribed.
    pub async fn subscribe(&self, node: &HdNode) -> Result<Option<Subscription>, BackendError> {
        let xpub = self.xpub(node);
        if self.inner.handlers.lock().contains_key(&xpub) {
            debug!(coin = %self.inner.coin, %xpub, "already subscribed");
            return Ok(None);
        }

        let client_id = self.connect().await?;
        let request = SubscribeRequest {
            public_master: xpub.clone(),
            after: self.inner.config.after.clone(),
            look_ahead: self.inner.config.look_ahead,
            first_index: self.inner.config.first_index,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut handlers = self.inner.handlers.lock();
            if handlers.contains_key(&xpub) {
                return Ok(None);
            }
            handlers.insert(
                xpub.clone(),
                Handler {
                    id,
                    request: request.clone(),
                    tx,
                },
            );
        }

        match self.inner.api.subscribe(&client_id, &request).await {
            Ok(Some(message)) => self.inner.dispatch(message),
            Ok(None) => {}
            Err(e) => {
                self.inner.remove_handler(&xpub, id);
                return Err(e);
            }
        }

        info!(coin = %self.inner.coin, %xpub, "subscribed");
        Ok(Some(Subscription {
            xpub,
            id,
            updates: rx,
            inner: Arc::downgrade(&self.inner),
        }))
    }

    /// Drop the handler for `node`. The stream stays open.
    pub fn unsubscribe(&self, node: &HdNode) -> bool {
        let xpub = self.xpub(node);
        let removed = self.inner.handlers.lock().remove(&xpub).is_some();
        if removed {
            info!(coin = %self.inner.coin, %xpub, "unsubscribed");
        }
        removed
    }

    pub async fn transactions(&self, node: &HdNode) -> Result<Vec<WireTransaction>, BackendError> {
        self.inner.api.transactions(&self.xpub(node)).await
    }

    pub async fn transaction(
        &self,
        node: &HdNode,
        hash: &str,
    ) -> Result<WireTransaction, BackendError> {
        self.inner.api.transaction(&self.xpub(node), hash).await
    }

    /// Broadcast a signed raw transaction.
    pub async fn send(&self, raw_tx: &[u8]) -> Result<(), BackendError> {
        let request = SendRequest::new(raw_tx);
        self.inner.api.send(&request).await?;
        info!(coin = %self.inner.coin, bytes = raw_tx.len(), "transaction broadcast");
        Ok(())
    }

    async fn resubscribe_all(&self, client_id: &str) {
        let requests: Vec<SubscribeRequest> = self
            .inner
            .handlers
            .lock()
            .values()
            .map(|h| h.request.clone())
            .collect();
        for request in requests {
            match self.inner.api.subscribe(client_id, &request).await {
                Ok(Some(message)) => self.inner.dispatch(message),
                Ok(None) => {}
                Err(e) => warn!(coin = %self.inner.coin, xpub = %request.public_master, error = %e, "resubscribe failed"),
            }
        }
    }
}

fn open(inner: Arc<Inner>, generation: u64) -> BoxFuture<'static, Result<String, BackendError>> {
    async move {
        let result = inner.api.open_stream().await;
        let mut state = inner.state.lock();
        let current = matches!(
            &*state,
            State::Connecting { generation: g, .. } if *g == generation
        );
        if current {
            match &result {
                Ok(client_id) => {
                    *state = State::Listening {
                        generation,
                        client_id: client_id.clone(),
                    };
                    drop(state);
                    info!(coin = %inner.coin, %client_id, "backend stream open");
                    tokio::spawn(listen(Arc::downgrade(&inner), generation, client_id.clone()));
                }
                Err(e) => {
                    *state = State::Disconnected;
                    drop(state);
                    warn!(coin = %inner.coin, error = %e, "backend connection failed");
                }
            }
        }
        result
    }
    .boxed()
}

async fn listen(inner: Weak<Inner>, generation: u64, client_id: String) {
    loop {
        let Some(strong) = inner.upgrade() else { return };
        if !strong.is_current(generation) {
            return;
        }
        let interval = strong.config.poll_interval();
        let started = Instant::now();
        let polled = strong.api.poll(&client_id).await;
        match polled {
            Ok(messages) => {
                for message in messages {
                    strong.dispatch(message);
                }
            }
            Err(e) => {
                warn!(coin = %strong.coin, error = %e, "backend stream lost");
                strong.reset(generation);
                drop(strong);
                resume(inner).await;
                return;
            }
        }
        drop(strong);
        let elapsed = started.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }
}

async fn resume(inner: Weak<Inner>) {
    loop {
        let interval = match inner.upgrade() {
            Some(strong) if !strong.handlers.lock().is_empty() => strong.config.poll_interval(),
            _ => return,
        };
        tokio::time::sleep(interval).await;
        let Some(strong) = inner.upgrade() else { return };
        let sync = BackendSync { inner: strong };
        match sync.connect().await {
            Ok(client_id) => {
                sync.resubscribe_all(&client_id).await;
                return;
            }
            Err(e) => warn!(coin = %sync.inner.coin, error = %e, "backend reconnect failed"),
        }
    }
}

/// Receiving end of one xpub's balance updates. Dropping it unregisters the
/// handler.
pub struct Subscription {
    xpub: String,
    id: u64,
    updates: mpsc::UnboundedReceiver<PushMessage>,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn xpub(&self) -> &str {
        &self.xpub
    }

    /// Next push message, or `None` once unsubscribed.
    pub async fn next(&mut self) -> Option<PushMessage> {
        self.updates.recv().await
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_handler(&self.xpub, self.id);
        }
    }
}
