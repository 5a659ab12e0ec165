//! The HTTP surface of the backend.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::protocol::{PushMessage, SendRequest, StreamHandle, SubscribeRequest, WireTransaction};

/// Backend endpoints used by [`BackendSync`](crate::sync::BackendSync).
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Open a long-poll stream, returning its client id.
    async fn open_stream(&self) -> Result<String, BackendError>;

    /// Wait for the next batch of push messages. An empty batch means the
    /// poll timed out with nothing to report.
    async fn poll(&self, client_id: &str) -> Result<Vec<PushMessage>, BackendError>;

    /// Register an xpub on the stream. The backend may answer with an
    /// immediate balance update.
    async fn subscribe(
        &self,
        client_id: &str,
        request: &SubscribeRequest,
    ) -> Result<Option<PushMessage>, BackendError>;

    async fn transactions(&self, xpub: &str) -> Result<Vec<WireTransaction>, BackendError>;

    async fn transaction(&self, xpub: &str, hash: &str) -> Result<WireTransaction, BackendError>;

    async fn send(&self, request: &SendRequest) -> Result<(), BackendError>;
}

/// [`BackendApi`] over HTTP with reqwest.
pub struct HttpBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { client, config })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn open_stream(&self) -> Result<String, BackendError> {
        let response = self.client.post(self.config.url("lp")).send().await?;
        let handle: StreamHandle = Self::check(response).await?.json().await?;
        debug!(client_id = %handle.client_id, "opened backend stream");
        Ok(handle.client_id)
    }

    async fn poll(&self, client_id: &str) -> Result<Vec<PushMessage>, BackendError> {
        let url = self.config.url(&format!("lp/{client_id}"));
        let response = Self::check(self.client.get(url).send().await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        Ok(response.json().await?)
    }

    async fn subscribe(
        &self,
        client_id: &str,
        request: &SubscribeRequest,
    ) -> Result<Option<PushMessage>, BackendError> {
        let url = self.config.url(&format!("lp/{client_id}"));
        let response = self.client.post(url).json(request).send().await?;
        let body = Self::check(response).await?.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn transactions(&self, xpub: &str) -> Result<Vec<WireTransaction>, BackendError> {
        let url = self.config.url(&format!("trezor/{xpub}/transactions"));
        let response = self.client.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn transaction(&self, xpub: &str, hash: &str) -> Result<WireTransaction, BackendError> {
        let url = self.config.url(&format!("trezor/{xpub}/transactions/{hash}"));
        let response = self.client.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn send(&self, request: &SendRequest) -> Result<(), BackendError> {
        let url = self.config.url("trezor/send");
        let response = self.client.post(url).json(request).send().await?;
        Self::check(response).await?;
        Ok(())
    }
}
