//! Seams to the physical device link.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use trove_core::error::SessionError;

use crate::messages::{Request, Response};

/// Identifies one attached device as seen by the enumerator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Descriptor {
    pub path: String,
}

impl Descriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// One request/response exchange with an acquired device.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, request: Request) -> Result<Response, SessionError>;
}

/// Lists attached devices and opens transports to them.
#[async_trait]
pub trait Enumerator: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<Descriptor>, SessionError>;

    async fn acquire(&self, descriptor: &Descriptor) -> Result<Arc<dyn Transport>, SessionError>;
}
