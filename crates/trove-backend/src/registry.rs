//! Per-coin backend registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::api::HttpBackend;
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::sync::BackendSync;

type Factory = Box<dyn Fn(&str) -> Result<BackendSync, BackendError> + Send + Sync>;

/// Owns one [`BackendSync`] per coin, created on first use.
pub struct BackendRegistry {
    factory: Factory,
    backends: Mutex<HashMap<String, BackendSync>>,
}

impl BackendRegistry {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> Result<BackendSync, BackendError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            backends: Mutex::new(HashMap::new()),
        }
    }

    /// Registry creating [`HttpBackend`]s from per-coin configs.
    pub fn http(configs: HashMap<String, BackendConfig>) -> Self {
        Self::new(move |coin| {
            let config = configs
                .get(coin)
                .cloned()
                .ok_or_else(|| BackendError::UnknownCoin(coin.to_string()))?;
            let api = HttpBackend::new(config.clone())?;
            Ok(BackendSync::new(coin, Arc::new(api), config))
        })
    }

    pub fn get(&self, coin: &str) -> Result<BackendSync, BackendError> {
        let mut backends = self.backends.lock();
        if let Some(existing) = backends.get(coin) {
            return Ok(existing.clone());
        }
        let backend = (self.factory)(coin)?;
        debug!(coin, "created backend");
        backends.insert(coin.to_string(), backend.clone());
        Ok(backend)
    }
}
