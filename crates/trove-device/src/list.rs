//! Attached-device watching and the list of known devices.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use trove_backend::BackendRegistry;
use trove_wallet::WalletConfig;

use crate::device::Device;
use crate::endure::EndurePolicy;
use crate::error::DeviceError;
use crate::interaction::InteractionHandler;
use crate::session::{DeviceSession, SessionEvent};
use crate::storage::DeviceStorage;
use crate::transport::{Descriptor, Enumerator};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorDelta {
    pub added: Vec<Descriptor>,
    pub removed: Vec<Descriptor>,
}

impl DescriptorDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Descriptors present only in `next` are added, those only in `prev` are
/// removed. Order follows the input lists.
pub fn descriptor_delta(prev: &[Descriptor], next: &[Descriptor]) -> DescriptorDelta {
    let before: BTreeSet<&Descriptor> = prev.iter().collect();
    let after: BTreeSet<&Descriptor> = next.iter().collect();
    DescriptorDelta {
        added: next.iter().filter(|d| !before.contains(d)).cloned().collect(),
        removed: prev.iter().filter(|d| !after.contains(d)).cloned().collect(),
    }
}

/// Polls the enumerator and reports changes in the attached set.
///
/// Ticks are skipped while paused, and a slow enumeration delays the next
/// tick instead of queueing more.
#[derive(Clone)]
pub struct DeviceWatcher {
    enumerator: Arc<dyn Enumerator>,
    interval: Duration,
    paused: Arc<AtomicBool>,
}

impl DeviceWatcher {
    pub fn new(enumerator: Arc<dyn Enumerator>, interval: Duration) -> Self {
        Self {
            enumerator,
            interval,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Pause while `session` has a request on the wire.
    pub fn track(&self, session: &DeviceSession) -> JoinHandle<()> {
        let mut events = session.events();
        let paused = self.paused.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Send(_)) => paused.store(true, Ordering::SeqCst),
                    Ok(SessionEvent::Receive(_) | SessionEvent::Error(_)) => {
                        paused.store(false, Ordering::SeqCst)
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Start polling. Deltas arrive on the returned channel; the task ends
    /// when the receiver is dropped.
    pub fn spawn(&self) -> (mpsc::Receiver<DescriptorDelta>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let watcher = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watcher.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut known: Vec<Descriptor> = Vec::new();
            loop {
                ticker.tick().await;
                if watcher.is_paused() {
                    continue;
                }
                let attached = match watcher.enumerator.enumerate().await {
                    Ok(attached) => attached,
                    Err(e) => {
                        warn!(error = %e, "enumeration failed");
                        continue;
                    }
                };
                let delta = descriptor_delta(&known, &attached);
                known = attached;
                if delta.is_empty() {
                    continue;
                }
                debug!(added = delta.added.len(), removed = delta.removed.len(), "attached devices changed");
                if tx.send(delta).await.is_err() {
                    break;
                }
            }
        });
        (rx, handle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceListEvent {
    Added(String),
    Connected(String),
    Initialized(String),
    Disconnected(String),
    Failed { id: String, message: String },
    Forgotten(String),
}

pub struct DeviceList {
    devices: Mutex<Vec<Arc<Device>>>,
    storage: DeviceStorage,
    enumerator: Arc<dyn Enumerator>,
    handler: Arc<dyn InteractionHandler>,
    registry: Arc<BackendRegistry>,
    config: Arc<WalletConfig>,
    watcher: DeviceWatcher,
    endure: EndurePolicy,
    events: broadcast::Sender<DeviceListEvent>,
}

impl DeviceList {
    pub fn new(
        enumerator: Arc<dyn Enumerator>,
        handler: Arc<dyn InteractionHandler>,
        registry: Arc<BackendRegistry>,
        config: Arc<WalletConfig>,
        storage: DeviceStorage,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            devices: Mutex::new(Vec::new()),
            storage,
            watcher: DeviceWatcher::new(enumerator.clone(), DEFAULT_POLL_INTERVAL),
            enumerator,
            handler,
            registry,
            config,
            endure: EndurePolicy::default(),
            events,
        }
    }

    pub fn with_endure(mut self, policy: EndurePolicy) -> Self {
        self.endure = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.watcher = DeviceWatcher::new(self.enumerator.clone(), interval);
        self
    }

    pub fn events(&self) -> broadcast::Receiver<DeviceListEvent> {
        self.events.subscribe()
    }

    pub fn watcher(&self) -> &DeviceWatcher {
        &self.watcher
    }

    fn emit(&self, event: DeviceListEvent) {
        let _ = self.events.send(event);
    }

    /// Load known devices from storage, replacing the current list.
    /// Records that no longer fit the configuration are skipped.
    pub fn restore(&self) -> usize {
        let restored: Vec<Arc<Device>> = self
            .storage
            .restore()
            .iter()
            .filter_map(|record| {
                match Device::from_record(record, self.registry.clone(), self.config.clone()) {
                    Ok(device) => Some(Arc::new(device.with_endure(self.endure))),
                    Err(e) => {
                        warn!(device_id = %record.id, error = %e, "skipping stored device");
                        None
                    }
                }
            })
            .collect();
        let count = restored.len();
        *self.devices.lock() = restored;
        info!(devices = count, "device list restored");
        count
    }

    pub fn store(&self) -> Result<(), DeviceError> {
        let records: Vec<_> = self.devices().iter().map(|d| d.to_record()).collect();
        self.storage.store(&records)
    }

    fn persist(&self) {
        if let Err(e) = self.store() {
            warn!(error = %e, "failed to store devices");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.lock().iter().find(|d| d.id() == id).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.devices.lock().len()
    }

    /// The device known under the descriptor's path, created if new.
    pub fn get_or_create(&self, descriptor: &Descriptor) -> Arc<Device> {
        let mut devices = self.devices.lock();
        if let Some(existing) = devices.iter().find(|d| d.id() == descriptor.path) {
            return existing.clone();
        }
        let device = Arc::new(
            Device::new(descriptor.path.clone(), self.registry.clone(), self.config.clone())
                .with_endure(self.endure),
        );
        devices.push(device.clone());
        drop(devices);
        self.emit(DeviceListEvent::Added(descriptor.path.clone()));
        device
    }

    /// Acquire the device, open a session and initialize it.
    pub async fn connect(&self, descriptor: &Descriptor) -> Result<Arc<Device>, DeviceError> {
        let device = self.get_or_create(descriptor);
        if let Err(e) = self.open(&device, descriptor).await {
            warn!(device_id = %device.id(), error = %e, "loading device failed");
            self.emit(DeviceListEvent::Failed {
                id: device.id().to_string(),
                message: e.to_string(),
            });
            return Err(e);
        }
        self.emit(DeviceListEvent::Initialized(device.id().to_string()));
        self.persist();
        Ok(device)
    }

    async fn open(&self, device: &Device, descriptor: &Descriptor) -> Result<(), DeviceError> {
        let transport = self.enumerator.acquire(descriptor).await?;
        let session = Arc::new(DeviceSession::new(transport, self.handler.clone()));
        self.watcher.track(&session);
        device.connect(session);
        self.emit(DeviceListEvent::Connected(device.id().to_string()));
        device.initialize().await.map(drop)
    }

    pub fn disconnect(&self, descriptor: &Descriptor) {
        if let Some(device) = self.get(&descriptor.path) {
            device.disconnect();
            self.emit(DeviceListEvent::Disconnected(device.id().to_string()));
        }
    }

    /// Drop a device and its accounts from the list and from storage.
    pub fn forget(&self, id: &str) -> Option<Arc<Device>> {
        let device = {
            let mut devices = self.devices.lock();
            let index = devices.iter().position(|d| d.id() == id)?;
            devices.remove(index)
        };
        device.disconnect();
        device.unsubscribe();
        self.persist();
        self.emit(DeviceListEvent::Forgotten(id.to_string()));
        Some(device)
    }

    pub async fn handle_delta(&self, delta: &DescriptorDelta) {
        for descriptor in &delta.added {
            // Failures are already reported as events.
            let _ = self.connect(descriptor).await;
        }
        for descriptor in &delta.removed {
            self.disconnect(descriptor);
        }
    }

    /// Watch for attached devices until the watcher stops.
    pub async fn run(&self) {
        let (mut deltas, handle) = self.watcher.spawn();
        while let Some(delta) = deltas.recv().await {
            self.handle_delta(&delta).await;
        }
        handle.abort();
    }
}
