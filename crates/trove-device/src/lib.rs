//! # trove-device — hardware device sessions and lifecycle.
//!
//! # Modules
//!
//! - [`error`] — `DeviceError` enum
//! - [`messages`] — request and response kinds, features, settings
//! - [`transport`] — `Transport` and `Enumerator` seams
//! - [`interaction`] — PIN, passphrase, button and word prompts
//! - [`session`] — request/response loop with interaction suspension
//! - [`endure`] — bounded retry for initialization
//! - [`device`] — device state, account discovery and management calls
//! - [`list`] — descriptor watching and the device list
//! - [`storage`] — versioned persistence of devices and accounts

pub mod device;
pub mod endure;
pub mod error;
pub mod interaction;
pub mod list;
pub mod messages;
pub mod session;
pub mod storage;
pub mod transport;

pub use device::{rate_pin, Device, DeviceState, PinStrength};
pub use endure::{endure, EndurePolicy};
pub use error::DeviceError;
pub use interaction::{Dismissed, InteractionHandler, InteractionRequest, Prompt, PromptChannel};
pub use list::{descriptor_delta, DescriptorDelta, DeviceList, DeviceListEvent, DeviceWatcher};
pub use messages::{Features, Request, Response};
pub use session::{DeviceSession, SessionEvent};
pub use storage::{DeviceStorage, FileStore, KeyValueStore, MemoryStore};
pub use transport::{Descriptor, Enumerator, Transport};
