//! Device lifecycle through the device list: connect, initialize, account
//! discovery, management calls and persistence.

use std::sync::Arc;
use std::time::Duration;

use trove_core::coin::CoinParams;
use trove_core::error::SessionError;
use trove_device::device::load_payload;
use trove_device::interaction::InteractionRequest;
use trove_device::list::DeviceListEvent;
use trove_device::messages::{LoadSettings, PinKind};
use trove_device::{
    DeviceError, DeviceList, DeviceState, DeviceStorage, EndurePolicy, KeyValueStore, MemoryStore,
    Response,
};
use trove_tests::helpers::*;
use trove_wallet::WalletConfig;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Rig {
    api: Arc<MockBackendApi>,
    enumerator: Arc<MockEnumerator>,
    interaction: Arc<ScriptedInteraction>,
    store: Arc<MemoryStore>,
    list: DeviceList,
}

fn endure() -> EndurePolicy {
    EndurePolicy {
        delay: Duration::from_millis(10),
        attempts: 3,
    }
}

fn list_over(
    api: &Arc<MockBackendApi>,
    enumerator: &Arc<MockEnumerator>,
    interaction: &Arc<ScriptedInteraction>,
    store: &Arc<MemoryStore>,
) -> DeviceList {
    let store: Arc<dyn KeyValueStore> = store.clone();
    DeviceList::new(
        enumerator.clone(),
        interaction.clone(),
        api.registry(),
        Arc::new(WalletConfig::default()),
        DeviceStorage::new(store, 1),
    )
    .with_endure(endure())
    .with_poll_interval(Duration::from_millis(10))
}

fn rig() -> Rig {
    let api = MockBackendApi::new();
    let enumerator = MockEnumerator::new();
    let interaction = ScriptedInteraction::new();
    let store = Arc::new(MemoryStore::new());
    let list = list_over(&api, &enumerator, &interaction, &store);
    Rig {
        api,
        enumerator,
        interaction,
        store,
        list,
    }
}

/// Give account 0 one confirmed receipt.
fn fund_account_zero(api: &MockBackendApi) {
    let xpub = branch_xpub(0, 0);
    api.set_history(&xpub, vec![receive_tx("aa", 25_000, 3, 1_400_000_000)]);
    api.set_balance(balance(&xpub, vec![utxo("aa", 0, 25_000, 3)]));
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn discovery_stops_after_first_empty_account() {
    let rig = rig();
    fund_account_zero(&rig.api);
    let desc = rig.enumerator.attach("usb-1", MockTransport::new(true));

    let device = rig.list.connect(&desc).await.unwrap();
    let ids: Vec<u32> = device.accounts().iter().map(|a| a.id()).collect();
    assert_eq!(ids, vec![0, 1]);
    assert_eq!(device.status(), DeviceState::Provisioned);
    assert_eq!(device.balance(), 25_000);
    assert!(device.accounts()[1].is_empty());

    assert!(!device.can_add_account());
    assert!(!device.can_hide_account(0));
    assert!(device.can_hide_account(1));

    let hidden = device.hide_account(1).unwrap();
    assert_eq!(hidden.id(), 1);
    assert_eq!(device.accounts().len(), 1);
    assert!(device.can_add_account());
    assert!(!device.can_hide_account(0));
}

#[tokio::test]
async fn first_account_kept_when_empty() {
    let rig = rig();
    let transport = MockTransport::new(true);
    let desc = rig.enumerator.attach("usb-1", transport.clone());

    let device = rig.list.connect(&desc).await.unwrap();
    assert_eq!(device.accounts().len(), 1);
    assert!(device.accounts()[0].is_empty());
    assert!(!device.can_add_account());
    assert!(!device.can_hide_account(0));
    assert_eq!(
        transport.requests(),
        vec!["Initialize", "GetPublicKey", "GetPublicKey"]
    );
    assert_eq!(device.label(), "My TREZOR");
}

#[tokio::test]
async fn add_account_after_funded_last() {
    let rig = rig();
    let desc = rig.enumerator.attach("usb-1", MockTransport::new(true));
    let device = rig.list.connect(&desc).await.unwrap();
    assert_eq!(device.add_account().await.err(), Some(DeviceError::CannotAddAccount));

    // Fund account 0 and deliver the update on the stream.
    fund_account_zero(&rig.api);
    let mut events = device.accounts()[0].external().events();
    rig.api.push(balance(&branch_xpub(0, 0), vec![utxo("aa", 0, 25_000, 3)]));
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("update arrives")
        .unwrap();

    assert!(device.can_add_account());
    let added = device.add_account().await.unwrap();
    assert_eq!(added.id(), 1);
    assert!(added.is_initialized());
    assert_eq!(device.accounts().len(), 2);
}

#[tokio::test]
async fn failed_subscribe_leaves_accounts_unchanged() {
    let rig = rig();
    fund_account_zero(&rig.api);
    let desc = rig.enumerator.attach("usb-1", MockTransport::new(true));
    let device = rig.list.connect(&desc).await.unwrap();
    device.hide_account(1).unwrap();

    rig.api.fail_subscribes(true);
    let err = device.add_account().await.err();
    assert!(matches!(err, Some(DeviceError::Wallet(_))), "{err:?}");
    assert_eq!(device.accounts().len(), 1);
    assert!(device.can_add_account());

    rig.api.fail_subscribes(false);
    let added = device.add_account().await.unwrap();
    assert_eq!(added.id(), 1);
    assert!(added.is_initialized());
    assert_eq!(device.accounts().len(), 2);
}

#[tokio::test]
async fn only_last_empty_account_can_be_hidden() {
    let rig = rig();
    fund_account_zero(&rig.api);
    let desc = rig.enumerator.attach("usb-1", MockTransport::new(true));
    let device = rig.list.connect(&desc).await.unwrap();

    assert_eq!(device.hide_account(0).err(), Some(DeviceError::CannotHideAccount(0)));
    assert_eq!(device.hide_account(7).err(), Some(DeviceError::CannotHideAccount(7)));
    assert_eq!(device.accounts().len(), 2);

    device.hide_account(1).unwrap();
    assert_eq!(device.hide_account(0).err(), Some(DeviceError::CannotHideAccount(0)));
    assert_eq!(device.accounts().len(), 1);
}

#[tokio::test]
async fn empty_device_has_no_accounts() {
    let rig = rig();
    let desc = rig.enumerator.attach("usb-1", MockTransport::new(false));
    let device = rig.list.connect(&desc).await.unwrap();
    assert_eq!(device.status(), DeviceState::Empty);
    assert!(device.accounts().is_empty());
    assert!(!device.can_add_account());
}

#[tokio::test]
async fn tampered_xpub_is_rejected() {
    let rig = rig();
    let transport = MockTransport::new(true);
    transport.set_script(DeviceScript {
        tamper_xpub: true,
        ..DeviceScript::default()
    });
    let desc = rig.enumerator.attach("usb-1", transport);
    let mut events = rig.list.events();

    let err = rig.list.connect(&desc).await.err().unwrap();
    assert!(matches!(err, DeviceError::XpubMismatch(_)), "{err:?}");
    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        failed |= matches!(event, DeviceListEvent::Failed { .. });
    }
    assert!(failed);
}

#[tokio::test]
async fn tampered_child_is_rejected() {
    let rig = rig();
    let transport = MockTransport::new(true);
    transport.set_script(DeviceScript {
        tamper_child: true,
        ..DeviceScript::default()
    });
    let desc = rig.enumerator.attach("usb-1", transport);
    let err = rig.list.connect(&desc).await.err().unwrap();
    assert!(matches!(err, DeviceError::ChildMismatch(_)), "{err:?}");
}

// ---------------------------------------------------------------------------
// Interaction during initialization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pin_prompt_during_initialize() {
    let rig = rig();
    let transport = MockTransport::new(true);
    transport.queue(Response::PinMatrixRequest(PinKind::Current));
    let desc = rig.enumerator.attach("usb-1", transport.clone());

    let device = rig.list.connect(&desc).await.unwrap();
    assert_eq!(device.status(), DeviceState::Provisioned);
    assert_eq!(rig.interaction.seen(), vec![InteractionRequest::Pin(PinKind::Current)]);
    assert_eq!(&transport.requests()[..2], &["Initialize", "PinMatrixAck"]);
}

#[tokio::test]
async fn dismissed_prompt_fails_connect_without_retry() {
    let rig = rig();
    rig.interaction.dismiss_all();
    let transport = MockTransport::new(true);
    transport.queue(Response::PinMatrixRequest(PinKind::Current));
    let desc = rig.enumerator.attach("usb-1", transport.clone());

    let err = rig.list.connect(&desc).await.err().unwrap();
    assert_eq!(err, DeviceError::Session(SessionError::Cancelled));
    assert_eq!(transport.requests(), vec!["Initialize"]);
    let device = rig.list.get("usb-1").unwrap();
    assert_eq!(device.status(), DeviceState::Disconnected);
}

#[tokio::test]
async fn failing_initialize_is_retried() {
    let rig = rig();
    let transport = MockTransport::new(true);
    transport.queue(Response::Failure {
        code: 1,
        message: "busy".into(),
    });
    let desc = rig.enumerator.attach("usb-1", transport.clone());

    let device = rig.list.connect(&desc).await.unwrap();
    assert_eq!(device.status(), DeviceState::Provisioned);
    assert_eq!(&transport.requests()[..2], &["Initialize", "Initialize"]);
}

// ---------------------------------------------------------------------------
// Management calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wipe_drops_accounts() {
    let rig = rig();
    fund_account_zero(&rig.api);
    let transport = MockTransport::new(true);
    let desc = rig.enumerator.attach("usb-1", transport.clone());
    let device = rig.list.connect(&desc).await.unwrap();
    assert_eq!(device.accounts().len(), 2);

    device.wipe().await.unwrap();
    assert!(device.accounts().is_empty());
    assert_eq!(device.status(), DeviceState::Empty);
    assert!(transport.requests().contains(&"WipeDevice"));
}

#[tokio::test]
async fn load_provisions_empty_device() {
    let rig = rig();
    let desc = rig.enumerator.attach("usb-1", MockTransport::new(false));
    let device = rig.list.connect(&desc).await.unwrap();
    assert_eq!(device.status(), DeviceState::Empty);

    let words = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    let settings = LoadSettings {
        payload: load_payload(words, false).unwrap(),
        pin: None,
        passphrase_protection: false,
        label: "Loaded".into(),
        skip_checksum: false,
    };
    device.load(settings).await.unwrap();
    assert_eq!(device.status(), DeviceState::Provisioned);
    assert_eq!(device.accounts().len(), 1);
    assert_eq!(device.label(), "Loaded");
}

#[tokio::test]
async fn change_label_refreshes_features() {
    let rig = rig();
    let desc = rig.enumerator.attach("usb-1", MockTransport::new(true));
    let device = rig.list.connect(&desc).await.unwrap();
    device.change_label("Vault").await.unwrap();
    assert_eq!(device.label(), "Vault");
    assert_eq!(device.features().and_then(|f| f.label), Some("Vault".into()));
}

#[tokio::test]
async fn flash_erases_then_uploads() {
    let rig = rig();
    let transport = MockTransport::new(true);
    let desc = rig.enumerator.attach("usb-1", transport.clone());
    let device = rig.list.connect(&desc).await.unwrap();
    device.flash(&[0u8; 64]).await.unwrap();
    let requests = transport.requests();
    assert_eq!(&requests[requests.len() - 2..], &["FirmwareErase", "FirmwareUpload"]);
}

#[tokio::test]
async fn sign_message_passes_through() {
    let rig = rig();
    let desc = rig.enumerator.attach("usb-1", MockTransport::new(true));
    let device = rig.list.connect(&desc).await.unwrap();
    let (address, signature) = device
        .sign_message(&[0, 0], b"hello", &CoinParams::bitcoin())
        .await
        .unwrap();
    assert_eq!(address, "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH");
    assert_eq!(signature.len(), 65);
    device.verify_message(&address, &signature, b"hello").await.unwrap();
}

// ---------------------------------------------------------------------------
// Persistence and watching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn restored_accounts_are_not_rediscovered() {
    let rig = rig();
    fund_account_zero(&rig.api);
    let desc = rig.enumerator.attach("usb-1", MockTransport::new(true));
    let device = rig.list.connect(&desc).await.unwrap();
    assert!(device.check_passphrase("correct horse"));
    rig.list.store().unwrap();
    let keys: Vec<String> = device.accounts().iter().map(|a| a.public_key()).collect();
    drop(device);
    rig.list.disconnect(&desc);

    let fresh = list_over(&rig.api, &rig.enumerator, &rig.interaction, &rig.store);
    assert_eq!(fresh.restore(), 1);
    let restored = fresh.get("usb-1").unwrap();
    assert_eq!(restored.status(), DeviceState::Disconnected);
    let restored_keys: Vec<String> = restored.accounts().iter().map(|a| a.public_key()).collect();
    assert_eq!(restored_keys, keys);
    assert!(restored.has_saved_passphrase());
    assert!(!restored.check_passphrase("wrong"));

    rig.enumerator.detach("usb-1");
    let transport = MockTransport::new(true);
    let desc = rig.enumerator.attach("usb-1", transport.clone());
    let device = fresh.connect(&desc).await.unwrap();
    assert_eq!(transport.requests(), vec!["Initialize"]);
    assert!(device.accounts().iter().all(|a| a.is_initialized()));
    assert_eq!(device.balance(), 25_000);
}

#[tokio::test]
async fn forget_removes_device() {
    let rig = rig();
    let desc = rig.enumerator.attach("usb-1", MockTransport::new(true));
    rig.list.connect(&desc).await.unwrap();
    assert!(rig.list.forget("usb-1").is_some());
    assert_eq!(rig.list.count(), 0);

    let fresh = list_over(&rig.api, &rig.enumerator, &rig.interaction, &rig.store);
    assert_eq!(fresh.restore(), 0);
}

#[tokio::test]
async fn watcher_connects_and_disconnects() {
    let rig = rig();
    let list = Arc::new(rig.list);
    let mut events = list.events();
    let runner = {
        let list = list.clone();
        tokio::spawn(async move { list.run().await })
    };

    rig.enumerator.attach("usb-7", MockTransport::new(true));
    let initialized = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(DeviceListEvent::Initialized(id)) = events.recv().await {
                return id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(initialized, "usb-7");

    rig.enumerator.detach("usb-7");
    let disconnected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(DeviceListEvent::Disconnected(id)) = events.recv().await {
                return id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(disconnected, "usb-7");
    assert_eq!(list.get("usb-7").unwrap().status(), DeviceState::Disconnected);
    runner.abort();
}
