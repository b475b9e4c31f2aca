//! End-to-end mock AMS flow: backend events drive the bridge, the
//! bridge drives the cells.

use std::sync::Arc;
use std::time::Duration;

use helix_ams::bridge::keys;
use helix_ams::{AmsBackend, AmsBridge, GateStatus, MockAmsBackend};
use helix_core::store::StateStore;

fn leaked_store() -> &'static StateStore {
    Box::leak(Box::new(StateStore::new()))
}

#[tokio::test]
async fn load_then_unload_round_trip() {
    let store = leaked_store();
    let bridge = AmsBridge::new(store);
    bridge.init_cells();

    let backend = Arc::new(MockAmsBackend::new(4));
    backend.set_operation_delay(Duration::from_millis(20));
    bridge.set_backend(backend.clone()).await.unwrap();

    backend.load_gate(3).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.cell(keys::AMS_CURRENT_GATE).unwrap().get_int(), 3);
    assert_eq!(store.cell(keys::AMS_FILAMENT_LOADED).unwrap().get_int(), 1);
    assert_eq!(
        backend.system_info().gate(3).unwrap().status,
        GateStatus::Loaded
    );

    backend.unload().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(store.cell(keys::AMS_FILAMENT_LOADED).unwrap().get_int(), 0);
    assert_eq!(
        store.cell(&keys::gate_status(3)).unwrap().get_text(),
        "Available"
    );
}
