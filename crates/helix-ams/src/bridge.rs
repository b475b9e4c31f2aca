//! Bridge between AMS backends and the reactive state store.
//!
//! Owns the `ams_*` cells and keeps them in sync with the active
//! backend. Backend events arrive on network or worker tasks, so every
//! cell write goes through the store's marshalled path.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use helix_core::store::{CellValue, StateStore};
use helix_core::AmsType;

use crate::backend::AmsBackend;
use crate::types::{AmsEvent, AmsSystemInfo, GateStatus, DEFAULT_GATE_COLOR, MAX_GATES};

/// Cell keys owned by the bridge
pub mod keys {
    pub const AMS_TYPE: &str = "ams_type";
    pub const AMS_ACTION: &str = "ams_action";
    pub const AMS_ACTION_DETAIL: &str = "ams_action_detail";
    pub const AMS_CURRENT_GATE: &str = "ams_current_gate";
    pub const AMS_CURRENT_TOOL: &str = "ams_current_tool";
    pub const AMS_FILAMENT_LOADED: &str = "ams_filament_loaded";
    pub const AMS_BYPASS_ACTIVE: &str = "ams_bypass_active";
    pub const AMS_GATE_COUNT: &str = "ams_gate_count";
    pub const AMS_GATES_VERSION: &str = "ams_gates_version";

    pub fn gate_color(i: usize) -> String {
        format!("ams_gate_{i}_color")
    }

    pub fn gate_status(i: usize) -> String {
        format!("ams_gate_{i}_status")
    }
}

struct BridgeInner {
    store: &'static StateStore,
    backend: Mutex<Option<Arc<dyn AmsBackend>>>,
    /// Source of truth for ams_gates_version; cell writes are
    /// asynchronous, so read-modify-write on the cell would race.
    version: Mutex<i32>,
}

/// Publishes AMS state as reactive cells
pub struct AmsBridge {
    inner: Arc<BridgeInner>,
}

impl AmsBridge {
    pub fn new(store: &'static StateStore) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                store,
                backend: Mutex::new(None),
                version: Mutex::new(0),
            }),
        }
    }

    /// Register every cell the bridge writes
    ///
    /// Idempotent; per-gate cells exist for indices below [`MAX_GATES`]
    /// regardless of how many gates the backend reports.
    pub fn init_cells(&self) {
        let store = self.inner.store;
        store.register_text(keys::AMS_TYPE, "none");
        store.register_text(keys::AMS_ACTION, "Idle");
        store.register_text(keys::AMS_ACTION_DETAIL, "");
        store.register_int(keys::AMS_CURRENT_GATE, -1);
        store.register_int(keys::AMS_CURRENT_TOOL, -1);
        store.register_int(keys::AMS_FILAMENT_LOADED, 0);
        store.register_int(keys::AMS_BYPASS_ACTIVE, 0);
        store.register_int(keys::AMS_GATE_COUNT, 0);
        store.register_int(keys::AMS_GATES_VERSION, 0);
        for i in 0..MAX_GATES {
            store.register_int(&keys::gate_color(i), DEFAULT_GATE_COLOR as i32);
            store.register_text(&keys::gate_status(i), "Unknown");
        }
    }

    /// Install a backend, stopping any predecessor first
    pub async fn set_backend(&self, backend: Arc<dyn AmsBackend>) -> helix_core::Result<()> {
        let previous = self.inner.backend.lock().take();
        if let Some(previous) = previous {
            debug!("Stopping previous AMS backend");
            previous.stop().await?;
        }

        let inner = self.inner.clone();
        backend.set_event_callback(Arc::new(move |event, data| {
            inner.handle_event(event, data);
        }));
        backend.start().await?;
        info!(ams_type = %backend.ams_type(), "AMS backend active");
        *self.inner.backend.lock() = Some(backend);
        self.sync_from_backend();
        Ok(())
    }

    /// Drop the backend and reset cells to their no-AMS defaults
    pub async fn clear_backend(&self) -> helix_core::Result<()> {
        let previous = self.inner.backend.lock().take();
        if let Some(previous) = previous {
            previous.stop().await?;
        }
        self.inner.publish(&AmsSystemInfo::default());
        Ok(())
    }

    /// Currently installed backend
    pub fn backend(&self) -> Option<Arc<dyn AmsBackend>> {
        self.inner.backend.lock().clone()
    }

    /// Rewrite every cell from a fresh backend snapshot
    pub fn sync_from_backend(&self) {
        let Some(backend) = self.backend() else {
            return;
        };
        self.inner.publish(&backend.system_info());
    }

    /// Feed a host status delta to the active backend
    pub fn process_status_update(&self, status: &serde_json::Value) {
        if let Some(backend) = self.backend() {
            backend.process_status_update(status);
        }
    }
}

impl BridgeInner {
    fn handle_event(&self, event: AmsEvent, data: &str) {
        debug!(event = event.name(), data, "AMS event");
        match event {
            AmsEvent::GateChanged => match data.parse::<usize>() {
                Ok(index) => self.publish_gate(index),
                Err(_) => self.publish_current(),
            },
            AmsEvent::Error | AmsEvent::Attention => {
                warn!(event = event.name(), data, "AMS needs attention");
                self.publish_current();
            }
            _ => self.publish_current(),
        }
    }

    fn publish_current(&self) {
        let backend = self.backend.lock().clone();
        if let Some(backend) = backend {
            self.publish(&backend.system_info());
        }
    }

    /// Update only one gate's cells, then bump the version
    fn publish_gate(&self, index: usize) {
        let backend = self.backend.lock().clone();
        let Some(backend) = backend else { return };
        if index >= MAX_GATES {
            return;
        }
        let info = backend.system_info();
        let Some(gate) = info.gate(index as i32) else {
            return;
        };
        self.store.write_marshalled(
            &keys::gate_color(index),
            CellValue::Int(gate.color as i32),
        );
        self.store.write_marshalled(
            &keys::gate_status(index),
            CellValue::Text(gate.status.to_string()),
        );
        self.bump_version();
    }

    fn publish(&self, info: &AmsSystemInfo) {
        let store = self.store;
        let type_name = match info.ams_type {
            AmsType::None => "none",
            AmsType::HappyHare => "happy_hare",
            AmsType::Afc => "afc",
        };
        store.write_marshalled(keys::AMS_TYPE, CellValue::Text(type_name.to_string()));
        store.write_marshalled(keys::AMS_ACTION, CellValue::Text(info.action.to_string()));
        store.write_marshalled(
            keys::AMS_ACTION_DETAIL,
            CellValue::Text(info.operation_detail.clone()),
        );
        store.write_marshalled(keys::AMS_CURRENT_GATE, CellValue::Int(info.current_gate));
        store.write_marshalled(keys::AMS_CURRENT_TOOL, CellValue::Int(info.current_tool));
        store.write_marshalled(
            keys::AMS_FILAMENT_LOADED,
            CellValue::Int(info.filament_loaded as i32),
        );
        store.write_marshalled(
            keys::AMS_BYPASS_ACTIVE,
            CellValue::Int(info.bypass_active as i32),
        );
        store.write_marshalled(keys::AMS_GATE_COUNT, CellValue::Int(info.total_gates));

        let shown = (info.total_gates.max(0) as usize).min(MAX_GATES);
        for i in 0..shown {
            let (color, status) = info
                .gate(i as i32)
                .map(|g| (g.color, g.status))
                .unwrap_or((DEFAULT_GATE_COLOR, GateStatus::Unknown));
            store.write_marshalled(&keys::gate_color(i), CellValue::Int(color as i32));
            store.write_marshalled(&keys::gate_status(i), CellValue::Text(status.to_string()));
        }
        // Indices past the reported gate count fall back to defaults.
        for i in shown..MAX_GATES {
            store.write_marshalled(&keys::gate_color(i), CellValue::Int(DEFAULT_GATE_COLOR as i32));
            store.write_marshalled(&keys::gate_status(i), CellValue::Text("Unknown".to_string()));
        }
        self.bump_version();
    }

    fn bump_version(&self) {
        let mut version = self.version.lock();
        *version = version.wrapping_add(1);
        self.store
            .write_marshalled(keys::AMS_GATES_VERSION, CellValue::Int(*version));
    }
}

/// Global AMS bridge instance, bound to the global state store
pub fn ams_bridge() -> &'static AmsBridge {
    static BRIDGE: OnceLock<AmsBridge> = OnceLock::new();
    BRIDGE.get_or_init(|| {
        let bridge = AmsBridge::new(helix_core::state_store());
        bridge.init_cells();
        bridge
    })
}
