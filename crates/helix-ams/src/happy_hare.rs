//! Happy Hare (MMU) backend.
//!
//! Operations map to the `MMU_*` macro surface; state comes from the
//! host's `mmu` status object. Happy Hare reports per-gate arrays
//! (`gate_status`, `gate_color`, `gate_material`, ...) plus scalar
//! `gate`, `tool`, `action` and `filament` fields.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use helix_core::error::{AmsError, Result};
use helix_core::AmsType;

use crate::backend::{AmsBackend, EventCallback, MacroSink};
use crate::types::{
    parse_gate_color, AmsAction, AmsSystemInfo, AmsUnit, GateInfo, GateStatus,
};

/// Happy Hare signals bypass selection by setting `gate` to −2.
const HH_BYPASS_GATE: i64 = -2;

pub struct HappyHareBackend {
    sink: Arc<dyn MacroSink>,
    info: Mutex<AmsSystemInfo>,
    callback: Mutex<Option<EventCallback>>,
}

impl HappyHareBackend {
    pub fn new(sink: Arc<dyn MacroSink>) -> Self {
        let mut info = AmsSystemInfo::default();
        info.ams_type = AmsType::HappyHare;
        info.current_tool = -1;
        info.current_gate = -1;
        info.supports_endless_spool = true;
        info.supports_spool_database = true;
        info.supports_tool_mapping = true;
        info.supports_bypass = true;
        Self {
            sink,
            info: Mutex::new(info),
            callback: Mutex::new(None),
        }
    }

    fn emit(&self, event: crate::types::AmsEvent, data: &str) {
        let cb = self.callback.lock().clone();
        if let Some(cb) = cb {
            cb(event, data);
        }
    }

    fn check_gate(&self, gate: i32) -> Result<()> {
        let info = self.info.lock();
        if gate < 0 || gate >= info.total_gates {
            return Err(AmsError::InvalidGate {
                index: gate,
                max: info.total_gates - 1,
            }
            .into());
        }
        Ok(())
    }

    fn check_idle(&self) -> Result<()> {
        let info = self.info.lock();
        if info.action.is_busy() {
            return Err(AmsError::Busy {
                action: info.action.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Rebuild the unit and gate list from Happy Hare's parallel arrays
    fn apply_mmu_object(&self, mmu: &Value) -> bool {
        let mut info = self.info.lock();
        let mut changed = false;

        if let Some(n) = mmu.get("num_gates").and_then(Value::as_i64) {
            let n = n as i32;
            if n != info.total_gates {
                info.total_gates = n;
                info.units = vec![AmsUnit {
                    unit_index: 0,
                    name: "MMU".to_string(),
                    gate_count: n,
                    first_gate: 0,
                    connected: true,
                    firmware_version: info.version.clone(),
                    has_encoder: true,
                    has_toolhead_sensor: true,
                    has_gate_sensors: false,
                    gates: (0..n).map(GateInfo::empty).collect(),
                }];
                changed = true;
            }
        }

        if let Some(g) = mmu.get("gate").and_then(Value::as_i64) {
            let bypass = g == HH_BYPASS_GATE;
            let gate = if bypass { -1 } else { g as i32 };
            if info.bypass_active != bypass || info.current_gate != gate {
                info.bypass_active = bypass;
                info.current_gate = gate;
                changed = true;
            }
        }
        if let Some(t) = mmu.get("tool").and_then(Value::as_i64) {
            let tool = if (t as i32) < 0 { -1 } else { t as i32 };
            if info.current_tool != tool {
                info.current_tool = tool;
                changed = true;
            }
        }
        if let Some(a) = mmu.get("action").and_then(Value::as_str) {
            let action = AmsAction::from_host_str(a);
            if info.action != action {
                info.action = action;
                info.operation_detail = a.to_string();
                changed = true;
            }
        }
        if let Some(f) = mmu.get("filament").and_then(Value::as_str) {
            let loaded = f.eq_ignore_ascii_case("loaded");
            if info.filament_loaded != loaded {
                info.filament_loaded = loaded;
                changed = true;
            }
        }

        if let Some(statuses) = mmu.get("gate_status").and_then(Value::as_array) {
            let current = info.current_gate;
            let loaded = info.filament_loaded;
            for (i, raw) in statuses.iter().enumerate() {
                let raw = raw.as_i64().unwrap_or(-1);
                let mut status = GateStatus::from_happy_hare(raw);
                // Loaded is derived, Happy Hare never reports it in the array
                if loaded && current == i as i32 {
                    status = GateStatus::Loaded;
                }
                if let Some(gate) = info.gate_mut(i as i32) {
                    if gate.status != status {
                        gate.status = status;
                        changed = true;
                    }
                }
            }
        }
        if let Some(colors) = mmu.get("gate_color").and_then(Value::as_array) {
            for (i, c) in colors.iter().enumerate() {
                let color = parse_gate_color(c.as_str().unwrap_or(""));
                if let Some(gate) = info.gate_mut(i as i32) {
                    if gate.color != color {
                        gate.color = color;
                        gate.color_name = c.as_str().unwrap_or("").to_string();
                        changed = true;
                    }
                }
            }
        }
        if let Some(materials) = mmu.get("gate_material").and_then(Value::as_array) {
            for (i, m) in materials.iter().enumerate() {
                let material = m.as_str().unwrap_or("").to_string();
                if let Some(gate) = info.gate_mut(i as i32) {
                    if gate.material != material {
                        gate.material = material;
                        changed = true;
                    }
                }
            }
        }
        if let Some(spools) = mmu.get("gate_spool_id").and_then(Value::as_array) {
            for (i, s) in spools.iter().enumerate() {
                let id = s.as_i64().filter(|v| *v >= 0).map(|v| v as i32);
                if let Some(gate) = info.gate_mut(i as i32) {
                    if gate.spool_id != id {
                        gate.spool_id = id;
                        changed = true;
                    }
                }
            }
        }
        if let Some(ttg) = mmu.get("ttg_map").and_then(Value::as_array) {
            let map: Vec<i32> = ttg
                .iter()
                .map(|v| v.as_i64().unwrap_or(-1) as i32)
                .collect();
            if info.tool_to_gate != map {
                for (tool, gate_idx) in map.iter().enumerate() {
                    if let Some(gate) = info.gate_mut(*gate_idx) {
                        gate.tool = tool as i32;
                    }
                }
                info.tool_to_gate = map;
                changed = true;
            }
        }

        changed
    }
}

#[async_trait]
impl AmsBackend for HappyHareBackend {
    fn ams_type(&self) -> AmsType {
        AmsType::HappyHare
    }

    async fn start(&self) -> Result<()> {
        debug!("Starting Happy Hare backend");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.callback.lock() = None;
        Ok(())
    }

    fn system_info(&self) -> AmsSystemInfo {
        self.info.lock().clone()
    }

    async fn load_gate(&self, gate: i32) -> Result<()> {
        self.check_gate(gate)?;
        self.check_idle()?;
        {
            let info = self.info.lock();
            if let Some(g) = info.gate(gate) {
                if !g.status.is_usable() && g.status != GateStatus::Unknown {
                    return Err(AmsError::GateNotAvailable { index: gate }.into());
                }
            }
        }
        self.sink
            .run_macro(&format!("MMU_SELECT GATE={gate}\nMMU_LOAD"))
            .await
    }

    async fn unload(&self) -> Result<()> {
        self.check_idle()?;
        if !self.info.lock().filament_loaded {
            return Err(AmsError::WrongState {
                message: "No filament loaded".to_string(),
                suggestion: "Load a gate first".to_string(),
            }
            .into());
        }
        self.sink.run_macro("MMU_UNLOAD").await
    }

    async fn select_gate(&self, gate: i32) -> Result<()> {
        self.check_gate(gate)?;
        self.check_idle()?;
        self.sink.run_macro(&format!("MMU_SELECT GATE={gate}")).await
    }

    async fn select_tool(&self, tool: i32) -> Result<()> {
        let max_tool = self.info.lock().total_gates;
        if tool < 0 || tool >= max_tool {
            return Err(AmsError::InvalidTool { tool }.into());
        }
        self.check_idle()?;
        self.sink.run_macro(&format!("T{tool}")).await
    }

    async fn select_bypass(&self) -> Result<()> {
        self.check_idle()?;
        if !self.info.lock().supports_bypass {
            return Err(AmsError::WrongState {
                message: "Bypass not configured".to_string(),
                suggestion: "Enable the bypass selector in Happy Hare".to_string(),
            }
            .into());
        }
        self.sink.run_macro("MMU_SELECT_BYPASS").await
    }

    async fn home(&self) -> Result<()> {
        self.check_idle()?;
        self.sink.run_macro("MMU_HOME").await
    }

    async fn cancel(&self) -> Result<()> {
        // MMU_PAUSE halts the current operation and enters the paused
        // state, from which recover() resumes.
        self.sink.run_macro("MMU_PAUSE").await
    }

    async fn set_gate_info(&self, gate: &GateInfo) -> Result<()> {
        self.check_gate(gate.global_index)?;
        let mut script = format!(
            "MMU_GATE_MAP GATE={} MATERIAL={} COLOR={:06x}",
            gate.global_index,
            if gate.material.is_empty() {
                "unknown"
            } else {
                gate.material.as_str()
            },
            gate.color
        );
        if let Some(id) = gate.spool_id {
            script.push_str(&format!(" SPOOLID={id}"));
        }
        self.sink.run_macro(&script).await?;

        // Happy Hare persists material, color and spool id only.
        if let Some(stored) = self.info.lock().gate_mut(gate.global_index) {
            stored.material = gate.material.clone();
            stored.color = gate.color;
            stored.color_name = gate.color_name.clone();
            stored.spool_id = gate.spool_id;
        }
        self.emit(
            crate::types::AmsEvent::GateChanged,
            &gate.global_index.to_string(),
        );
        Ok(())
    }

    async fn set_tool_mapping(&self, tool: i32, gate: i32) -> Result<()> {
        self.check_gate(gate)?;
        if tool < 0 {
            return Err(AmsError::InvalidTool { tool }.into());
        }
        self.sink
            .run_macro(&format!("MMU_TTG_MAP TOOL={tool} GATE={gate}"))
            .await
    }

    async fn recover(&self) -> Result<()> {
        self.sink.run_macro("MMU_RECOVER").await
    }

    fn process_status_update(&self, status: &Value) {
        let Some(mmu) = status.get("mmu") else {
            return;
        };
        if !mmu.is_object() {
            warn!("Ignoring non-object mmu status");
            return;
        }
        let was_busy = self.info.lock().action.is_busy();
        if self.apply_mmu_object(mmu) {
            let info = self.info.lock().clone();
            self.emit(crate::types::AmsEvent::StateChanged, "");
            if was_busy && !info.action.is_busy() {
                let payload = info.current_gate.to_string();
                if info.filament_loaded {
                    self.emit(crate::types::AmsEvent::LoadComplete, &payload);
                } else {
                    self.emit(crate::types::AmsEvent::UnloadComplete, &payload);
                }
            }
            if info.action == AmsAction::Paused {
                self.emit(crate::types::AmsEvent::Attention, &info.operation_detail);
            }
        }
    }

    fn set_event_callback(&self, callback: EventCallback) {
        *self.callback.lock() = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AmsEvent;
    use serde_json::json;

    struct RecordingSink {
        scripts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MacroSink for RecordingSink {
        async fn run_macro(&self, script: &str) -> Result<()> {
            self.scripts.lock().push(script.to_string());
            Ok(())
        }
    }

    fn backend() -> (Arc<HappyHareBackend>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink {
            scripts: Mutex::new(Vec::new()),
        });
        let be = Arc::new(HappyHareBackend::new(sink.clone()));
        be.process_status_update(&json!({
            "mmu": {
                "num_gates": 4,
                "gate": -1,
                "tool": -1,
                "action": "Idle",
                "filament": "Unloaded",
                "gate_status": [1, 1, 0, 2],
            }
        }));
        (be, sink)
    }

    #[tokio::test]
    async fn test_gate_status_mapping() {
        let (be, _) = backend();
        let info = be.system_info();
        assert_eq!(info.total_gates, 4);
        assert_eq!(info.gate(0).unwrap().status, GateStatus::Available);
        assert_eq!(info.gate(2).unwrap().status, GateStatus::Empty);
        assert_eq!(info.gate(3).unwrap().status, GateStatus::FromBuffer);
    }

    #[tokio::test]
    async fn test_loaded_derived_from_current_gate() {
        let (be, _) = backend();
        be.process_status_update(&json!({
            "mmu": {
                "gate": 1,
                "filament": "Loaded",
                "gate_status": [1, 1, 0, 2],
            }
        }));
        let info = be.system_info();
        assert!(info.filament_loaded);
        assert_eq!(info.gate(1).unwrap().status, GateStatus::Loaded);
        assert_eq!(info.gate(0).unwrap().status, GateStatus::Available);
    }

    #[tokio::test]
    async fn test_bypass_gate_maps_to_flag() {
        let (be, _) = backend();
        be.process_status_update(&json!({ "mmu": { "gate": -2 } }));
        let info = be.system_info();
        assert!(info.bypass_active);
        assert_eq!(info.current_gate, -1);
    }

    #[tokio::test]
    async fn test_load_issues_select_and_load() {
        let (be, sink) = backend();
        be.load_gate(1).await.unwrap();
        assert_eq!(sink.scripts.lock()[0], "MMU_SELECT GATE=1\nMMU_LOAD");
    }

    #[tokio::test]
    async fn test_load_rejects_out_of_range() {
        let (be, _) = backend();
        let err = be.load_gate(9).await.unwrap_err();
        assert_eq!(err.label(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_unload_requires_loaded_filament() {
        let (be, _) = backend();
        let err = be.unload().await.unwrap_err();
        assert_eq!(err.label(), "WRONG_STATE");
    }

    #[tokio::test]
    async fn test_busy_rejection() {
        let (be, _) = backend();
        be.process_status_update(&json!({ "mmu": { "action": "Loading" } }));
        let err = be.select_gate(0).await.unwrap_err();
        assert_eq!(err.label(), "BUSY");
    }

    #[tokio::test]
    async fn test_completion_event_after_busy_to_idle() {
        let (be, _) = backend();
        let events: Arc<Mutex<Vec<(AmsEvent, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        be.set_event_callback(Arc::new(move |ev, data| {
            captured.lock().push((ev, data.to_string()));
        }));

        be.process_status_update(&json!({ "mmu": { "action": "Loading" } }));
        be.process_status_update(&json!({
            "mmu": { "action": "Idle", "gate": 2, "filament": "Loaded" }
        }));

        let events = events.lock();
        assert!(events
            .iter()
            .any(|(ev, data)| *ev == AmsEvent::LoadComplete && data == "2"));
    }
}
