//! AFC (Automated Filament Changer) backend.
//!
//! AFC organizes filament into named lanes grouped by unit; we present
//! lanes as gates with global indices assigned in discovery order. The
//! host's `AFC` status object carries a `system` block plus one object
//! per unit whose members are the lanes.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use helix_core::error::{AmsError, Result};
use helix_core::AmsType;

use crate::backend::{AmsBackend, EventCallback, MacroSink};
use crate::types::{
    parse_gate_color, AmsAction, AmsEvent, AmsSystemInfo, AmsUnit, GateInfo, GateStatus,
};

pub struct AfcBackend {
    sink: Arc<dyn MacroSink>,
    info: Mutex<AmsSystemInfo>,
    /// Lane name per global gate index, in unit order
    lane_names: Mutex<Vec<String>>,
    callback: Mutex<Option<EventCallback>>,
}

impl AfcBackend {
    pub fn new(sink: Arc<dyn MacroSink>) -> Self {
        let mut info = AmsSystemInfo::default();
        info.ams_type = AmsType::Afc;
        info.current_tool = -1;
        info.current_gate = -1;
        info.supports_spool_database = true;
        info.supports_tool_mapping = false;
        Self {
            sink,
            info: Mutex::new(info),
            lane_names: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
        }
    }

    fn emit(&self, event: AmsEvent, data: &str) {
        let cb = self.callback.lock().clone();
        if let Some(cb) = cb {
            cb(event, data);
        }
    }

    fn lane_name(&self, gate: i32) -> Result<String> {
        let names = self.lane_names.lock();
        names.get(gate as usize).cloned().ok_or_else(|| {
            AmsError::InvalidGate {
                index: gate,
                max: names.len() as i32 - 1,
            }
            .into()
        })
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

    /// Convert one lane object into a gate
    fn lane_to_gate(local: i32, global: i32, lane: &Value) -> GateInfo {
        let mut gate = GateInfo::empty(global);
        gate.index = local;
        let prepped = lane.get("prep").and_then(Value::as_bool).unwrap_or(false);
        let loaded = lane
            .get("tool_loaded")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        gate.status = if loaded {
            GateStatus::Loaded
        } else if prepped {
            GateStatus::Available
        } else {
            GateStatus::Empty
        };
        if let Some(c) = lane.get("color").and_then(Value::as_str) {
            gate.color = parse_gate_color(c);
        }
        if let Some(m) = lane.get("material").and_then(Value::as_str) {
            gate.material = m.to_string();
        }
        if let Some(id) = lane.get("spool_id").and_then(Value::as_i64) {
            if id > 0 {
                gate.spool_id = Some(id as i32);
            }
        }
        if let Some(w) = lane.get("weight").and_then(Value::as_f64) {
            gate.remaining_weight = w as f32;
        }
        gate.tool = lane
            .get("map")
            .and_then(Value::as_str)
            .and_then(|t| t.trim_start_matches('T').parse().ok())
            .unwrap_or(global);
        gate
    }

    fn rebuild(&self, afc: &Value) -> bool {
        let Some(obj) = afc.as_object() else {
            return false;
        };

        let mut units = Vec::new();
        let mut names = Vec::new();
        let mut global = 0i32;
        for (unit_name, unit_val) in obj {
            if unit_name == "system" {
                continue;
            }
            let Some(lanes) = unit_val.as_object() else {
                continue;
            };
            let first_gate = global;
            let mut gates = Vec::new();
            for (lane_name, lane_val) in lanes {
                if !lane_val.is_object() || lane_val.get("prep").is_none() {
                    continue;
                }
                gates.push(Self::lane_to_gate(gates.len() as i32, global, lane_val));
                names.push(lane_name.clone());
                global += 1;
            }
            if gates.is_empty() {
                continue;
            }
            units.push(AmsUnit {
                unit_index: units.len() as i32,
                name: unit_name.clone(),
                gate_count: gates.len() as i32,
                first_gate,
                connected: true,
                firmware_version: String::new(),
                has_encoder: false,
                has_toolhead_sensor: true,
                has_gate_sensors: true,
                gates,
            });
        }

        let mut info = self.info.lock();
        let mut changed = false;

        if let Some(system) = obj.get("system") {
            if let Some(load) = system.get("current_load").and_then(Value::as_str) {
                let gate = names.iter().position(|n| n == load).map(|i| i as i32);
                let gate = gate.unwrap_or(-1);
                let loaded = gate >= 0;
                if info.current_gate != gate || info.filament_loaded != loaded {
                    info.current_gate = gate;
                    info.filament_loaded = loaded;
                    changed = true;
                }
            }
            let changing = system
                .get("tool_change")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let action = if changing {
                AmsAction::Selecting
            } else {
                AmsAction::Idle
            };
            if info.action != action {
                info.action = action;
                changed = true;
            }
        }

        if info.units != units {
            info.total_gates = global;
            info.units = units;
            changed = true;
        }
        if info.filament_loaded {
            let current = info.current_gate;
            info.current_tool = info
                .gate(current)
                .map(|g| g.tool)
                .unwrap_or(-1);
        }
        *self.lane_names.lock() = names;
        changed
    }
}

#[async_trait]
impl AmsBackend for AfcBackend {
    fn ams_type(&self) -> AmsType {
        AmsType::Afc
    }

    async fn start(&self) -> Result<()> {
        debug!("Starting AFC backend");
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
        self.check_idle()?;
        let lane = self.lane_name(gate)?;
        {
            let info = self.info.lock();
            if let Some(g) = info.gate(gate) {
                if g.status == GateStatus::Empty {
                    return Err(AmsError::GateNotAvailable { index: gate }.into());
                }
            }
        }
        self.sink.run_macro(&format!("CHANGE_TOOL LANE={lane}")).await
    }

    async fn unload(&self) -> Result<()> {
        self.check_idle()?;
        let gate = self.info.lock().current_gate;
        if gate < 0 {
            return Err(AmsError::WrongState {
                message: "No lane loaded".to_string(),
                suggestion: "Load a lane first".to_string(),
            }
            .into());
        }
        let lane = self.lane_name(gate)?;
        self.sink.run_macro(&format!("TOOL_UNLOAD LANE={lane}")).await
    }

    async fn select_gate(&self, _gate: i32) -> Result<()> {
        // AFC has no selector; lanes engage only on a tool change.
        Err(AmsError::WrongState {
            message: "AFC cannot select without loading".to_string(),
            suggestion: "Use load instead".to_string(),
        }
        .into())
    }

    async fn select_tool(&self, tool: i32) -> Result<()> {
        self.check_idle()?;
        let gate = {
            let info = self.info.lock();
            info.units
                .iter()
                .flat_map(|u| u.gates.iter())
                .find(|g| g.tool == tool)
                .map(|g| g.global_index)
        };
        let Some(gate) = gate else {
            return Err(AmsError::InvalidTool { tool }.into());
        };
        let lane = self.lane_name(gate)?;
        self.sink.run_macro(&format!("CHANGE_TOOL LANE={lane}")).await
    }

    async fn select_bypass(&self) -> Result<()> {
        Err(AmsError::WrongState {
            message: "AFC has no bypass selector".to_string(),
            suggestion: "Feed filament directly".to_string(),
        }
        .into())
    }

    async fn home(&self) -> Result<()> {
        Err(AmsError::WrongState {
            message: "AFC has no selector to home".to_string(),
            suggestion: "Nothing to do".to_string(),
        }
        .into())
    }

    async fn cancel(&self) -> Result<()> {
        self.sink.run_macro("PAUSE").await
    }

    async fn set_gate_info(&self, gate: &GateInfo) -> Result<()> {
        let lane = self.lane_name(gate.global_index)?;
        let mut script = format!(
            "SET_COLOR LANE={lane} COLOR={:06x}\nSET_MATERIAL LANE={lane} MATERIAL={}",
            gate.color,
            if gate.material.is_empty() {
                "unknown"
            } else {
                gate.material.as_str()
            }
        );
        if let Some(id) = gate.spool_id {
            script.push_str(&format!("\nSET_SPOOL_ID LANE={lane} SPOOL_ID={id}"));
        }
        self.sink.run_macro(&script).await?;

        if let Some(stored) = self.info.lock().gate_mut(gate.global_index) {
            stored.material = gate.material.clone();
            stored.color = gate.color;
            stored.color_name = gate.color_name.clone();
            stored.spool_id = gate.spool_id;
        }
        self.emit(AmsEvent::GateChanged, &gate.global_index.to_string());
        Ok(())
    }

    async fn set_tool_mapping(&self, _tool: i32, _gate: i32) -> Result<()> {
        Err(AmsError::WrongState {
            message: "AFC lane mapping is fixed in configuration".to_string(),
            suggestion: "Edit the AFC config on the host".to_string(),
        }
        .into())
    }

    async fn recover(&self) -> Result<()> {
        self.sink.run_macro("AFC_RESUME").await
    }

    fn process_status_update(&self, status: &Value) {
        let Some(afc) = status.get("AFC") else {
            return;
        };
        let was_busy = self.info.lock().action.is_busy();
        if self.rebuild(afc) {
            self.emit(AmsEvent::StateChanged, "");
            let info = self.info.lock().clone();
            if was_busy && !info.action.is_busy() {
                let payload = info.current_gate.to_string();
                if info.filament_loaded {
                    self.emit(AmsEvent::LoadComplete, &payload);
                    self.emit(AmsEvent::ToolChanged, &info.current_tool.to_string());
                } else {
                    self.emit(AmsEvent::UnloadComplete, &payload);
                }
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

    fn status() -> Value {
        json!({
            "AFC": {
                "system": { "current_load": null, "tool_change": false },
                "Turtle_1": {
                    "lane1": { "prep": true, "load": true, "tool_loaded": false,
                               "material": "PLA", "color": "#E53935", "spool_id": 7,
                               "weight": 612.0, "map": "T0" },
                    "lane2": { "prep": false, "load": false, "tool_loaded": false,
                               "material": "", "color": "", "map": "T1" },
                }
            }
        })
    }

    fn backend() -> (Arc<AfcBackend>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink {
            scripts: Mutex::new(Vec::new()),
        });
        let be = Arc::new(AfcBackend::new(sink.clone()));
        be.process_status_update(&status());
        (be, sink)
    }

    #[tokio::test]
    async fn test_lanes_become_gates() {
        let (be, _) = backend();
        let info = be.system_info();
        assert_eq!(info.total_gates, 2);
        assert_eq!(info.units.len(), 1);
        let g0 = info.gate(0).unwrap();
        assert_eq!(g0.status, GateStatus::Available);
        assert_eq!(g0.material, "PLA");
        assert_eq!(g0.color, 0xE53935);
        assert_eq!(g0.spool_id, Some(7));
        assert_eq!(info.gate(1).unwrap().status, GateStatus::Empty);
    }

    #[tokio::test]
    async fn test_load_uses_lane_name() {
        let (be, sink) = backend();
        be.load_gate(0).await.unwrap();
        assert_eq!(sink.scripts.lock()[0], "CHANGE_TOOL LANE=lane1");
    }

    #[tokio::test]
    async fn test_empty_lane_rejected() {
        let (be, _) = backend();
        let err = be.load_gate(1).await.unwrap_err();
        assert_eq!(err.label(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_current_load_derives_gate_and_status() {
        let (be, _) = backend();
        let mut s = status();
        s["AFC"]["system"]["current_load"] = json!("lane1");
        s["AFC"]["Turtle_1"]["lane1"]["tool_loaded"] = json!(true);
        be.process_status_update(&s);
        let info = be.system_info();
        assert_eq!(info.current_gate, 0);
        assert!(info.filament_loaded);
        assert_eq!(info.gate(0).unwrap().status, GateStatus::Loaded);
        assert_eq!(info.current_tool, 0);
    }

    #[tokio::test]
    async fn test_select_gate_unsupported() {
        let (be, _) = backend();
        let err = be.select_gate(0).await.unwrap_err();
        assert_eq!(err.label(), "WRONG_STATE");
    }
}
