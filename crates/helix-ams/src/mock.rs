//! Mock AMS backend for development and tests.
//!
//! Maintains a fully internal state machine styled after a Happy Hare
//! unit. Operations set the action, emit `StateChanged`, then a spawned
//! worker finishes the operation after a configurable delay: it updates
//! the snapshot, emits the completion event, and emits a final
//! `StateChanged`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::sleep;
use tracing::debug;

use helix_core::error::{AmsError, Result};
use helix_core::AmsType;

use crate::backend::{AmsBackend, EventCallback};
use crate::types::{AmsAction, AmsEvent, AmsSystemInfo, AmsUnit, GateInfo, GateStatus};

/// Sample filaments cycled across mock gates
const SAMPLE_FILAMENTS: &[(u32, &str, &str, &str)] = &[
    (0xE53935, "Red", "PLA", "Polymaker"),
    (0x1E88E5, "Blue", "PETG", "eSUN"),
    (0x43A047, "Green", "PLA", "Bambu"),
    (0xFDD835, "Yellow", "ABS", "Polymaker"),
    (0x8E24AA, "Purple", "PLA", "Hatchbox"),
    (0xFF6F00, "Orange", "PETG", "Overture"),
    (0xFFFFFF, "White", "PLA", "eSUN"),
    (0x212121, "Black", "PLA", "Bambu"),
];

pub struct MockAmsBackend {
    info: Arc<Mutex<AmsSystemInfo>>,
    delay: Mutex<Duration>,
    callback: Arc<Mutex<Option<EventCallback>>>,
    /// Bumped by cancel() so in-flight workers drop their completion
    epoch: Arc<AtomicU64>,
}

impl MockAmsBackend {
    pub fn new(gate_count: i32) -> Self {
        let gate_count = gate_count.clamp(1, 16);

        let gates: Vec<GateInfo> = (0..gate_count)
            .map(|i| {
                let (color, color_name, material, brand) =
                    SAMPLE_FILAMENTS[i as usize % SAMPLE_FILAMENTS.len()];
                let (temp_min, temp_max) = match material {
                    "PETG" => (230, 250),
                    "ABS" => (240, 260),
                    _ => (190, 220),
                };
                GateInfo {
                    index: i,
                    global_index: i,
                    status: GateStatus::Available,
                    color,
                    color_name: color_name.to_string(),
                    material: material.to_string(),
                    brand: brand.to_string(),
                    temp_min,
                    temp_max,
                    tool: i,
                    spool_id: Some(1000 + i),
                    remaining_weight: (750.0 - i as f32 * 100.0).max(100.0),
                    total_weight: 1000.0,
                    endless_spool_group: -1,
                }
            })
            .collect();

        let info = AmsSystemInfo {
            ams_type: AmsType::HappyHare,
            version: "2.7.0-mock".to_string(),
            current_tool: -1,
            current_gate: -1,
            bypass_active: false,
            filament_loaded: false,
            action: AmsAction::Idle,
            operation_detail: String::new(),
            units: vec![AmsUnit {
                unit_index: 0,
                name: "Mock MMU".to_string(),
                gate_count,
                first_gate: 0,
                connected: true,
                firmware_version: "mock-1.0".to_string(),
                has_encoder: true,
                has_toolhead_sensor: true,
                has_gate_sensors: true,
                gates,
            }],
            total_gates: gate_count,
            supports_endless_spool: true,
            supports_spool_database: true,
            supports_tool_mapping: true,
            supports_bypass: true,
            tool_to_gate: (0..gate_count).collect(),
        };

        Self {
            info: Arc::new(Mutex::new(info)),
            delay: Mutex::new(Duration::from_millis(500)),
            callback: Arc::new(Mutex::new(None)),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Change how long mock operations take
    pub fn set_operation_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    fn emit(callback: &Mutex<Option<EventCallback>>, event: AmsEvent, data: &str) {
        let cb = callback.lock().clone();
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

    fn begin(&self, action: AmsAction, detail: &str) -> Result<()> {
        let mut info = self.info.lock();
        if info.action.is_busy() {
            return Err(AmsError::Busy {
                action: info.action.to_string(),
            }
            .into());
        }
        info.action = action;
        info.operation_detail = detail.to_string();
        drop(info);
        Self::emit(&self.callback, AmsEvent::StateChanged, "");
        Ok(())
    }

    /// Run `finish` after the operation delay, then emit the completion
    /// event followed by a final StateChanged.
    fn schedule_completion<F>(&self, complete: AmsEvent, payload: String, finish: F)
    where
        F: FnOnce(&mut AmsSystemInfo) + Send + 'static,
    {
        let info = self.info.clone();
        let callback = self.callback.clone();
        let delay = *self.delay.lock();
        let epoch = self.epoch.clone();
        let started_at = epoch.load(Ordering::SeqCst);
        tokio::spawn(async move {
            sleep(delay).await;
            if epoch.load(Ordering::SeqCst) != started_at {
                return;
            }
            {
                let mut info = info.lock();
                finish(&mut info);
                info.action = AmsAction::Idle;
                info.operation_detail.clear();
            }
            Self::emit(&callback, complete, &payload);
            Self::emit(&callback, AmsEvent::StateChanged, "");
        });
    }
}

#[async_trait]
impl AmsBackend for MockAmsBackend {
    fn ams_type(&self) -> AmsType {
        self.info.lock().ams_type
    }

    async fn start(&self) -> Result<()> {
        debug!("Starting mock AMS backend");
        Self::emit(&self.callback, AmsEvent::StateChanged, "");
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
        {
            let info = self.info.lock();
            let status = info.gate(gate).map(|g| g.status).unwrap_or_default();
            if !status.is_usable() {
                return Err(AmsError::GateNotAvailable { index: gate }.into());
            }
        }
        self.begin(AmsAction::Loading, &format!("Loading gate {gate}"))?;
        self.schedule_completion(AmsEvent::LoadComplete, gate.to_string(), move |info| {
            info.filament_loaded = true;
            info.current_gate = gate;
            info.bypass_active = false;
            let tool = info.gate(gate).map(|g| g.tool).unwrap_or(-1);
            info.current_tool = tool;
            if let Some(g) = info.gate_mut(gate) {
                g.status = GateStatus::Loaded;
            }
        });
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        {
            let info = self.info.lock();
            if !info.filament_loaded {
                return Err(AmsError::WrongState {
                    message: "No filament loaded".to_string(),
                    suggestion: "Load a gate first".to_string(),
                }
                .into());
            }
        }
        self.begin(AmsAction::Unloading, "Unloading")?;
        self.schedule_completion(AmsEvent::UnloadComplete, String::new(), |info| {
            let gate = info.current_gate;
            info.filament_loaded = false;
            if let Some(g) = info.gate_mut(gate) {
                g.status = GateStatus::Available;
            }
        });
        Ok(())
    }

    async fn select_gate(&self, gate: i32) -> Result<()> {
        self.check_gate(gate)?;
        self.begin(AmsAction::Selecting, &format!("Selecting gate {gate}"))?;
        self.schedule_completion(AmsEvent::StateChanged, String::new(), move |info| {
            info.current_gate = gate;
            info.bypass_active = false;
        });
        Ok(())
    }

    async fn select_tool(&self, tool: i32) -> Result<()> {
        let gate = {
            let info = self.info.lock();
            info.tool_to_gate.get(tool.max(0) as usize).copied()
        };
        let Some(gate) = gate else {
            return Err(AmsError::InvalidTool { tool }.into());
        };
        self.begin(AmsAction::Selecting, &format!("Tool change T{tool}"))?;
        self.schedule_completion(AmsEvent::ToolChanged, tool.to_string(), move |info| {
            let previous = info.current_gate;
            if let Some(g) = info.gate_mut(previous) {
                if g.status == GateStatus::Loaded {
                    g.status = GateStatus::Available;
                }
            }
            info.current_tool = tool;
            info.current_gate = gate;
            info.filament_loaded = true;
            info.bypass_active = false;
            if let Some(g) = info.gate_mut(gate) {
                g.status = GateStatus::Loaded;
            }
        });
        Ok(())
    }

    async fn select_bypass(&self) -> Result<()> {
        self.begin(AmsAction::Selecting, "Selecting bypass")?;
        self.schedule_completion(AmsEvent::StateChanged, String::new(), |info| {
            info.bypass_active = true;
            info.current_gate = -1;
        });
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        self.begin(AmsAction::Homing, "Homing selector")?;
        self.schedule_completion(AmsEvent::StateChanged, String::new(), |_| {});
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        let mut info = self.info.lock();
        if !info.action.is_busy() {
            return Ok(());
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        info.action = AmsAction::Paused;
        info.operation_detail = "Cancelled by user".to_string();
        drop(info);
        Self::emit(&self.callback, AmsEvent::StateChanged, "");
        Ok(())
    }

    async fn set_gate_info(&self, gate: &GateInfo) -> Result<()> {
        self.check_gate(gate.global_index)?;
        {
            let mut info = self.info.lock();
            if let Some(stored) = info.gate_mut(gate.global_index) {
                let keep_status = stored.status;
                *stored = gate.clone();
                stored.status = keep_status;
            }
        }
        Self::emit(
            &self.callback,
            AmsEvent::GateChanged,
            &gate.global_index.to_string(),
        );
        Ok(())
    }

    async fn set_tool_mapping(&self, tool: i32, gate: i32) -> Result<()> {
        self.check_gate(gate)?;
        {
            let mut info = self.info.lock();
            if tool < 0 || tool as usize >= info.tool_to_gate.len() {
                return Err(AmsError::InvalidTool { tool }.into());
            }
            info.tool_to_gate[tool as usize] = gate;
            if let Some(g) = info.gate_mut(gate) {
                g.tool = tool;
            }
        }
        Self::emit(&self.callback, AmsEvent::StateChanged, "");
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        let mut info = self.info.lock();
        info.action = AmsAction::Idle;
        info.operation_detail.clear();
        drop(info);
        Self::emit(&self.callback, AmsEvent::StateChanged, "");
        Ok(())
    }

    fn process_status_update(&self, _status: &Value) {
        // The mock has no host; status traffic is ignored.
    }

    fn set_event_callback(&self, callback: EventCallback) {
        *self.callback.lock() = Some(callback);
    }
}
