//! Data structures for multi-material (AMS) support.
//!
//! Common types for both Happy Hare and AFC systems. Backends translate
//! from their host-specific APIs into these; nothing here is
//! backend-specific except the documented conversion helpers.

use serde::{Deserialize, Serialize};

pub use helix_core::AmsType;

/// Default color for gates without filament info (medium gray)
pub const DEFAULT_GATE_COLOR: u32 = 0x80_80_80;

/// Upper bound on per-gate reactive cells
pub const MAX_GATES: usize = 16;

/// Gate / lane status
///
/// Internal representation; use [`GateStatus::from_happy_hare`] to
/// translate the host's raw integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GateStatus {
    /// Status not known
    #[default]
    Unknown,
    /// No filament in gate
    Empty,
    /// Filament available, not loaded
    Available,
    /// Filament loaded to the extruder
    Loaded,
    /// Filament available from buffer
    FromBuffer,
    /// Gate blocked or jammed
    Blocked,
}

impl GateStatus {
    /// Convert Happy Hare's `gate_status` integer
    ///
    /// Happy Hare uses −1 = unknown, 0 = empty, 1 = available,
    /// 2 = from buffer. "Loaded" is derived from `current_gate`
    /// equality, never from the raw status.
    pub fn from_happy_hare(raw: i64) -> Self {
        match raw {
            0 => GateStatus::Empty,
            1 => GateStatus::Available,
            2 => GateStatus::FromBuffer,
            _ => GateStatus::Unknown,
        }
    }

    /// Whether filament can be loaded from this gate
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            GateStatus::Available | GateStatus::FromBuffer | GateStatus::Loaded
        )
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GateStatus::Unknown => "Unknown",
            GateStatus::Empty => "Empty",
            GateStatus::Available => "Available",
            GateStatus::Loaded => "Loaded",
            GateStatus::FromBuffer => "From Buffer",
            GateStatus::Blocked => "Blocked",
        };
        write!(f, "{s}")
    }
}

/// Current AMS action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AmsAction {
    /// No operation in progress
    #[default]
    Idle,
    /// Loading filament to the extruder
    Loading,
    /// Unloading filament from the extruder
    Unloading,
    /// Selecting tool or gate
    Selecting,
    /// Homing the selector
    Homing,
    /// Forming the filament tip
    FormingTip,
    /// Heating for an operation
    Heating,
    /// Checking gates
    Checking,
    /// Paused, requires attention
    Paused,
    /// Error state
    Error,
}

impl AmsAction {
    /// Parse a Happy Hare action string
    pub fn from_host_str(s: &str) -> Self {
        match s {
            "Idle" => AmsAction::Idle,
            "Loading" => AmsAction::Loading,
            "Unloading" => AmsAction::Unloading,
            "Selecting" => AmsAction::Selecting,
            "Homing" => AmsAction::Homing,
            "Forming Tip" => AmsAction::FormingTip,
            "Heating" => AmsAction::Heating,
            "Checking" => AmsAction::Checking,
            _ if s.contains("Pause") => AmsAction::Paused,
            _ if s.contains("Error") => AmsAction::Error,
            _ => AmsAction::Idle,
        }
    }

    /// Whether an operation is in flight
    pub fn is_busy(&self) -> bool {
        !matches!(self, AmsAction::Idle | AmsAction::Paused | AmsAction::Error)
    }
}

impl std::fmt::Display for AmsAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AmsAction::Idle => "Idle",
            AmsAction::Loading => "Loading",
            AmsAction::Unloading => "Unloading",
            AmsAction::Selecting => "Selecting",
            AmsAction::Homing => "Homing",
            AmsAction::FormingTip => "Forming Tip",
            AmsAction::Heating => "Heating",
            AmsAction::Checking => "Checking",
            AmsAction::Paused => "Paused",
            AmsAction::Error => "Error",
        };
        write!(f, "{s}")
    }
}

/// Filament metadata and status for one gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateInfo {
    /// Gate index local to its unit
    pub index: i32,
    /// Gate index across all units
    pub global_index: i32,
    /// Current status
    pub status: GateStatus,
    /// Filament color, 0xRRGGBB
    pub color: u32,
    /// Color name, empty when unknown
    pub color_name: String,
    /// Material, e.g. "PLA"
    pub material: String,
    /// Brand, empty when unknown
    pub brand: String,
    /// Recommended minimum nozzle temperature, °C
    pub temp_min: i32,
    /// Recommended maximum nozzle temperature, °C
    pub temp_max: i32,
    /// Tool mapped to this gate, −1 when unmapped
    pub tool: i32,
    /// External spool database id, `None` when not linked
    pub spool_id: Option<i32>,
    /// Remaining filament weight in grams, negative when unknown
    pub remaining_weight: f32,
    /// Total spool weight in grams, negative when unknown
    pub total_weight: f32,
    /// Endless-spool group, −1 when not grouped
    pub endless_spool_group: i32,
}

impl GateInfo {
    /// An unknown gate with default color
    pub fn empty(global_index: i32) -> Self {
        Self {
            index: global_index,
            global_index,
            status: GateStatus::Unknown,
            color: DEFAULT_GATE_COLOR,
            color_name: String::new(),
            material: String::new(),
            brand: String::new(),
            temp_min: 0,
            temp_max: 0,
            tool: -1,
            spool_id: None,
            remaining_weight: -1.0,
            total_weight: -1.0,
            endless_spool_group: -1,
        }
    }
}

/// One physical AMS unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmsUnit {
    /// Unit index
    pub unit_index: i32,
    /// Display name
    pub name: String,
    /// Gates on this unit
    pub gate_count: i32,
    /// Global index of this unit's first gate
    pub first_gate: i32,
    /// Whether the unit is connected
    pub connected: bool,
    /// Firmware version string, empty when unknown
    pub firmware_version: String,
    /// Filament motion encoder present
    pub has_encoder: bool,
    /// Toolhead sensor present
    pub has_toolhead_sensor: bool,
    /// Per-gate sensors present
    pub has_gate_sensors: bool,
    /// Gate details, ordered by local index
    pub gates: Vec<GateInfo>,
}

/// Complete AMS system snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmsSystemInfo {
    /// Which backend family produced this snapshot
    pub ams_type: AmsType,
    /// Backend software version, empty when unknown
    pub version: String,
    /// Currently selected tool, −1 when none
    pub current_tool: i32,
    /// Currently selected gate, −1 when none
    pub current_gate: i32,
    /// Whether the external bypass is selected
    pub bypass_active: bool,
    /// Whether filament is loaded to the extruder
    pub filament_loaded: bool,
    /// Current action
    pub action: AmsAction,
    /// Free-form operation detail for the UI
    pub operation_detail: String,
    /// Units, ordered by unit index
    pub units: Vec<AmsUnit>,
    /// Total gates across units
    pub total_gates: i32,
    /// Endless spool supported
    pub supports_endless_spool: bool,
    /// Spool database supported
    pub supports_spool_database: bool,
    /// Tool-to-gate mapping supported
    pub supports_tool_mapping: bool,
    /// Bypass supported
    pub supports_bypass: bool,
    /// Tool → gate map, indexed by tool
    pub tool_to_gate: Vec<i32>,
}

impl AmsSystemInfo {
    /// Look up a gate by global index
    pub fn gate(&self, global_index: i32) -> Option<&GateInfo> {
        self.units
            .iter()
            .flat_map(|u| u.gates.iter())
            .find(|g| g.global_index == global_index)
    }

    /// Mutable gate lookup by global index
    pub fn gate_mut(&mut self, global_index: i32) -> Option<&mut GateInfo> {
        self.units
            .iter_mut()
            .flat_map(|u| u.gates.iter_mut())
            .find(|g| g.global_index == global_index)
    }
}

/// Events emitted by AMS backends
///
/// Payloads are UTF-8 strings; `GateChanged` carries the decimal global
/// gate index, the rest carry diagnostic text or are empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmsEvent {
    /// System state updated
    StateChanged,
    /// A single gate's info updated
    GateChanged,
    /// Load operation finished
    LoadComplete,
    /// Unload operation finished
    UnloadComplete,
    /// Tool change completed
    ToolChanged,
    /// An error occurred
    Error,
    /// Operator attention required
    Attention,
}

impl AmsEvent {
    /// Wire name of this event
    pub fn name(&self) -> &'static str {
        match self {
            AmsEvent::StateChanged => "STATE_CHANGED",
            AmsEvent::GateChanged => "GATE_CHANGED",
            AmsEvent::LoadComplete => "LOAD_COMPLETE",
            AmsEvent::UnloadComplete => "UNLOAD_COMPLETE",
            AmsEvent::ToolChanged => "TOOL_CHANGED",
            AmsEvent::Error => "ERROR",
            AmsEvent::Attention => "ATTENTION",
        }
    }
}

/// Parse a `#RRGGBB`-ish color string into 0xRRGGBB
///
/// Accepts an optional leading `#` and an ignored alpha suffix; empty or
/// malformed values fall back to the default gray.
pub fn parse_gate_color(s: &str) -> u32 {
    let hex = s.trim().trim_start_matches('#');
    // Byte 6 may not be a char boundary on garbage input.
    let hex = hex.get(..6).unwrap_or(hex);
    u32::from_str_radix(hex, 16).unwrap_or(DEFAULT_GATE_COLOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_status_from_happy_hare() {
        assert_eq!(GateStatus::from_happy_hare(-1), GateStatus::Unknown);
        assert_eq!(GateStatus::from_happy_hare(0), GateStatus::Empty);
        assert_eq!(GateStatus::from_happy_hare(1), GateStatus::Available);
        assert_eq!(GateStatus::from_happy_hare(2), GateStatus::FromBuffer);
        assert_eq!(GateStatus::from_happy_hare(99), GateStatus::Unknown);
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!(AmsAction::from_host_str("Loading"), AmsAction::Loading);
        assert_eq!(AmsAction::from_host_str("Forming Tip"), AmsAction::FormingTip);
        assert_eq!(AmsAction::from_host_str("Paused (runout)"), AmsAction::Paused);
        assert_eq!(AmsAction::from_host_str("whatever"), AmsAction::Idle);
        assert!(AmsAction::Loading.is_busy());
        assert!(!AmsAction::Idle.is_busy());
    }

    #[test]
    fn test_color_parsing() {
        assert_eq!(parse_gate_color("#26A69A"), 0x26A69A);
        assert_eq!(parse_gate_color("26A69A"), 0x26A69A);
        assert_eq!(parse_gate_color("#26A69AFF"), 0x26A69A);
        assert_eq!(parse_gate_color(""), DEFAULT_GATE_COLOR);
        assert_eq!(parse_gate_color("zzz"), DEFAULT_GATE_COLOR);
        // Byte 6 inside a multi-byte character must not panic.
        assert_eq!(parse_gate_color("#26A69é"), DEFAULT_GATE_COLOR);
        assert_eq!(parse_gate_color("ééé"), DEFAULT_GATE_COLOR);
    }

    #[test]
    fn test_gate_lookup_across_units() {
        let mut info = AmsSystemInfo::default();
        info.units.push(AmsUnit {
            unit_index: 0,
            name: "Unit 0".to_string(),
            gate_count: 2,
            first_gate: 0,
            connected: true,
            firmware_version: String::new(),
            has_encoder: true,
            has_toolhead_sensor: false,
            has_gate_sensors: false,
            gates: vec![GateInfo::empty(0), GateInfo::empty(1)],
        });
        info.units.push(AmsUnit {
            unit_index: 1,
            name: "Unit 1".to_string(),
            gate_count: 2,
            first_gate: 2,
            connected: true,
            firmware_version: String::new(),
            has_encoder: true,
            has_toolhead_sensor: false,
            has_gate_sensors: false,
            gates: vec![GateInfo::empty(2), GateInfo::empty(3)],
        });
        info.total_gates = 4;

        assert_eq!(info.gate(3).unwrap().global_index, 3);
        assert!(info.gate(4).is_none());
    }
}
