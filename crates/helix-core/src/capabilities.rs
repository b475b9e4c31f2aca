//! Printer capability set with user override layer.
//!
//! Capabilities are detected once per discovery from the host's object
//! list. Users can pin any capability on or off through the runtime
//! config; the effective value is what the UI binds to.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::state::keys::capability as cap_keys;
use crate::store::StateStore;

/// Type of multi-material unit detected on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AmsType {
    /// No AMS detected
    #[default]
    None,
    /// Happy Hare MMU (`mmu` object)
    HappyHare,
    /// AFC-Klipper-Add-On (`afc` object)
    Afc,
}

impl std::fmt::Display for AmsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AmsType::None => write!(f, "None"),
            AmsType::HappyHare => write!(f, "Happy Hare"),
            AmsType::Afc => write!(f, "AFC"),
        }
    }
}

/// Identifier for a single capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Quad gantry level
    QuadGantryLevel,
    /// Z-tilt adjustment
    ZTilt,
    /// Bed mesh calibration
    BedMesh,
    /// Chamber heater
    ChamberHeater,
    /// Chamber temperature sensor
    ChamberSensor,
    /// Exclude-object support
    ExcludeObject,
    /// Z probe (probe or bltouch)
    Probe,
    /// Heated bed
    HeatedBed,
    /// Controllable LED
    Led,
    /// Accelerometer / resonance tester
    Accelerometer,
    /// Screws tilt adjust
    ScrewsTilt,
    /// Speaker / beeper
    Speaker,
    /// AMS present
    Ams,
}

impl Capability {
    /// All capabilities, in stable order
    pub const ALL: [Capability; 13] = [
        Capability::QuadGantryLevel,
        Capability::ZTilt,
        Capability::BedMesh,
        Capability::ChamberHeater,
        Capability::ChamberSensor,
        Capability::ExcludeObject,
        Capability::Probe,
        Capability::HeatedBed,
        Capability::Led,
        Capability::Accelerometer,
        Capability::ScrewsTilt,
        Capability::Speaker,
        Capability::Ams,
    ];

    /// Config / cell name for this capability
    pub fn name(&self) -> &'static str {
        match self {
            Capability::QuadGantryLevel => "quad_gantry_level",
            Capability::ZTilt => "z_tilt",
            Capability::BedMesh => "bed_mesh",
            Capability::ChamberHeater => "chamber_heater",
            Capability::ChamberSensor => "chamber_sensor",
            Capability::ExcludeObject => "exclude_object",
            Capability::Probe => "probe",
            Capability::HeatedBed => "heated_bed",
            Capability::Led => "led",
            Capability::Accelerometer => "accelerometer",
            Capability::ScrewsTilt => "screws_tilt",
            Capability::Speaker => "speaker",
            Capability::Ams => "ams",
        }
    }

    fn cell_key(&self) -> &'static str {
        match self {
            Capability::QuadGantryLevel => cap_keys::QGL,
            Capability::ZTilt => cap_keys::Z_TILT,
            Capability::BedMesh => cap_keys::BED_MESH,
            Capability::ChamberHeater => cap_keys::CHAMBER_HEATER,
            Capability::ChamberSensor => cap_keys::CHAMBER_SENSOR,
            Capability::ExcludeObject => cap_keys::EXCLUDE_OBJECT,
            Capability::Probe => cap_keys::PROBE,
            Capability::HeatedBed => cap_keys::HEATED_BED,
            Capability::Led => cap_keys::LED,
            Capability::Accelerometer => cap_keys::ACCELEROMETER,
            Capability::ScrewsTilt => cap_keys::SCREWS_TILT,
            Capability::Speaker => cap_keys::SPEAKER,
            Capability::Ams => cap_keys::AMS,
        }
    }
}

/// Per-capability override state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityState {
    /// Use the detected value
    #[default]
    Auto,
    /// Force the capability on
    Enable,
    /// Force the capability off
    Disable,
}

/// Well-known macros the preparation flow cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownMacros {
    /// Nozzle cleaning macro name, empty when absent
    pub nozzle_clean: String,
    /// Purge / prime line macro name, empty when absent
    pub purge_line: String,
    /// Heat soak macro name, empty when absent
    pub heat_soak: String,
}

/// Detected capability set for one printer
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    detected: HashMap<Capability, bool>,
    overrides: HashMap<Capability, CapabilityState>,
    /// AMS variant, `None` when no multi-material unit was found
    pub ams_type: AmsType,
    /// Every `gcode_macro` name discovered, lowercased
    pub macros: BTreeSet<String>,
    /// Cached well-known macro names
    pub known_macros: KnownMacros,
}

impl Capabilities {
    /// Record a detection result
    pub fn set_detected(&mut self, cap: Capability, present: bool) {
        self.detected.insert(cap, present);
    }

    /// Raw detection result, before overrides
    pub fn detected(&self, cap: Capability) -> bool {
        self.detected.get(&cap).copied().unwrap_or(false)
    }

    /// Install the override map loaded from the runtime config
    pub fn set_overrides(&mut self, overrides: HashMap<Capability, CapabilityState>) {
        self.overrides = overrides;
    }

    /// Current override state for a capability
    pub fn override_state(&self, cap: Capability) -> CapabilityState {
        self.overrides.get(&cap).copied().unwrap_or_default()
    }

    /// Effective value: Enable → true, Disable → false, Auto → detected
    pub fn effective(&self, cap: Capability) -> bool {
        match self.override_state(cap) {
            CapabilityState::Enable => true,
            CapabilityState::Disable => false,
            CapabilityState::Auto => self.detected(cap),
        }
    }

    /// Whether a macro with this (case-insensitive) name exists
    pub fn has_macro(&self, name: &str) -> bool {
        self.macros.contains(&name.to_lowercase())
    }

    /// Register every capability cell and publish effective values
    ///
    /// Called after discovery so the UI sees user intent, not raw
    /// detection.
    pub fn publish(&self, store: &StateStore) {
        for cap in Capability::ALL {
            let cell = store.register_int(cap.cell_key(), 0);
            cell.set_int(i32::from(self.effective(cap)));
        }
    }
}

/// Find the well-known macros in a discovered macro set
///
/// Matching is case-insensitive over several synonyms per category; the
/// first match in synonym order wins.
pub fn resolve_known_macros(macros: &BTreeSet<String>) -> KnownMacros {
    let find = |candidates: &[&str]| -> String {
        for candidate in candidates {
            if macros.contains(*candidate) {
                return (*candidate).to_uppercase();
            }
        }
        String::new()
    };

    KnownMacros {
        nozzle_clean: find(&["clean_nozzle", "nozzle_clean", "wipe_nozzle", "nozzle_wipe"]),
        purge_line: find(&["purge_line", "line_purge", "prime_line", "prime_nozzle"]),
        heat_soak: find(&["heat_soak", "chamber_soak", "soak"]),
    }
}
