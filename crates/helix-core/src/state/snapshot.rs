//! Printer snapshot types.
//!
//! A [`PrinterSnapshot`] is the mutable record assembled from host
//! subscription deltas. It is rewritten in place by `PrinterState` and
//! copied out for single-threaded reads.

use serde::{Deserialize, Serialize};

/// Print job state as derived from the host's state string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrintState {
    /// Printer idle, no job active
    #[default]
    Standby,
    /// Job running
    Printing,
    /// Job paused
    Paused,
    /// Job finished successfully
    Complete,
    /// Job aborted by the user
    Cancelled,
    /// Job aborted by an error
    Error,
}

impl PrintState {
    /// Derive from the host's print state string
    ///
    /// Unknown values map to `Standby`.
    pub fn from_host_str(s: &str) -> Self {
        match s {
            "printing" => PrintState::Printing,
            "paused" => PrintState::Paused,
            "complete" => PrintState::Complete,
            "cancelled" => PrintState::Cancelled,
            "error" => PrintState::Error,
            _ => PrintState::Standby,
        }
    }

    /// Whether the job has finished, one way or another
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PrintState::Complete | PrintState::Cancelled | PrintState::Error
        )
    }
}

impl std::fmt::Display for PrintState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrintState::Standby => "standby",
            PrintState::Printing => "printing",
            PrintState::Paused => "paused",
            PrintState::Complete => "complete",
            PrintState::Cancelled => "cancelled",
            PrintState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One heater's current and target temperature in °C
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaterReading {
    /// Measured temperature
    pub current: f64,
    /// Commanded target, 0.0 when off
    pub target: f64,
}

/// Toolhead position in millimetres plus extruder position
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolheadPosition {
    /// X axis
    pub x: f64,
    /// Y axis
    pub y: f64,
    /// Z axis
    pub z: f64,
    /// Extruder
    pub e: f64,
}

/// Authoritative printer state assembled from subscription deltas
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterSnapshot {
    /// Hotend heater reading
    pub extruder: HeaterReading,
    /// Bed heater reading
    pub bed: HeaterReading,
    /// Chamber heater/sensor reading, zeroed when absent
    pub chamber: HeaterReading,
    /// Lowercase axis letters actually homed, subset of "xyz"
    pub homed_axes: String,
    /// Toolhead position
    pub position: ToolheadPosition,
    /// Speed factor percentage
    pub speed_factor: u32,
    /// Flow factor percentage
    pub flow_factor: u32,
    /// Part fan percentage, 0..=100
    pub fan_speed: u32,
    /// Current print state
    pub print_state: PrintState,
    /// Current layer within the active print
    pub current_layer: u32,
    /// Total layers of the active print
    pub total_layer: u32,
    /// Progress fraction, 0.0..=1.0
    pub progress: f64,
    /// Filename of the active job, empty when idle
    pub filename: String,
    /// Tracked LED on/off, derived from the first strip element
    pub led_on: bool,
}

impl PrinterSnapshot {
    /// Whether the given axes (e.g. "xyz") are all homed
    pub fn axes_homed(&self, axes: &str) -> bool {
        axes.chars().all(|a| self.homed_axes.contains(a))
    }

    /// Progress as a clamped integer percentage
    pub fn progress_percent(&self) -> i32 {
        ((self.progress * 100.0).round() as i32).clamp(0, 100)
    }
}
