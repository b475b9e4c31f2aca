//! Well-known cell keys for printer state.
//!
//! Every key is registered by `PrinterState::init_cells` before any
//! writer runs. UI widgets bind to these by name.

/// Current extruder temperature, °C floored to integer
pub const EXTRUDER_TEMP: &str = "printer_extruder_temp";
/// Extruder target temperature, °C floored to integer
pub const EXTRUDER_TARGET: &str = "printer_extruder_target";
/// Current bed temperature, °C floored to integer
pub const BED_TEMP: &str = "printer_bed_temp";
/// Bed target temperature, °C floored to integer
pub const BED_TARGET: &str = "printer_bed_target";
/// Current chamber temperature, °C floored to integer
pub const CHAMBER_TEMP: &str = "printer_chamber_temp";
/// Chamber target temperature, °C floored to integer
pub const CHAMBER_TARGET: &str = "printer_chamber_target";
/// Lowercase concatenation of homed axis letters, e.g. "xyz"
pub const HOMED_AXES: &str = "printer_homed_axes";
/// Print state string as reported by the host
pub const PRINT_STATE: &str = "printer_print_state";
/// Speed factor percentage, 0..=100
pub const SPEED_FACTOR: &str = "printer_speed_factor";
/// Extrusion (flow) factor percentage
pub const FLOW_FACTOR: &str = "printer_flow_factor";
/// Part-cooling fan percentage, 0..=100
pub const FAN_SPEED: &str = "printer_fan_speed";
/// Print progress percentage, 0..=100
pub const PRINT_PROGRESS: &str = "printer_print_progress";
/// Current layer number from print_stats.info
pub const CURRENT_LAYER: &str = "printer_current_layer";
/// Total layer count from print_stats.info
pub const TOTAL_LAYER: &str = "printer_total_layer";
/// Filename of the active print job
pub const PRINT_FILENAME: &str = "printer_print_filename";
/// Main LED on/off, 1 or 0
pub const LED_ON: &str = "printer_led_on";
/// Klippy daemon state: "ready", "shutdown", "startup", "error"
pub const KLIPPY_STATE: &str = "printer_klippy_state";

/// Capability cells: effective booleans after overrides
pub mod capability {
    /// Quad gantry level available
    pub const QGL: &str = "cap_qgl";
    /// Z-tilt adjustment available
    pub const Z_TILT: &str = "cap_z_tilt";
    /// Bed mesh available
    pub const BED_MESH: &str = "cap_bed_mesh";
    /// Chamber heater present
    pub const CHAMBER_HEATER: &str = "cap_chamber_heater";
    /// Chamber temperature sensor present
    pub const CHAMBER_SENSOR: &str = "cap_chamber_sensor";
    /// Exclude-object support
    pub const EXCLUDE_OBJECT: &str = "cap_exclude_object";
    /// Z probe present
    pub const PROBE: &str = "cap_probe";
    /// Heated bed present
    pub const HEATED_BED: &str = "cap_heated_bed";
    /// Controllable LED present
    pub const LED: &str = "cap_led";
    /// Accelerometer present
    pub const ACCELEROMETER: &str = "cap_accelerometer";
    /// Screws tilt adjust available
    pub const SCREWS_TILT: &str = "cap_screws_tilt";
    /// Speaker / beeper present
    pub const SPEAKER: &str = "cap_speaker";
    /// An AMS unit is present
    pub const AMS: &str = "cap_ams";
}
