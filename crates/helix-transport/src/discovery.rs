//! Printer object discovery.
//!
//! Runs after every (re)connect: list the host's printer objects, fetch
//! server and printer identity, then subscribe to everything of
//! interest. Classifies the object list into heaters, sensors, fans and
//! LEDs, picks the most likely candidates for each role, and detects
//! capabilities from object names.

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use helix_core::error::{Result, TransportError};
use helix_core::{resolve_known_macros, AmsType, Capabilities, Capability, ObjectSelection};

use crate::client::RpcClient;

/// Fan names never chosen as the part-cooling fan
const AUX_FAN_NAMES: [&str; 4] = ["bed_fans", "exhaust", "nevermore", "controller_fan"];
/// LED names never chosen as the main light
const AUX_LED_NAMES: [&str; 3] = ["indicator", "status", "corner"];

/// Classified printer objects
#[derive(Debug, Clone, Default)]
pub struct ObjectInventory {
    /// Every object the host reported
    pub objects: Vec<String>,
    /// Heater objects
    pub heaters: Vec<String>,
    /// Temperature sensor objects; temperature fans appear here too
    pub sensors: Vec<String>,
    /// Fan objects
    pub fans: Vec<String>,
    /// LED objects
    pub leds: Vec<String>,
}

impl ObjectInventory {
    /// Bucket the raw object list by name prefix
    pub fn classify(objects: Vec<String>) -> Self {
        let mut inv = Self {
            objects,
            ..Default::default()
        };
        for name in &inv.objects {
            if (name.starts_with("extruder") && !name.starts_with("extruder_stepper"))
                || name == "heater_bed"
                || name.starts_with("heater_generic ")
            {
                inv.heaters.push(name.clone());
            }
            if name.starts_with("temperature_sensor ") || name.starts_with("temperature_fan ") {
                inv.sensors.push(name.clone());
            }
            if name == "fan"
                || name.starts_with("heater_fan ")
                || name.starts_with("fan_generic ")
                || name.starts_with("controller_fan ")
                || name.starts_with("temperature_fan ")
                || name.starts_with("output_pin ")
            {
                inv.fans.push(name.clone());
            }
            if name.starts_with("led ")
                || name.starts_with("neopixel ")
                || name.starts_with("dotstar ")
            {
                inv.leds.push(name.clone());
            }
        }
        inv
    }

    fn contains(&self, name: &str) -> bool {
        self.objects.iter().any(|o| o == name)
    }

    /// Most likely bed heater, empty when none looks right
    pub fn bed_heater(&self) -> String {
        pick(
            &self.heaters,
            &["heater_bed", "heated_bed"],
            &["bed"],
            &[],
            false,
        )
    }

    /// Most likely hotend heater
    pub fn hotend_heater(&self) -> String {
        pick(
            &self.heaters,
            &["extruder", "extruder0"],
            &["extruder", "hotend", "e0"],
            &[],
            false,
        )
    }

    /// Most likely bed temperature sensor
    pub fn bed_sensor(&self) -> String {
        pick(&self.sensors, &[], &["bed"], &[], false)
    }

    /// Most likely hotend temperature sensor
    pub fn hotend_sensor(&self) -> String {
        pick(&self.sensors, &[], &["extruder", "hotend", "e0"], &[], false)
    }

    /// Most likely chamber sensor or heater
    pub fn chamber(&self) -> String {
        let heater = pick(&self.heaters, &[], &["chamber"], &[], false);
        if !heater.is_empty() {
            return heater;
        }
        pick(&self.sensors, &[], &["chamber"], &[], false)
    }

    /// Most likely part-cooling fan, falling back to the first
    /// non-auxiliary fan
    pub fn part_fan(&self) -> String {
        pick(&self.fans, &["fan"], &["part"], &AUX_FAN_NAMES, true)
    }

    /// Most likely main case light
    pub fn main_led(&self) -> String {
        pick(
            &self.leds,
            &[],
            &["case", "chamber", "light"],
            &AUX_LED_NAMES,
            true,
        )
    }

    /// Build the object-selection record the state model consumes
    pub fn selection(&self) -> ObjectSelection {
        ObjectSelection {
            bed_heater: self.bed_heater(),
            hotend_heater: self.hotend_heater(),
            chamber: self.chamber(),
            part_fan: self.part_fan(),
            main_led: self.main_led(),
        }
    }
}

/// Priority pick: exact names first, then substring matches in order,
/// then (optionally) the first candidate not on the avoid list.
fn pick(
    candidates: &[String],
    exact: &[&str],
    substrings: &[&str],
    avoid: &[&str],
    fall_back_to_first: bool,
) -> String {
    let avoided = |name: &str| avoid.iter().any(|a| name.contains(a));
    for want in exact {
        if let Some(found) = candidates.iter().find(|c| c == want) {
            return found.clone();
        }
    }
    for want in substrings {
        if let Some(found) = candidates
            .iter()
            .find(|c| c.to_lowercase().contains(want) && !avoided(&c.to_lowercase()))
        {
            return found.clone();
        }
    }
    if fall_back_to_first {
        if let Some(found) = candidates.iter().find(|c| !avoided(&c.to_lowercase())) {
            return found.clone();
        }
    }
    String::new()
}

/// Detect capabilities from the raw object list
pub fn detect_capabilities(inventory: &ObjectInventory) -> Capabilities {
    let mut caps = Capabilities::default();
    let objects = &inventory.objects;
    let has_prefix = |p: &str| objects.iter().any(|o| o == p || o.starts_with(&format!("{p} ")));

    caps.set_detected(Capability::QuadGantryLevel, inventory.contains("quad_gantry_level"));
    caps.set_detected(Capability::ZTilt, inventory.contains("z_tilt"));
    caps.set_detected(Capability::BedMesh, inventory.contains("bed_mesh"));
    caps.set_detected(
        Capability::ChamberHeater,
        objects
            .iter()
            .any(|o| o.starts_with("heater_generic ") && o.contains("chamber")),
    );
    caps.set_detected(
        Capability::ChamberSensor,
        objects
            .iter()
            .any(|o| o.starts_with("temperature_sensor ") && o.contains("chamber")),
    );
    caps.set_detected(Capability::ExcludeObject, inventory.contains("exclude_object"));
    caps.set_detected(
        Capability::Probe,
        inventory.contains("probe") || inventory.contains("bltouch"),
    );
    caps.set_detected(Capability::HeatedBed, inventory.contains("heater_bed"));
    caps.set_detected(Capability::Led, !inventory.leds.is_empty());
    caps.set_detected(
        Capability::Accelerometer,
        has_prefix("adxl345")
            || has_prefix("lis2dw")
            || has_prefix("mpu9250")
            || inventory.contains("resonance_tester"),
    );
    caps.set_detected(Capability::ScrewsTilt, inventory.contains("screws_tilt_adjust"));
    caps.set_detected(
        Capability::Speaker,
        objects
            .iter()
            .any(|o| o.starts_with("output_pin ") && o.to_lowercase().contains("beeper")),
    );

    caps.ams_type = if inventory.contains("mmu") {
        AmsType::HappyHare
    } else if inventory.contains("afc") || inventory.contains("AFC") {
        AmsType::Afc
    } else {
        AmsType::None
    };
    caps.set_detected(Capability::Ams, caps.ams_type != AmsType::None);

    caps.macros = objects
        .iter()
        .filter_map(|o| o.strip_prefix("gcode_macro "))
        .map(|m| m.to_lowercase())
        .collect();
    caps.known_macros = resolve_known_macros(&caps.macros);

    caps
}

/// Result of a completed discovery pass
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub inventory: ObjectInventory,
    pub capabilities: Capabilities,
    pub selection: ObjectSelection,
    /// Host machine name from printer identity
    pub hostname: String,
    /// Firmware state reported by server info
    pub klippy_state: String,
    /// Full initial status returned by the subscription
    pub initial_status: Value,
}

/// Objects subscribed regardless of classification
const ALWAYS_SUBSCRIBE: [&str; 9] = [
    "toolhead",
    "print_stats",
    "virtual_sdcard",
    "display_status",
    "gcode_move",
    "webhooks",
    "bed_mesh",
    "exclude_object",
    "idle_timeout",
];

/// Run the four-step discovery sequence
///
/// 1. list printer objects, 2. fetch server info, 3. fetch printer
/// identity, 4. subscribe to the union of objects of interest. The
/// subscription reply carries the complete initial status.
pub async fn run_discovery(client: &RpcClient) -> Result<DiscoveryResult> {
    let listed = client.call("printer.objects.list", None, None).await?;
    let objects: Vec<String> = listed["objects"]
        .as_array()
        .ok_or_else(|| TransportError::Parse {
            reason: "objects.list reply missing objects array".to_string(),
        })?
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    debug!(count = objects.len(), "Listed printer objects");

    let server_info = client.call("server.info", None, None).await?;
    let klippy_state = server_info["klippy_state"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();

    let printer_info = client.call("printer.info", None, None).await?;
    let hostname = printer_info["hostname"].as_str().unwrap_or("").to_string();

    let inventory = ObjectInventory::classify(objects);
    let capabilities = detect_capabilities(&inventory);
    let selection = inventory.selection();

    let mut subscribe = Map::new();
    for name in ALWAYS_SUBSCRIBE {
        if inventory.contains(name) {
            subscribe.insert(name.to_string(), Value::Null);
        }
    }
    for name in inventory
        .heaters
        .iter()
        .chain(inventory.sensors.iter())
        .chain(inventory.fans.iter())
        .chain(inventory.leds.iter())
    {
        subscribe.insert(name.clone(), Value::Null);
    }
    match capabilities.ams_type {
        AmsType::HappyHare => {
            subscribe.insert("mmu".to_string(), Value::Null);
        }
        AmsType::Afc => {
            subscribe.insert("AFC".to_string(), Value::Null);
            subscribe.insert("afc".to_string(), Value::Null);
        }
        AmsType::None => {}
    }

    let reply = client
        .call(
            "printer.objects.subscribe",
            Some(json!({ "objects": Value::Object(subscribe) })),
            None,
        )
        .await?;
    let initial_status = reply.get("status").cloned().unwrap_or(Value::Null);

    info!(
        hostname,
        klippy_state,
        ams = %capabilities.ams_type,
        heaters = inventory.heaters.len(),
        "Discovery complete"
    );

    Ok(DiscoveryResult {
        inventory,
        capabilities,
        selection,
        hostname,
        klippy_state,
        initial_status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voron_objects() -> Vec<String> {
        [
            "webhooks",
            "toolhead",
            "gcode_move",
            "print_stats",
            "virtual_sdcard",
            "display_status",
            "extruder",
            "extruder_stepper belted",
            "heater_bed",
            "heater_generic chamber_heater",
            "temperature_sensor chamber",
            "temperature_sensor raspberry_pi",
            "fan",
            "heater_fan hotend_fan",
            "controller_fan skirt_fans",
            "fan_generic bed_fans",
            "fan_generic nevermore",
            "neopixel case_leds",
            "neopixel status_leds",
            "quad_gantry_level",
            "bed_mesh",
            "probe",
            "exclude_object",
            "screws_tilt_adjust",
            "adxl345",
            "resonance_tester",
            "gcode_macro CLEAN_NOZZLE",
            "gcode_macro PRINT_START",
            "gcode_macro Heat_Soak",
            "mmu",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn test_classification_buckets() {
        let inv = ObjectInventory::classify(voron_objects());
        assert_eq!(
            inv.heaters,
            vec!["extruder", "heater_bed", "heater_generic chamber_heater"]
        );
        assert!(inv
            .sensors
            .contains(&"temperature_sensor chamber".to_string()));
        assert!(inv.fans.contains(&"fan".to_string()));
        assert!(inv.fans.contains(&"fan_generic nevermore".to_string()));
        assert_eq!(
            inv.leds,
            vec!["neopixel case_leds", "neopixel status_leds"]
        );
    }

    #[test]
    fn test_extruder_stepper_is_not_a_heater() {
        let inv = ObjectInventory::classify(vec![
            "extruder_stepper belted".to_string(),
            "extruder".to_string(),
        ]);
        assert_eq!(inv.heaters, vec!["extruder"]);
    }

    #[test]
    fn test_temperature_fan_is_sensor_and_fan() {
        let inv = ObjectInventory::classify(vec!["temperature_fan pi_fan".to_string()]);
        assert_eq!(inv.sensors, vec!["temperature_fan pi_fan"]);
        assert_eq!(inv.fans, vec!["temperature_fan pi_fan"]);
    }

    #[test]
    fn test_heuristic_selectors() {
        let inv = ObjectInventory::classify(voron_objects());
        assert_eq!(inv.bed_heater(), "heater_bed");
        assert_eq!(inv.hotend_heater(), "extruder");
        assert_eq!(inv.part_fan(), "fan");
        // case_leds wins over status_leds via the "case" substring.
        assert_eq!(inv.main_led(), "neopixel case_leds");
        assert_eq!(inv.chamber(), "heater_generic chamber_heater");
    }

    #[test]
    fn test_part_fan_avoids_auxiliary_names() {
        let inv = ObjectInventory::classify(vec![
            "fan_generic bed_fans".to_string(),
            "fan_generic nevermore".to_string(),
            "heater_fan hotend_fan".to_string(),
        ]);
        assert_eq!(inv.part_fan(), "heater_fan hotend_fan");
    }

    #[test]
    fn test_led_avoid_list_then_first() {
        let inv = ObjectInventory::classify(vec![
            "neopixel status_leds".to_string(),
            "led bar".to_string(),
        ]);
        assert_eq!(inv.main_led(), "led bar");

        let only_status = ObjectInventory::classify(vec!["neopixel status_leds".to_string()]);
        assert_eq!(only_status.main_led(), "");
    }

    #[test]
    fn test_capability_detection() {
        let inv = ObjectInventory::classify(voron_objects());
        let caps = detect_capabilities(&inv);
        assert!(caps.detected(Capability::QuadGantryLevel));
        assert!(caps.detected(Capability::BedMesh));
        assert!(caps.detected(Capability::Probe));
        assert!(caps.detected(Capability::ChamberHeater));
        assert!(caps.detected(Capability::ChamberSensor));
        assert!(caps.detected(Capability::Accelerometer));
        assert!(caps.detected(Capability::ScrewsTilt));
        assert!(caps.detected(Capability::Led));
        assert!(!caps.detected(Capability::ZTilt));
        assert_eq!(caps.ams_type, AmsType::HappyHare);
        assert!(caps.detected(Capability::Ams));
    }

    #[test]
    fn test_macro_detection_is_case_insensitive() {
        let inv = ObjectInventory::classify(voron_objects());
        let caps = detect_capabilities(&inv);
        assert!(caps.has_macro("clean_nozzle"));
        assert!(caps.has_macro("heat_soak"));
        assert_eq!(caps.known_macros.nozzle_clean, "CLEAN_NOZZLE");
        assert_eq!(caps.known_macros.heat_soak, "HEAT_SOAK");
        assert!(caps.known_macros.purge_line.is_empty());
    }

    #[test]
    fn test_afc_detection() {
        let inv = ObjectInventory::classify(vec!["AFC".to_string()]);
        assert_eq!(detect_capabilities(&inv).ams_type, AmsType::Afc);
    }
}
