//! Shadow JSON and cell derivation for printer status updates.
//!
//! Every inbound status delta is deep-merged into the shadow document,
//! then the fields of interest are extracted, converted per the
//! derivation rules, and written to the well-known cells. All updates
//! from one notification are applied atomically: observers see the full
//! set of changes or none of them.

use parking_lot::RwLock;
use serde_json::Value;

use super::keys;
use super::snapshot::{PrintState, PrinterSnapshot};
use crate::store::StateStore;

/// Host object names resolved by discovery
///
/// Discovery's heuristic selectors fill these in; until then the
/// defaults match the overwhelmingly common single-extruder setup.
#[derive(Debug, Clone)]
pub struct ObjectSelection {
    /// Bed heater object name
    pub bed_heater: String,
    /// Hotend heater object name
    pub hotend_heater: String,
    /// Chamber heater or sensor object name, empty when absent
    pub chamber: String,
    /// Part-cooling fan object name
    pub part_fan: String,
    /// Main LED object name, empty when absent
    pub main_led: String,
}

impl Default for ObjectSelection {
    fn default() -> Self {
        Self {
            bed_heater: "heater_bed".to_string(),
            hotend_heater: "extruder".to_string(),
            chamber: String::new(),
            part_fan: "fan".to_string(),
            main_led: String::new(),
        }
    }
}

/// Deep-merge `delta` into `base`
///
/// Objects merge recursively; any other value replaces the previous one.
/// This matches the host's partial-update semantics where arrays arrive
/// whole.
pub fn merge_delta(base: &mut Value, delta: &Value) {
    match (base, delta) {
        (Value::Object(base_map), Value::Object(delta_map)) => {
            for (key, value) in delta_map {
                merge_delta(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base_slot, value) => {
            *base_slot = value.clone();
        }
    }
}

/// Reactive model of printer state
///
/// Owns the shadow JSON and the [`PrinterSnapshot`], and fans changes out
/// to cells. Writers on non-UI threads must route `apply_status` through
/// the store's scheduler.
pub struct PrinterState {
    shadow: RwLock<Value>,
    snapshot: RwLock<PrinterSnapshot>,
    selection: RwLock<ObjectSelection>,
    led_on_threshold: RwLock<f64>,
}

impl PrinterState {
    /// Create an empty printer state
    pub fn new() -> Self {
        Self {
            shadow: RwLock::new(Value::Object(serde_json::Map::new())),
            snapshot: RwLock::new(PrinterSnapshot::default()),
            selection: RwLock::new(ObjectSelection::default()),
            led_on_threshold: RwLock::new(0.001),
        }
    }

    /// Register every well-known printer cell on the store
    pub fn init_cells(&self, store: &StateStore) {
        store.register_int(keys::EXTRUDER_TEMP, 0);
        store.register_int(keys::EXTRUDER_TARGET, 0);
        store.register_int(keys::BED_TEMP, 0);
        store.register_int(keys::BED_TARGET, 0);
        store.register_int(keys::CHAMBER_TEMP, 0);
        store.register_int(keys::CHAMBER_TARGET, 0);
        store.register_text(keys::HOMED_AXES, "");
        store.register_text(keys::PRINT_STATE, "standby");
        store.register_int(keys::SPEED_FACTOR, 100);
        store.register_int(keys::FLOW_FACTOR, 100);
        store.register_int(keys::FAN_SPEED, 0);
        store.register_int(keys::PRINT_PROGRESS, 0);
        store.register_int(keys::CURRENT_LAYER, 0);
        store.register_int(keys::TOTAL_LAYER, 0);
        store.register_text(keys::PRINT_FILENAME, "");
        store.register_int(keys::LED_ON, 0);
        store.register_text(keys::KLIPPY_STATE, "");
    }

    /// Install the object names chosen by discovery
    pub fn set_selection(&self, selection: ObjectSelection) {
        *self.selection.write() = selection;
    }

    /// Currently selected object names
    pub fn selection(&self) -> ObjectSelection {
        self.selection.read().clone()
    }

    /// Set the LED "on" color-magnitude threshold
    pub fn set_led_on_threshold(&self, threshold: f64) {
        *self.led_on_threshold.write() = threshold;
    }

    /// Copy of the current snapshot, safe for single-threaded reads
    pub fn snapshot(&self) -> PrinterSnapshot {
        self.snapshot.read().clone()
    }

    /// Copy of the shadow JSON for deep queries
    pub fn shadow(&self) -> Value {
        self.shadow.read().clone()
    }

    /// Query a path in the shadow, e.g. `("bed_mesh", "profile_name")`
    pub fn shadow_field(&self, object: &str, field: &str) -> Option<Value> {
        self.shadow.read().get(object)?.get(field).cloned()
    }

    /// Reset snapshot and shadow; used on reconnect before rediscovery
    pub fn clear(&self) {
        *self.shadow.write() = Value::Object(serde_json::Map::new());
        *self.snapshot.write() = PrinterSnapshot::default();
    }

    /// Merge one status delta and fan the derived fields out to cells
    ///
    /// `delta` is the partial `{object: {field: value}}` map from a
    /// `notify_status_update` notification.
    pub fn apply_status(&self, store: &StateStore, delta: &Value) {
        {
            let mut shadow = self.shadow.write();
            merge_delta(&mut shadow, delta);
        }

        let selection = self.selection.read().clone();
        let shadow = self.shadow.read().clone();
        let mut snap = self.snapshot.write();
        // Reborrow through the guard so field borrows split.
        let snap = &mut *snap;
        let previous_state = snap.print_state;

        if let Some(heater) = shadow.get(selection.hotend_heater.as_str()) {
            read_heater(heater, &mut snap.extruder.current, &mut snap.extruder.target);
        }
        if let Some(heater) = shadow.get(selection.bed_heater.as_str()) {
            read_heater(heater, &mut snap.bed.current, &mut snap.bed.target);
        }
        if !selection.chamber.is_empty() {
            if let Some(heater) = shadow.get(selection.chamber.as_str()) {
                read_heater(heater, &mut snap.chamber.current, &mut snap.chamber.target);
            }
        }

        if let Some(toolhead) = shadow.get("toolhead") {
            if let Some(axes) = toolhead.get("homed_axes").and_then(Value::as_str) {
                snap.homed_axes = axes.to_lowercase();
            }
            if let Some(pos) = toolhead.get("position").and_then(Value::as_array) {
                let coord = |i: usize| pos.get(i).and_then(Value::as_f64).unwrap_or(0.0);
                snap.position.x = coord(0);
                snap.position.y = coord(1);
                snap.position.z = coord(2);
                snap.position.e = coord(3);
            }
        }

        if let Some(gcode_move) = shadow.get("gcode_move") {
            if let Some(f) = gcode_move.get("speed_factor").and_then(Value::as_f64) {
                snap.speed_factor = fraction_to_percent(f);
            }
            if let Some(f) = gcode_move.get("extrude_factor").and_then(Value::as_f64) {
                snap.flow_factor = fraction_to_percent(f);
            }
        }

        if let Some(fan) = shadow.get(selection.part_fan.as_str()) {
            if let Some(f) = fan.get("speed").and_then(Value::as_f64) {
                snap.fan_speed = fraction_to_percent(f);
            }
        }

        if let Some(stats) = shadow.get("print_stats") {
            if let Some(state) = stats.get("state").and_then(Value::as_str) {
                snap.print_state = PrintState::from_host_str(state);
            }
            if let Some(name) = stats.get("filename").and_then(Value::as_str) {
                snap.filename = name.to_string();
            }
            if let Some(info) = stats.get("info") {
                let layer = |field: &str| {
                    info.get(field)
                        .and_then(Value::as_u64)
                        .map(|v| v.min(u64::from(u32::MAX)) as u32)
                };
                // Layer counters are monotone within one print; they
                // reset only when the job leaves the printing family.
                let reset = snap.print_state == PrintState::Standby
                    || previous_state.is_terminal();
                if let Some(current) = layer("current_layer") {
                    if reset || current >= snap.current_layer {
                        snap.current_layer = current;
                    }
                }
                if let Some(total) = layer("total_layer") {
                    if reset || total >= snap.total_layer {
                        snap.total_layer = total;
                    }
                }
            }
        }

        if let Some(display) = shadow.get("display_status") {
            if let Some(p) = display.get("progress").and_then(Value::as_f64) {
                snap.progress = p.clamp(0.0, 1.0);
            }
        }

        if !selection.main_led.is_empty() {
            if let Some(led) = shadow.get(selection.main_led.as_str()) {
                if let Some(first) = led
                    .get("color_data")
                    .and_then(Value::as_array)
                    .and_then(|rows| rows.first())
                    .and_then(Value::as_array)
                {
                    let threshold = *self.led_on_threshold.read();
                    snap.led_on = first
                        .iter()
                        .filter_map(Value::as_f64)
                        .any(|channel| channel > threshold);
                }
            }
        }

        let snapshot = snap.clone();
        drop(snap);

        self.write_cells(store, previous_state, &snapshot);

        if let Some(webhooks) = delta.get("webhooks") {
            if let Some(state) = webhooks.get("state").and_then(Value::as_str) {
                store.write(keys::KLIPPY_STATE, crate::store::CellValue::Text(state.to_string()));
            }
        }
    }

    fn write_cells(&self, store: &StateStore, previous: PrintState, snap: &PrinterSnapshot) {
        use crate::store::CellValue::{Int, Text};

        store.write(keys::EXTRUDER_TEMP, Int(snap.extruder.current.floor() as i32));
        store.write(keys::EXTRUDER_TARGET, Int(snap.extruder.target.floor() as i32));
        store.write(keys::BED_TEMP, Int(snap.bed.current.floor() as i32));
        store.write(keys::BED_TARGET, Int(snap.bed.target.floor() as i32));
        store.write(keys::CHAMBER_TEMP, Int(snap.chamber.current.floor() as i32));
        store.write(keys::CHAMBER_TARGET, Int(snap.chamber.target.floor() as i32));
        store.write(keys::HOMED_AXES, Text(snap.homed_axes.clone()));

        // A job leaving printing must pass through a terminal state
        // before the cell may show standby again.
        if previous == PrintState::Printing
            && snap.print_state == PrintState::Standby
        {
            store.write(keys::PRINT_STATE, Text(PrintState::Complete.to_string()));
        }
        store.write(keys::PRINT_STATE, Text(snap.print_state.to_string()));

        store.write(keys::SPEED_FACTOR, Int(snap.speed_factor as i32));
        store.write(keys::FLOW_FACTOR, Int(snap.flow_factor as i32));
        store.write(keys::FAN_SPEED, Int(snap.fan_speed as i32));
        store.write(keys::PRINT_PROGRESS, Int(snap.progress_percent()));
        store.write(keys::CURRENT_LAYER, Int(snap.current_layer as i32));
        store.write(keys::TOTAL_LAYER, Int(snap.total_layer as i32));
        store.write(keys::PRINT_FILENAME, Text(snap.filename.clone()));
        store.write(keys::LED_ON, Int(i32::from(snap.led_on)));
    }
}

impl Default for PrinterState {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a host fraction to a clamped integer percentage
fn fraction_to_percent(fraction: f64) -> u32 {
    ((fraction * 100.0).round().clamp(0.0, 100.0)) as u32
}

fn read_heater(heater: &Value, current: &mut f64, target: &mut f64) {
    if let Some(t) = heater.get("temperature").and_then(Value::as_f64) {
        *current = t;
    }
    if let Some(t) = heater.get("target").and_then(Value::as_f64) {
        *target = t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (StateStore, PrinterState) {
        let store = StateStore::new();
        let state = PrinterState::new();
        state.init_cells(&store);
        (store, state)
    }

    #[test]
    fn test_merge_delta_is_deep() {
        let mut base = json!({"extruder": {"temperature": 25.0, "target": 0.0}});
        merge_delta(&mut base, &json!({"extruder": {"target": 210.0}}));
        assert_eq!(base["extruder"]["temperature"], json!(25.0));
        assert_eq!(base["extruder"]["target"], json!(210.0));
    }

    #[test]
    fn test_temperature_is_floored() {
        let (store, state) = setup();
        state.apply_status(&store, &json!({"extruder": {"temperature": 209.7}}));
        assert_eq!(store.cell(keys::EXTRUDER_TEMP).unwrap().get_int(), 209);
    }

    #[test]
    fn test_percent_is_rounded_and_clamped() {
        let (store, state) = setup();
        state.apply_status(&store, &json!({"fan": {"speed": 0.456}}));
        assert_eq!(store.cell(keys::FAN_SPEED).unwrap().get_int(), 46);

        state.apply_status(&store, &json!({"fan": {"speed": 1.4}}));
        assert_eq!(store.cell(keys::FAN_SPEED).unwrap().get_int(), 100);
    }

    #[test]
    fn test_all_heaters_update_from_one_delta() {
        let (store, state) = setup();
        let mut selection = state.selection();
        selection.chamber = "heater_generic chamber".to_string();
        state.set_selection(selection);

        state.apply_status(
            &store,
            &json!({
                "extruder": {"temperature": 209.5, "target": 210.0},
                "heater_bed": {"temperature": 59.8, "target": 60.0},
                "heater_generic chamber": {"temperature": 41.2, "target": 45.0}
            }),
        );

        let snap = state.snapshot();
        assert_eq!(snap.extruder.target, 210.0);
        assert_eq!(snap.bed.target, 60.0);
        assert_eq!(snap.chamber.target, 45.0);
        assert_eq!(store.cell(keys::EXTRUDER_TEMP).unwrap().get_int(), 209);
        assert_eq!(store.cell(keys::BED_TEMP).unwrap().get_int(), 59);
        assert_eq!(store.cell(keys::CHAMBER_TEMP).unwrap().get_int(), 41);
    }

    #[test]
    fn test_homed_axes_lowercased() {
        let (store, state) = setup();
        state.apply_status(&store, &json!({"toolhead": {"homed_axes": "XY"}}));
        assert_eq!(store.cell(keys::HOMED_AXES).unwrap().get_text(), "xy");
        assert!(state.snapshot().axes_homed("xy"));
    }

    #[test]
    fn test_print_state_and_filename() {
        let (store, state) = setup();
        state.apply_status(
            &store,
            &json!({"print_stats": {"state": "printing", "filename": "cube.gcode"}}),
        );
        assert_eq!(store.cell(keys::PRINT_STATE).unwrap().get_text(), "printing");
        assert_eq!(
            store.cell(keys::PRINT_FILENAME).unwrap().get_text(),
            "cube.gcode"
        );
    }

    #[test]
    fn test_layers_are_monotone_within_print() {
        let (store, state) = setup();
        state.apply_status(&store, &json!({"print_stats": {"state": "printing"}}));
        state.apply_status(
            &store,
            &json!({"print_stats": {"info": {"current_layer": 10, "total_layer": 100}}}),
        );
        // A lower value mid-print is stale and must not regress the cell.
        state.apply_status(
            &store,
            &json!({"print_stats": {"info": {"current_layer": 7}}}),
        );
        assert_eq!(store.cell(keys::CURRENT_LAYER).unwrap().get_int(), 10);
    }

    #[test]
    fn test_leaving_printing_passes_through_terminal() {
        let (store, state) = setup();
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        store
            .cell(keys::PRINT_STATE)
            .unwrap()
            .observe(move |v| {
                if let Some(text) = v.as_text() {
                    s.lock().push(text.to_string());
                }
            });

        state.apply_status(&store, &json!({"print_stats": {"state": "printing"}}));
        state.apply_status(&store, &json!({"print_stats": {"state": "standby"}}));

        assert_eq!(*seen.lock(), vec!["printing", "complete", "standby"]);
    }

    #[test]
    fn test_led_threshold() {
        let (store, state) = setup();
        state.set_selection(ObjectSelection {
            main_led: "neopixel case_light".to_string(),
            ..Default::default()
        });
        state.apply_status(
            &store,
            &json!({"neopixel case_light": {"color_data": [[0.0, 0.0, 0.0, 0.0]]}}),
        );
        assert_eq!(store.cell(keys::LED_ON).unwrap().get_int(), 0);

        state.apply_status(
            &store,
            &json!({"neopixel case_light": {"color_data": [[0.0, 0.5, 0.0, 0.0]]}}),
        );
        assert_eq!(store.cell(keys::LED_ON).unwrap().get_int(), 1);
    }

    #[test]
    fn test_klippy_state_cell() {
        let (store, state) = setup();
        state.apply_status(&store, &json!({"webhooks": {"state": "shutdown"}}));
        assert_eq!(store.cell(keys::KLIPPY_STATE).unwrap().get_text(), "shutdown");
    }
}
