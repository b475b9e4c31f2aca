//! Detection of printer operations embedded in a G-code file.
//!
//! The preparation flow needs to know which operations a sliced file
//! already performs (usually inside its start G-code) so it can avoid
//! doubling them up, or comment them out when the user disables them.

use std::collections::BTreeSet;

/// An operation kind that can be embedded in sliced G-code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EmbeddedOp {
    /// G28 homing
    Homing,
    /// QUAD_GANTRY_LEVEL
    QuadGantryLevel,
    /// Z_TILT_ADJUST
    ZTilt,
    /// BED_MESH_CALIBRATE
    BedMesh,
    /// Nozzle cleaning macro
    NozzleClean,
}

impl EmbeddedOp {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            EmbeddedOp::Homing => "Homing",
            EmbeddedOp::QuadGantryLevel => "Quad Gantry Level",
            EmbeddedOp::ZTilt => "Z-Tilt Adjust",
            EmbeddedOp::BedMesh => "Bed Mesh",
            EmbeddedOp::NozzleClean => "Nozzle Clean",
        }
    }
}

/// One detected operation with its location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedOperation {
    /// What was found
    pub op: EmbeddedOp,
    /// One-based line number in the file
    pub line_number: usize,
    /// The full line as found
    pub line: String,
}

/// Classify a single G-code line, ignoring comments
///
/// Lines that are entirely comments never match; a trailing comment does
/// not hide a command.
pub fn classify_line(line: &str) -> Option<EmbeddedOp> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(';') {
        return None;
    }
    let command = trimmed.split(';').next().unwrap_or("").trim().to_uppercase();
    if command.is_empty() {
        return None;
    }

    let first = command.split_whitespace().next().unwrap_or("");
    match first {
        "G28" => Some(EmbeddedOp::Homing),
        "QUAD_GANTRY_LEVEL" => Some(EmbeddedOp::QuadGantryLevel),
        "Z_TILT_ADJUST" => Some(EmbeddedOp::ZTilt),
        "BED_MESH_CALIBRATE" => Some(EmbeddedOp::BedMesh),
        "CLEAN_NOZZLE" | "NOZZLE_CLEAN" | "WIPE_NOZZLE" | "NOZZLE_WIPE" => {
            Some(EmbeddedOp::NozzleClean)
        }
        _ => None,
    }
}

/// Scan file content for embedded operations
pub fn detect_operations(content: &str) -> Vec<DetectedOperation> {
    let mut found = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if let Some(op) = classify_line(line) {
            found.push(DetectedOperation {
                op,
                line_number: idx + 1,
                line: line.to_string(),
            });
        }
    }
    found
}

/// The distinct operation kinds present in a scan result
pub fn detected_kinds(ops: &[DetectedOperation]) -> BTreeSet<EmbeddedOp> {
    ops.iter().map(|d| d.op).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_start_gcode_ops() {
        let content = "\
; generated by slicer\n\
G28\n\
QUAD_GANTRY_LEVEL\n\
BED_MESH_CALIBRATE PROFILE=default\n\
G1 Z0.2 F300\n";
        let ops = detect_operations(content);
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].op, EmbeddedOp::Homing);
        assert_eq!(ops[0].line_number, 2);
        assert_eq!(ops[1].op, EmbeddedOp::QuadGantryLevel);
        assert_eq!(ops[2].op, EmbeddedOp::BedMesh);
    }

    #[test]
    fn test_comments_do_not_match() {
        assert_eq!(classify_line("; G28 would home here"), None);
        assert_eq!(classify_line("; HELIX_SKIP: G28"), None);
        // A trailing comment does not hide the command.
        assert_eq!(classify_line("G28 ; home all"), Some(EmbeddedOp::Homing));
    }

    #[test]
    fn test_g28_with_axes_matches() {
        assert_eq!(classify_line("G28 X Y"), Some(EmbeddedOp::Homing));
        // G280 is a different command.
        assert_eq!(classify_line("G280"), None);
    }

    #[test]
    fn test_nozzle_clean_synonyms() {
        for name in ["CLEAN_NOZZLE", "nozzle_clean", "Wipe_Nozzle"] {
            assert_eq!(classify_line(name), Some(EmbeddedOp::NozzleClean), "{name}");
        }
    }

    #[test]
    fn test_detected_kinds_deduplicates() {
        let content = "G28\nG28 Z\nBED_MESH_CALIBRATE\n";
        let ops = detect_operations(content);
        assert_eq!(ops.len(), 3);
        let kinds = detected_kinds(&ops);
        assert_eq!(kinds.len(), 2);
    }
}
