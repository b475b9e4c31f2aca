//! Toolpath extraction for a single layer's byte range.
//!
//! Parses the movement commands inside one layer into drawable segments.
//! A move is an extrusion when the E axis advances positively, otherwise
//! a travel.

/// Kind of a toolpath segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Material-depositing move
    Extrude,
    /// Repositioning move
    Travel,
}

/// Point on the toolpath, millimetres
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PathPoint {
    /// X coordinate
    pub x: f32,
    /// Y coordinate
    pub y: f32,
    /// Z coordinate
    pub z: f32,
}

/// One straight move between two points
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    /// Start point
    pub from: PathPoint,
    /// End point
    pub to: PathPoint,
    /// Extrusion or travel
    pub kind: SegmentKind,
}

/// Parsed contents of one layer
#[derive(Debug, Clone, Default)]
pub struct LayerData {
    /// Zero-based layer number
    pub layer: usize,
    /// Segments in file order
    pub segments: Vec<Segment>,
    /// Raw byte length this layer occupied in the file
    pub raw_bytes: usize,
}

impl LayerData {
    /// Approximate resident size for cache accounting
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.segments.capacity() * std::mem::size_of::<Segment>()
    }

    /// Number of extrusion segments
    pub fn extrusion_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Extrude)
            .count()
    }
}

/// Parse the raw bytes of one layer into segments
///
/// `start` seeds the toolhead position from the end of the previous
/// layer; pass `None` when unknown and leading moves will start from the
/// first commanded position.
pub fn parse_layer(layer: usize, bytes: &[u8], start: Option<PathPoint>) -> LayerData {
    let text = String::from_utf8_lossy(bytes);
    let mut segments = Vec::new();

    let mut position = start.unwrap_or_default();
    let mut last_e: f32 = 0.0;
    let mut have_position = start.is_some();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        let mut words = trimmed.split_whitespace();
        let Some(code) = words.next() else { continue };

        if code.eq_ignore_ascii_case("G92") {
            for word in words {
                if let Some(value) = axis_value(word, 'E') {
                    last_e = value;
                }
            }
            continue;
        }
        let is_move = code.eq_ignore_ascii_case("G0")
            || code.eq_ignore_ascii_case("G1")
            || code.eq_ignore_ascii_case("G00")
            || code.eq_ignore_ascii_case("G01");
        if !is_move {
            continue;
        }

        let mut target = position;
        let mut e = None;
        let mut moved_xy = false;
        for word in words {
            if word.starts_with(';') {
                break;
            }
            // Lossy decoding can leave multi-byte replacement chars;
            // only an ASCII lead byte can start an axis word.
            if !word.is_char_boundary(1) {
                continue;
            }
            let (axis, rest) = word.split_at(1);
            let Ok(value) = rest.parse::<f32>() else {
                continue;
            };
            match axis.to_ascii_uppercase().as_str() {
                "X" => {
                    target.x = value;
                    moved_xy = true;
                }
                "Y" => {
                    target.y = value;
                    moved_xy = true;
                }
                "Z" => target.z = value,
                "E" => e = Some(value),
                _ => {}
            }
        }

        let kind = match e {
            Some(e) if e > last_e => SegmentKind::Extrude,
            _ => SegmentKind::Travel,
        };
        if let Some(e) = e {
            last_e = e;
        }

        if have_position && (moved_xy || target.z != position.z) {
            segments.push(Segment {
                from: position,
                to: target,
                kind,
            });
        }
        position = target;
        have_position = true;
    }

    LayerData {
        layer,
        segments,
        raw_bytes: bytes.len(),
    }
}

fn axis_value(word: &str, axis: char) -> Option<f32> {
    let mut chars = word.chars();
    if !chars.next()?.eq_ignore_ascii_case(&axis) {
        return None;
    }
    chars.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extrude_vs_travel_classification() {
        let gcode = b"G1 Z0.4\nG1 X10 Y0 E0.5\nG0 X20 Y5\nG1 X30 Y5 E1.2\n";
        let data = parse_layer(3, gcode, Some(PathPoint::default()));

        assert_eq!(data.layer, 3);
        assert_eq!(data.segments.len(), 4);
        assert_eq!(data.segments[1].kind, SegmentKind::Extrude);
        assert_eq!(data.segments[2].kind, SegmentKind::Travel);
        assert_eq!(data.segments[3].kind, SegmentKind::Extrude);
        assert_eq!(data.extrusion_count(), 2);
    }

    #[test]
    fn test_e_reset_breaks_advance() {
        let gcode = b"G1 X5 E1.0\nG92 E0\nG1 X10 E0.5\n";
        let data = parse_layer(0, gcode, Some(PathPoint::default()));
        assert_eq!(data.segments.len(), 2);
        // Post-reset E0.5 still advances from the redefined zero.
        assert_eq!(data.segments[1].kind, SegmentKind::Extrude);
    }

    #[test]
    fn test_invalid_utf8_words_are_skipped() {
        // Lossy decoding turns the 0xFF into a multi-byte replacement
        // character; the word must be skipped, not split mid-codepoint.
        let gcode = b"G1 Z0.4\nG1 X5 \xFF5 E1.0\nG1 X10 E2.0\n";
        let data = parse_layer(0, gcode, Some(PathPoint::default()));
        assert_eq!(data.segments.len(), 3);
        assert_eq!(data.segments[1].kind, SegmentKind::Extrude);
        assert_eq!(data.segments[2].kind, SegmentKind::Extrude);
    }

    #[test]
    fn test_unknown_start_skips_first_move(){
        let gcode = b"G1 X5 Y5 E1.0\nG1 X10 Y5 E2.0\n";
        let data = parse_layer(0, gcode, None);
        // Without a seed position the first move only establishes one.
        assert_eq!(data.segments.len(), 1);
        assert_eq!(data.segments[0].from, PathPoint { x: 5.0, y: 5.0, z: 0.0 });
    }
}
