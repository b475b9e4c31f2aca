//! Compact layer index for streaming G-code access.
//!
//! Instead of holding parsed toolpaths in memory, the index stores the
//! file byte ranges needed to load layers on demand. Each entry is ~24
//! bytes against ~80KB for a parsed layer, which is what makes
//! gigabyte-class files workable on memory-constrained boards.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Instant;

use helix_core::error::{Error, FileError, Result};

/// Z tolerance for layer-boundary detection, millimetres
pub const Z_EPSILON: f32 = 0.001;

/// How many leading lines are searched for filament color metadata
const COLOR_SCAN_HEAD_LINES: usize = 1000;
/// Size of the trailing window searched when the head has no metadata
const COLOR_SCAN_TAIL_BYTES: u64 = 32 * 1024;

/// Entry flag: layer contains at least one extrusion move
pub const FLAG_HAS_EXTRUSION: u16 = 1 << 0;

/// Byte range and metadata for one layer
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamingLayerEntry {
    /// Byte offset in file where the layer starts
    pub file_offset: u64,
    /// Number of bytes in this layer
    pub byte_length: u32,
    /// Z coordinate of this layer, millimetres
    pub z_height: f32,
    /// Number of G-code lines in this layer
    pub line_count: u16,
    /// Flag bits, see [`FLAG_HAS_EXTRUSION`]
    pub flags: u16,
}

impl StreamingLayerEntry {
    /// Whether this entry has been populated
    pub fn is_valid(&self) -> bool {
        self.byte_length > 0
    }
}

/// Statistics collected while building an index
#[derive(Debug, Clone, Default)]
pub struct LayerIndexStats {
    /// Number of layers found
    pub total_layers: usize,
    /// Total G-code lines processed
    pub total_lines: usize,
    /// Total file size in bytes
    pub total_bytes: u64,
    /// Minimum layer Z height
    pub min_z: f32,
    /// Maximum layer Z height
    pub max_z: f32,
    /// Count of moves that advance the extruder
    pub extrusion_moves: usize,
    /// Count of moves without extrusion
    pub travel_moves: usize,
    /// Wall time spent building the index, milliseconds
    pub build_time_ms: f64,
    /// Filament color hex (e.g. "#26A69A") from slicer metadata, empty if none
    pub filament_color: String,
}

/// Layer index built in a single pass over a G-code file
///
/// Layer boundaries are detected on either a movement whose Z exceeds
/// the current layer height by more than [`Z_EPSILON`], or a
/// layer-change marker comment armed for the next movement line.
#[derive(Debug, Default)]
pub struct LayerIndex {
    entries: Vec<StreamingLayerEntry>,
    stats: LayerIndexStats,
    source_path: String,
}

impl LayerIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the index from a file on disk
    ///
    /// Returns an error without partial state on I/O failure or an empty
    /// file.
    pub fn build_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::File(FileError::LocalIo {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        let mut index = Self::build_from_reader(BufReader::new(file), &path.display().to_string())?;

        if index.stats.filament_color.is_empty() {
            index.stats.filament_color = scan_tail_for_color(path, index.stats.total_bytes);
        }
        Ok(index)
    }

    /// Build the index from any buffered reader
    ///
    /// `source` names the input for diagnostics and [`Self::source_path`].
    pub fn build_from_reader<R: BufRead>(mut reader: R, source: &str) -> Result<Self> {
        let started = Instant::now();

        let mut entries: Vec<StreamingLayerEntry> = Vec::new();
        let mut stats = LayerIndexStats::default();

        let mut offset: u64 = 0;
        let mut current_z: f32 = 0.0;
        let mut last_e: f32 = 0.0;
        let mut pending_layer_marker = false;
        let mut open_line_count: u32 = 0;

        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).map_err(|e| {
                Error::File(FileError::LocalIo {
                    path: source.to_string(),
                    reason: e.to_string(),
                })
            })?;
            if read == 0 {
                break;
            }
            let line_offset = offset;
            offset += read as u64;
            stats.total_lines += 1;
            open_line_count += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(comment) = trimmed.strip_prefix(';') {
                if is_layer_marker(comment) {
                    pending_layer_marker = true;
                } else if stats.filament_color.is_empty()
                    && stats.total_lines <= COLOR_SCAN_HEAD_LINES
                {
                    if let Some(color) = parse_color_comment(comment) {
                        stats.filament_color = color;
                    }
                }
                continue;
            }

            let Some(movement) = parse_movement(trimmed) else {
                continue;
            };

            if movement.reset_e {
                if let Some(e) = movement.e {
                    last_e = e;
                }
                continue;
            }

            let extruding = match movement.e {
                Some(e) => {
                    let advanced = e > last_e;
                    last_e = e;
                    advanced
                }
                None => false,
            };
            if extruding {
                stats.extrusion_moves += 1;
            } else {
                stats.travel_moves += 1;
            }

            let z = movement.z.unwrap_or(current_z);
            let new_layer = pending_layer_marker || z > current_z + Z_EPSILON;

            if new_layer {
                pending_layer_marker = false;
                // The boundary line belongs to the layer it opens; lines
                // counted since the previous boundary close that layer.
                let closing_lines = open_line_count.saturating_sub(1);
                if let Some(last) = entries.last_mut() {
                    last.byte_length = (line_offset - last.file_offset) as u32;
                    last.line_count = clamp_u16(closing_lines);
                }
                // The first entry reaches back to offset 0 so that the
                // entries partition the file without a leading gap.
                let entry_offset = if entries.is_empty() { 0 } else { line_offset };
                entries.push(StreamingLayerEntry {
                    file_offset: entry_offset,
                    byte_length: 0,
                    z_height: z.max(current_z),
                    line_count: 0,
                    flags: 0,
                });
                open_line_count = 1;
            }
            if extruding {
                if let Some(last) = entries.last_mut() {
                    last.flags |= FLAG_HAS_EXTRUSION;
                }
            }
            if z > current_z + Z_EPSILON {
                current_z = z;
            }
        }

        if let Some(last) = entries.last_mut() {
            last.byte_length = (offset - last.file_offset) as u32;
            last.line_count = clamp_u16(open_line_count);
        }

        if entries.is_empty() {
            return Err(Error::File(FileError::EmptyFile {
                path: source.to_string(),
            }));
        }

        stats.total_layers = entries.len();
        stats.total_bytes = offset;
        stats.min_z = entries.first().map(|e| e.z_height).unwrap_or(0.0);
        stats.max_z = entries.last().map(|e| e.z_height).unwrap_or(0.0);
        stats.build_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        tracing::debug!(
            "Indexed {}: {} layers, {} lines, {} bytes in {:.1}ms",
            source,
            stats.total_layers,
            stats.total_lines,
            stats.total_bytes,
            stats.build_time_ms
        );

        Ok(Self {
            entries,
            stats,
            source_path: source.to_string(),
        })
    }

    /// Number of indexed layers
    pub fn layer_count(&self) -> usize {
        self.entries.len()
    }

    /// Entry for a layer, or `None` when out of range
    pub fn entry(&self, layer: usize) -> Option<StreamingLayerEntry> {
        self.entries.get(layer).copied()
    }

    /// Z height for a layer, or 0.0 when out of range
    pub fn layer_z(&self, layer: usize) -> f32 {
        self.entries.get(layer).map(|e| e.z_height).unwrap_or(0.0)
    }

    /// Find the layer whose Z height is nearest to `z`
    ///
    /// Below the first layer returns 0; above the last returns the last
    /// index; equidistant between two layers resolves to the higher one.
    /// Returns `None` only for an empty index.
    pub fn find_layer_at_z(&self, z: f32) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        if z <= self.entries[0].z_height {
            return Some(0);
        }
        if z >= self.entries[last].z_height {
            return Some(last);
        }

        let upper = self
            .entries
            .partition_point(|e| e.z_height < z)
            .min(last);
        let lower = upper.saturating_sub(1);
        let below = z - self.entries[lower].z_height;
        let above = self.entries[upper].z_height - z;
        if below < above {
            Some(lower)
        } else {
            Some(upper)
        }
    }

    /// Build statistics
    pub fn stats(&self) -> &LayerIndexStats {
        &self.stats
    }

    /// Whether the index holds at least one layer
    pub fn is_valid(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Path given to [`Self::build_from_file`]
    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    /// Approximate heap footprint of this index
    pub fn memory_usage_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.entries.capacity() * std::mem::size_of::<StreamingLayerEntry>()
    }

    /// Drop all entries and statistics
    pub fn clear(&mut self) {
        self.entries = Vec::new();
        self.stats = LayerIndexStats::default();
        self.source_path.clear();
    }
}

fn clamp_u16(v: u32) -> u16 {
    v.min(u32::from(u16::MAX)) as u16
}

/// Parsed fields of one movement command
struct Movement {
    z: Option<f32>,
    e: Option<f32>,
    /// G92: the E word redefines the extruder position
    reset_e: bool,
}

/// Parse a movement (G0/G1) or extruder reset (G92) line
fn parse_movement(line: &str) -> Option<Movement> {
    let mut words = line.split_whitespace();
    let code = words.next()?;
    let reset_e = code.eq_ignore_ascii_case("G92");
    let is_move = code.eq_ignore_ascii_case("G0")
        || code.eq_ignore_ascii_case("G1")
        || code.eq_ignore_ascii_case("G00")
        || code.eq_ignore_ascii_case("G01");
    if !is_move && !reset_e {
        return None;
    }

    let mut z = None;
    let mut e = None;
    for word in words {
        if word.starts_with(';') {
            break;
        }
        // Words with a non-ASCII lead byte are not axis words.
        if !word.is_char_boundary(1) {
            continue;
        }
        let (axis, value) = word.split_at(1);
        let Ok(value) = value.parse::<f32>() else {
            continue;
        };
        match axis {
            "Z" | "z" => z = Some(value),
            "E" | "e" => e = Some(value),
            _ => {}
        }
    }
    if reset_e {
        // G92 without an E word does not touch the extruder axis.
        e?;
    }
    Some(Movement { z, e, reset_e })
}

/// Recognise slicer layer-change markers in a comment body
fn is_layer_marker(comment: &str) -> bool {
    let c = comment.trim();
    c.eq_ignore_ascii_case("LAYER_CHANGE")
        || c.to_ascii_uppercase().starts_with("LAYER:")
        || c.to_ascii_lowercase().starts_with("layer ")
}

/// Parse `key = #RRGGBB[AA]` filament color metadata from a comment body
fn parse_color_comment(comment: &str) -> Option<String> {
    let lowered = comment.to_ascii_lowercase();
    const KEYS: [&str; 4] = [
        "extruder_colour",
        "extruder_color",
        "filament_colour",
        "filament_color",
    ];
    if !KEYS.iter().any(|k| lowered.contains(k)) {
        return None;
    }
    let hash = comment.find('#')?;
    let hex: String = comment[hash + 1..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    match hex.len() {
        6 => Some(format!("#{}", hex.to_uppercase())),
        8 => Some(format!("#{}", hex[..6].to_uppercase())),
        _ => None,
    }
}

/// Search the last [`COLOR_SCAN_TAIL_BYTES`] of a file for color metadata
fn scan_tail_for_color(path: &Path, file_size: u64) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let start = file_size.saturating_sub(COLOR_SCAN_TAIL_BYTES);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut tail = String::new();
    if file.read_to_string(&mut tail).is_err() {
        return String::new();
    }
    for line in tail.lines() {
        if let Some(comment) = line.trim().strip_prefix(';') {
            if let Some(color) = parse_color_comment(comment) {
                return color;
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn index_of(content: &str) -> LayerIndex {
        LayerIndex::build_from_reader(Cursor::new(content.to_string()), "test.gcode").unwrap()
    }

    #[test]
    fn test_synthetic_two_layer_file() {
        let content = "G1 Z0.2 E0.1\nG1 X10 E0.2\n;LAYER_CHANGE\nG1 Z0.4 E0.3\nG1 X20 E0.4\n";
        let index = index_of(content);

        assert_eq!(index.layer_count(), 2);
        assert!((index.layer_z(0) - 0.2).abs() < 1e-6);
        assert!((index.layer_z(1) - 0.4).abs() < 1e-6);
        assert_eq!(index.find_layer_at_z(0.35), Some(1));
    }

    #[test]
    fn test_non_ascii_words_are_skipped() {
        // A multi-byte lead character must not split mid-codepoint.
        let content = "G1 Z0.2 E0.1\nG1 X10 é5 E0.5\n;LAYER_CHANGE\nG1 Z0.4 E0.6\nG1 X20 E0.7\n";
        let index = index_of(content);

        assert_eq!(index.layer_count(), 2);
        assert!((index.layer_z(0) - 0.2).abs() < 1e-6);
        assert!((index.layer_z(1) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_entries_partition_file() {
        let content = "; header\nG1 Z0.2 E0.1\nG1 X10 E0.2\nG1 Z0.4 E0.3\nG1 X20 E0.4\nG1 Z0.6 E0.5\n";
        let index = index_of(content);

        let total: u64 = (0..index.layer_count())
            .map(|i| u64::from(index.entry(i).unwrap().byte_length))
            .sum();
        assert_eq!(total, content.len() as u64);

        // No gaps or overlaps when concatenated by offset.
        let mut expected_offset = 0u64;
        for i in 0..index.layer_count() {
            let entry = index.entry(i).unwrap();
            assert_eq!(entry.file_offset, expected_offset);
            expected_offset += u64::from(entry.byte_length);
        }
    }

    #[test]
    fn test_empty_file_fails_without_partial_state() {
        let err = LayerIndex::build_from_reader(Cursor::new(String::new()), "empty.gcode");
        assert!(err.is_err());

        let err = LayerIndex::build_from_reader(
            Cursor::new("; only comments\n; no moves\n".to_string()),
            "comments.gcode",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_find_layer_boundaries() {
        let content = "G1 Z0.2 E1\nG1 Z0.4 E2\nG1 Z0.6 E3\n";
        let index = index_of(content);

        assert_eq!(index.find_layer_at_z(0.0), Some(0));
        assert_eq!(index.find_layer_at_z(9.0), Some(2));
        // Equidistant between 0.2 and 0.4 resolves high.
        assert_eq!(index.find_layer_at_z(0.3), Some(1));
        // Nearer the lower neighbour.
        assert_eq!(index.find_layer_at_z(0.24), Some(0));
    }

    #[test]
    fn test_marker_without_z_change_starts_layer() {
        let content = "G1 Z0.2 E1\nG1 X5 E2\n;LAYER:1\nG1 X9 E3\n";
        let index = index_of(content);
        assert_eq!(index.layer_count(), 2);
        // Marker layer keeps the current Z.
        assert!((index.layer_z(1) - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_z_hop_within_tolerance_ignored() {
        let content = "G1 Z0.2 E1\nG1 Z0.2005 X5 E2\nG1 X9 E3\n";
        let index = index_of(content);
        assert_eq!(index.layer_count(), 1);
    }

    #[test]
    fn test_extrusion_and_travel_counts() {
        let content = "G1 Z0.2 E0.5\nG0 X10\nG1 X20 E1.0\nG92 E0\nG1 X30 E0.4\n";
        let index = index_of(content);
        // Z move with E advance, X move with E advance, post-reset advance.
        assert_eq!(index.stats().extrusion_moves, 3);
        assert_eq!(index.stats().travel_moves, 1);
    }

    #[test]
    fn test_color_from_header_comment() {
        let content = "; filament_colour = #26A69A\nG1 Z0.2 E1\n";
        let index = index_of(content);
        assert_eq!(index.stats().filament_color, "#26A69A");
    }

    #[test]
    fn test_color_with_alpha_truncated() {
        let content = "; extruder_colour = #26a69aff\nG1 Z0.2 E1\n";
        let index = index_of(content);
        assert_eq!(index.stats().filament_color, "#26A69A");
    }

    #[test]
    fn test_clear_releases_state() {
        let mut index = index_of("G1 Z0.2 E1\n");
        assert!(index.is_valid());
        index.clear();
        assert!(!index.is_valid());
        assert_eq!(index.layer_count(), 0);
        assert_eq!(index.stats().total_bytes, 0);
    }
}
