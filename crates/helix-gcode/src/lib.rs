//! # HelixScreen G-code Engine
//!
//! Streaming access to large G-code files for memory-constrained
//! hardware: a compact single-pass layer index, on-demand layer loading
//! behind a byte-budgeted LRU cache with prefetch, detection of
//! operations embedded by the slicer, and the skip-copy file modifier
//! used by the print preparation flow.

pub mod layer_cache;
pub mod layer_index;
pub mod modifier;
pub mod ops_detector;
pub mod toolpath;

pub use layer_cache::{LayerCache, StreamingController};
pub use layer_index::{
    LayerIndex, LayerIndexStats, StreamingLayerEntry, FLAG_HAS_EXTRUSION, Z_EPSILON,
};
pub use modifier::{FileModifier, HostFileApi, JobHistoryPatcher, SkipCopyResult, TempFile};
pub use ops_detector::{
    classify_line, detect_operations, detected_kinds, DetectedOperation, EmbeddedOp,
};
pub use toolpath::{parse_layer, LayerData, PathPoint, Segment, SegmentKind};
