//! Printer state model: snapshot, shadow JSON, and cell derivation.

pub mod keys;
pub mod printer_state;
pub mod snapshot;

pub use printer_state::{merge_delta, ObjectSelection, PrinterState};
pub use snapshot::{HeaterReading, PrintState, PrinterSnapshot, ToolheadPosition};
