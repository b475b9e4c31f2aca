//! # HelixScreen Core
//!
//! Core types for the Printer Control Core. Provides the reactive state
//! store, printer state model, capability set with user overrides, the
//! error taxonomy, and runtime configuration.
//!
//! Everything here is display-toolkit agnostic: the UI layer binds to
//! cells by key and installs a [`store::UiScheduler`] so observer fan-out
//! happens on its thread.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod state;
pub mod store;

pub use capabilities::{
    resolve_known_macros, AmsType, Capabilities, Capability, CapabilityState, KnownMacros,
};
pub use config::{force_runout_modal, ModifierConfig, RuntimeConfig, StreamingConfig, TransportConfig};
pub use error::{AmsError, Error, FileError, Result, SequencerError, TransportError};
pub use state::{
    merge_delta, HeaterReading, ObjectSelection, PrintState, PrinterSnapshot, PrinterState,
    ToolheadPosition,
};
pub use store::{state_store, Cell, CellValue, ObserverId, StateStore, UiScheduler};
