//! # HelixScreen AMS
//!
//! Multi-material (AMS) support: a uniform async backend interface with
//! Happy Hare, AFC and mock implementations, plus the bridge that
//! publishes AMS state into the reactive cell store.
//!
//! Backends translate host-specific status objects and macro surfaces
//! into the shared [`types`] model; the [`bridge`] is the only writer of
//! the `ams_*` cells.

pub mod afc;
pub mod backend;
pub mod bridge;
pub mod happy_hare;
pub mod mock;
pub mod types;

pub use afc::AfcBackend;
pub use backend::{create_backend, AmsBackend, EventCallback, MacroSink};
pub use bridge::{ams_bridge, AmsBridge};
pub use happy_hare::HappyHareBackend;
pub use mock::MockAmsBackend;
pub use types::{
    AmsAction, AmsEvent, AmsSystemInfo, AmsType, AmsUnit, GateInfo, GateStatus, MAX_GATES,
};
