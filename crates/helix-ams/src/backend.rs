//! Backend abstraction for multi-material systems.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use helix_core::error::Result;
use helix_core::AmsType;

use crate::types::{AmsEvent, AmsSystemInfo, GateInfo};

/// Callback for backend events. Invoked from whatever task observed
/// the change; receivers must marshal to the UI thread themselves.
pub type EventCallback = Arc<dyn Fn(AmsEvent, &str) + Send + Sync>;

/// Sink for G-code macros issued by AMS backends.
///
/// Implemented by the transport layer; backends never talk to the
/// socket directly, which keeps them testable against a recorder.
#[async_trait]
pub trait MacroSink: Send + Sync {
    /// Run a G-code script on the host and wait for acknowledgement
    async fn run_macro(&self, script: &str) -> Result<()>;
}

/// A multi-material backend (Happy Hare, AFC, or the mock)
///
/// Implementations own a snapshot of the system state, refresh it from
/// host status updates via [`AmsBackend::process_status_update`], and
/// emit [`AmsEvent`]s when it changes.
#[async_trait]
pub trait AmsBackend: Send + Sync {
    /// Which backend family this is
    fn ams_type(&self) -> AmsType;

    /// Start the backend; may issue discovery macros
    async fn start(&self) -> Result<()>;

    /// Stop the backend and release resources
    async fn stop(&self) -> Result<()>;

    /// Current system snapshot
    fn system_info(&self) -> AmsSystemInfo;

    /// Load filament from a gate to the extruder
    async fn load_gate(&self, gate: i32) -> Result<()>;

    /// Unload filament from the extruder
    async fn unload(&self) -> Result<()>;

    /// Select a gate without loading
    async fn select_gate(&self, gate: i32) -> Result<()>;

    /// Change to a tool, loading its mapped gate
    async fn select_tool(&self, tool: i32) -> Result<()>;

    /// Select the external bypass
    async fn select_bypass(&self) -> Result<()>;

    /// Home the selector
    async fn home(&self) -> Result<()>;

    /// Abort the operation in progress
    async fn cancel(&self) -> Result<()>;

    /// Push filament metadata for a gate back to the host
    async fn set_gate_info(&self, gate: &GateInfo) -> Result<()>;

    /// Remap a tool to a gate
    async fn set_tool_mapping(&self, tool: i32, gate: i32) -> Result<()>;

    /// Recover from a paused or error state
    async fn recover(&self) -> Result<()>;

    /// Feed a printer status delta into the backend
    ///
    /// Objects the backend does not recognize are ignored.
    fn process_status_update(&self, status: &Value);

    /// Register the single event callback, replacing any previous one
    fn set_event_callback(&self, callback: EventCallback);
}

/// Create the backend matching a detected AMS type
///
/// Returns `None` for [`AmsType::None`]; callers treat that as
/// "no AMS present" rather than an error.
pub fn create_backend(
    ams_type: AmsType,
    sink: Arc<dyn MacroSink>,
) -> Option<Arc<dyn AmsBackend>> {
    match ams_type {
        AmsType::None => None,
        AmsType::HappyHare => Some(Arc::new(crate::happy_hare::HappyHareBackend::new(sink))),
        AmsType::Afc => Some(Arc::new(crate::afc::AfcBackend::new(sink))),
    }
}
