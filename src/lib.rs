//! # HelixScreen Printer Control Core
//!
//! Headless control layer for the HelixScreen touchscreen UI: talks
//! JSON-RPC to a Moonraker/Klipper host over WebSocket and maintains a
//! reactive model of the printer that UI bindings observe.
//!
//! ## Architecture
//!
//! The workspace is organized as focused crates under one facade:
//!
//! 1. **helix-core** - error taxonomy, reactive cell store, printer
//!    snapshot, capabilities, runtime configuration
//! 2. **helix-transport** - WebSocket JSON-RPC client, reconnect with
//!    exponential backoff, object discovery and classification
//! 3. **helix-ams** - multi-material backends (Happy Hare, AFC, mock)
//!    and the bridge that publishes their state to cells
//! 4. **helix-gcode** - streaming layer index, layer cache, embedded
//!    operation detector, out-of-place file modifier
//! 5. **helix-print** - operation sequencer with state-observed
//!    completion and the pre-print preparation orchestrator
//! 6. **helixscreen** (this crate) - host adapter and top-level wiring
//!
//! ## Getting started
//!
//! ```no_run
//! use helixscreen::{PrinterCore, RuntimeConfig};
//!
//! # fn main() -> helixscreen::Result<()> {
//! let core = PrinterCore::new(RuntimeConfig::default());
//! core.connect("ws://voron.local:7125/websocket")?;
//! # Ok(())
//! # }
//! ```
//!
//! Discovery runs after every (re)connect; once it completes, the
//! global [`state_store`] carries the printer's live state and UI code
//! subscribes to individual cells.

pub mod host;
pub mod runtime;

pub use host::HostApi;
pub use runtime::PrinterCore;

pub use helix_ams;
pub use helix_core;
pub use helix_gcode;
pub use helix_print;
pub use helix_transport;

pub use helix_core::{
    state_store, Capabilities, Capability, CapabilityState, Error, Result, RuntimeConfig,
};
pub use helix_print::{PrepOptions, PrintPreparation};
pub use helix_transport::{ConnectionState, RpcClient};

/// Initialize logging with the default configuration
///
/// Console output with `RUST_LOG` environment variable support.
/// Call once at application startup; subsequent calls fail.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging already initialized: {e}"))
}
