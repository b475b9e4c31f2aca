//! # HelixScreen Transport
//!
//! The JSON-RPC 2.0 WebSocket link to the printer host daemon
//! (Moonraker): request correlation with per-call timeouts, persistent
//! notification handlers, automatic reconnect with exponential backoff,
//! and the object-discovery sequence that runs after every connect.

pub mod client;
pub mod discovery;
pub mod jsonrpc;

pub use client::{
    ConnectionState, ErrorCallback, LifecycleCallback, NotificationHandler, RpcClient,
    StatusHandler, SuccessCallback, NOTIFY_KLIPPY_READY, NOTIFY_KLIPPY_SHUTDOWN,
    NOTIFY_STATUS_UPDATE,
};
pub use discovery::{detect_capabilities, run_discovery, DiscoveryResult, ObjectInventory};
pub use jsonrpc::{parse_frame, status_update_payload, InboundFrame, RpcRequest};
