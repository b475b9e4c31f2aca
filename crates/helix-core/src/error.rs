//! Error handling for the Printer Control Core
//!
//! Provides error types for all layers of the core:
//! - Transport errors (WebSocket / JSON-RPC related)
//! - Sequencer errors (operation execution)
//! - AMS errors (multi-material backends)
//! - File errors (host-side file operations)
//!
//! All error types use `thiserror` for ergonomic error handling. Failures
//! are reported through these enumerated kinds and callbacks; the core
//! never panics over recoverable conditions.

use thiserror::Error;

/// Transport error type
///
/// Represents errors on the JSON-RPC-over-WebSocket link to the printer
/// host daemon, including correlation timeouts and host error envelopes.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// No live session to the host
    #[error("Not connected to host")]
    NotConnected,

    /// A request's per-call deadline elapsed before a reply arrived
    #[error("Request {method} timed out after {timeout_ms}ms")]
    Timeout {
        /// The RPC method that timed out.
        method: String,
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The host returned a JSON-RPC error envelope
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// An inbound frame could not be decoded
    #[error("Failed to parse inbound frame: {reason}")]
    Parse {
        /// Why decoding failed.
        reason: String,
    },

    /// The WebSocket layer reported a failure
    #[error("WebSocket error: {reason}")]
    WebSocket {
        /// The underlying failure description.
        reason: String,
    },

    /// The host daemon reports a shutdown condition
    #[error("Host daemon is shut down: {reason}")]
    HostShutdown {
        /// The shutdown reason reported by the host.
        reason: String,
    },
}

/// Sequencer error type
///
/// Represents terminal conditions of the operation sequencer.
#[derive(Error, Debug, Clone)]
pub enum SequencerError {
    /// Operation did not reach its completion condition in time
    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    OperationTimeout {
        /// Display name of the operation.
        operation: String,
        /// The per-operation timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Sequencer is already executing a sequence
    #[error("Sequencer busy: {current}")]
    Busy {
        /// Name of the operation currently executing.
        current: String,
    },

    /// Queue mutation attempted while a sequence is running
    #[error("Queue is locked while running")]
    QueueLocked,

    /// The user aborted the sequence
    #[error("Sequence cancelled")]
    Cancelled,

    /// An operation's command was rejected by the host
    #[error("Operation '{operation}' failed: {reason}")]
    OperationFailed {
        /// Display name of the operation.
        operation: String,
        /// Failure description.
        reason: String,
    },
}

/// AMS backend error type
///
/// Immediate accept/reject results for backend operations. Completion of
/// accepted operations is reported through backend events, never through
/// these values.
#[derive(Error, Debug, Clone)]
pub enum AmsError {
    /// Backend has no live link to the host
    #[error("AMS backend not connected")]
    NotConnected,

    /// Backend is already executing an operation
    #[error("AMS busy: {action}")]
    Busy {
        /// Name of the action in progress.
        action: String,
    },

    /// Gate index outside the configured range
    #[error("Invalid gate {index} (max {max})")]
    InvalidGate {
        /// The requested global gate index.
        index: i32,
        /// Highest valid index.
        max: i32,
    },

    /// Gate exists but holds no usable filament
    #[error("Gate {index} has no filament available")]
    GateNotAvailable {
        /// The requested global gate index.
        index: i32,
    },

    /// Tool number outside the configured range
    #[error("Invalid tool {tool}")]
    InvalidTool {
        /// The requested tool number.
        tool: i32,
    },

    /// Operation is meaningless in the current state
    #[error("Wrong state: {message} ({suggestion})")]
    WrongState {
        /// Why the operation cannot run now.
        message: String,
        /// What the caller could do instead.
        suggestion: String,
    },
}

/// File operation error type
///
/// Host-side file operations (download, upload, delete) and local
/// streaming-index failures.
#[derive(Error, Debug, Clone)]
pub enum FileError {
    /// The named file does not exist on the host
    #[error("File not found: {path}")]
    NotFound {
        /// Path as known to the host.
        path: String,
    },

    /// A host-side file API call failed
    #[error("Host file operation failed on {path}: {reason}")]
    HostIo {
        /// Path as known to the host.
        path: String,
        /// Failure description.
        reason: String,
    },

    /// A local read failed while indexing or loading layers
    #[error("Local I/O error on {path}: {reason}")]
    LocalIo {
        /// Local filesystem path.
        path: String,
        /// Failure description.
        reason: String,
    },

    /// The file produced no usable index (empty or not G-code)
    #[error("File is empty or contains no layers: {path}")]
    EmptyFile {
        /// The offending path.
        path: String,
    },
}

/// Main error type for the Printer Control Core
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Sequencer error
    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    /// AMS error
    #[error(transparent)]
    Ams(#[from] AmsError),

    /// File error
    #[error(transparent)]
    File(#[from] FileError),

    /// Caller supplied an out-of-range or malformed argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::Timeout { .. })
                | Error::Sequencer(SequencerError::OperationTimeout { .. })
        )
    }

    /// Check if this is a not-connected error
    pub fn is_not_connected(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::NotConnected) | Error::Ams(AmsError::NotConnected)
        )
    }

    /// Check if this error was caused by a user-initiated abort
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Sequencer(SequencerError::Cancelled))
    }

    /// Check if this is a host shutdown condition
    pub fn is_host_shutdown(&self) -> bool {
        matches!(self, Error::Transport(TransportError::HostShutdown { .. }))
    }

    /// Short machine label for this error kind
    ///
    /// The UI layer keys toasts and badges off these labels; the
    /// `Display` form supplies the longer human message.
    pub fn label(&self) -> &'static str {
        match self {
            Error::Transport(TransportError::NotConnected) => "NOT_CONNECTED",
            Error::Transport(TransportError::Timeout { .. }) => "TIMEOUT",
            Error::Transport(TransportError::Rpc { .. }) => "RPC_ERROR",
            Error::Transport(TransportError::Parse { .. }) => "PARSE_ERROR",
            Error::Transport(TransportError::WebSocket { .. }) => "RPC_ERROR",
            Error::Transport(TransportError::HostShutdown { .. }) => "HOST_SHUTDOWN",
            Error::Sequencer(SequencerError::OperationTimeout { .. }) => "TIMEOUT",
            Error::Sequencer(SequencerError::Cancelled) => "CANCELLED",
            Error::Sequencer(SequencerError::Busy { .. }) => "BUSY",
            Error::Sequencer(_) => "WRONG_STATE",
            Error::Ams(AmsError::NotConnected) => "NOT_CONNECTED",
            Error::Ams(AmsError::Busy { .. }) => "BUSY",
            Error::Ams(AmsError::WrongState { .. }) => "WRONG_STATE",
            Error::Ams(_) => "INVALID_ARGUMENT",
            Error::File(_) => "FILE_IO",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Io(_) => "FILE_IO",
            Error::Other(_) => "ERROR",
        }
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
