//! Error types for epmapd.

use thiserror::Error;

/// Main error type for all endpoint-mapper operations.
#[derive(Debug, Error)]
pub enum EpmapError {
    /// I/O error during pipe/socket or lock file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration file, control line).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (unknown tag, bad chunk, missing terminator, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Declared trailing payload exceeds what we are willing to allocate.
    #[error("Payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: u32, max: u32 },

    /// A string does not fit into its fixed-size wire field.
    #[error("String of {len} bytes does not fit in a {max}-byte field")]
    StringTooLong { len: usize, max: usize },

    /// Peer closed the connection before a complete frame arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A bounded wait expired.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The cross-process master mutex could not be acquired in time.
    #[error("Timed out acquiring the master mutex")]
    MasterMutexTimeout,

    /// The well-known address exists but kept refusing new clients.
    #[error("Endpoint mapper address is busy")]
    ServerBusy,

    /// Failure reported by the external RPC transport.
    #[error("RPC transport error: {0}")]
    Rpc(String),
}

/// Result type alias using EpmapError.
pub type Result<T> = std::result::Result<T, EpmapError>;
