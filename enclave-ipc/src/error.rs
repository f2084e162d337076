//! Error types for the IPC layer.

use thiserror::Error;

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;

/// Errors surfaced by [`crate::IpcBus`] and [`crate::RpcManager`] setup and sends.
///
/// Inbound protocol errors never become values of this type; they are
/// logged and dropped by the receive loop.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Invalid bus configuration (missing key or token).
    #[error("invalid IPC configuration: {0}")]
    Config(String),

    /// The peer context is gone.
    #[error("message port closed")]
    PortClosed,

    /// The port refused to deliver because the target origin does not match the peer.
    #[error("target origin '{target}' does not match peer origin '{peer}'")]
    OriginMismatch { target: String, peer: String },

    /// A request saw no correlated response in time.
    #[error("request on channel '{channel}' timed out after {timeout_ms}ms")]
    Timeout { channel: String, timeout_ms: u64 },

    /// A method name is already registered.
    #[error("method already registered: {0}")]
    DuplicateMethod(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] enclave_crypto::CryptoError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
