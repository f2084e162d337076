//! Error types for guest contexts.

use enclave_types::Permission;
use thiserror::Error;

/// Result type for guest operations.
pub type GuestResult<T> = Result<T, GuestError>;

/// Errors raised inside a sandbox guest.
#[derive(Debug, Error)]
pub enum GuestError {
    /// The plugin did not declare the permission an API needs.
    #[error("permission denied: {0}")]
    PermissionDenied(Permission),

    /// Entry source does not evaluate to a known module.
    #[error("no module registered for source digest {0}")]
    UnknownModule(String),

    /// A plugin lifecycle hook failed.
    #[error("module hook '{hook}' failed: {message}")]
    Hook { hook: &'static str, message: String },

    #[error("component already registered: {0}")]
    DuplicateComponent(String),

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("element already exists: {0}")]
    DuplicateElement(String),

    /// Script content failed its integrity attribute.
    #[error("integrity check failed for {element}: {message}")]
    Integrity { element: String, message: String },

    /// The guest runtime has stopped.
    #[error("guest runtime detached")]
    Detached,

    #[error("ipc error: {0}")]
    Ipc(#[from] enclave_ipc::IpcError),

    #[error("rpc error: {0}")]
    Rpc(#[from] enclave_ipc::RpcError),

    #[error("storage error: {0}")]
    Storage(#[from] enclave_storage::StorageError),

    #[error("fetch error: {0}")]
    Fetch(#[from] enclave_types::FetchError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
