//! Error types for the plugin host.

use thiserror::Error;

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid manifest: {0}")]
    Manifest(#[from] enclave_types::Error),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin already installed: {0}")]
    PluginAlreadyInstalled(String),

    #[error("plugin '{plugin_id}' depends on '{dependency}', which is not installed")]
    DependencyNotInstalled {
        plugin_id: String,
        dependency: String,
    },

    #[error("plugin '{plugin_id}' requires {dependency}@{required}, found {installed}")]
    DependencyVersionMismatch {
        plugin_id: String,
        dependency: String,
        required: String,
        installed: String,
    },

    #[error("sandbox already exists: {0}")]
    SandboxExists(String),

    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("container not created for sandbox {0}")]
    ContainerNotCreated(String),

    #[error("container for {plugin_id} did not load within {timeout_ms}ms")]
    ContainerLoadTimeout { plugin_id: String, timeout_ms: u64 },

    #[error("isolation backend error: {0}")]
    Backend(String),

    #[error("no version of {name} satisfies {range}")]
    NoMatchingVersion { name: String, range: String },

    #[error("dependency {name}@{version} failed: {message}")]
    Dependency {
        name: String,
        version: String,
        message: String,
    },

    #[error("integrity check failed for {name}@{version}: {source}")]
    Integrity {
        name: String,
        version: String,
        #[source]
        source: enclave_crypto::CryptoError,
    },

    #[error("guest error: {0}")]
    Guest(#[from] enclave_sdk::GuestError),

    #[error("ipc error: {0}")]
    Ipc(#[from] enclave_ipc::IpcError),

    #[error("rpc error: {0}")]
    Rpc(#[from] enclave_ipc::RpcError),

    #[error("fetch error: {0}")]
    Fetch(#[from] enclave_types::FetchError),

    #[error("crypto error: {0}")]
    Crypto(#[from] enclave_crypto::CryptoError),

    #[error("storage error: {0}")]
    Storage(#[from] enclave_storage::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
