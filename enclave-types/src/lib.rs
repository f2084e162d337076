//! Core type definitions for the Enclave plugin host.
//!
//! This crate defines the plain data shared by the host and by guest
//! contexts:
//! - Plugin and message identifiers
//! - Wall-clock millisecond timestamps
//! - Plugin manifests, lifecycle state and persisted plugin records
//! - Sandbox resource limits, metrics and telemetry reports
//! - The capability permission model
//! - The `Fetcher` network abstraction used by the dependency loader and
//!   by the guest SDK's wrapped network primitive
//!
//! Nothing in here performs isolation or messaging; those live in
//! `enclave-ipc`, `enclave-sdk` and `enclave-host`.

pub mod fetch;
mod ids;
mod limits;
mod manifest;
mod permissions;
mod state;
mod telemetry;
mod timestamp;

pub use fetch::{FetchError, FetchRequest, FetchResponse, Fetcher, StaticFetcher};
pub use ids::{MessageId, PluginId};
pub use limits::{
    CspAllowList, Resource, ResourceLimits, ResourceUsage, SandboxMetrics, SandboxOptions,
    SandboxOverrides,
};
pub use manifest::{
    ApiDeclaration, EntryPoints, LibraryDependency, LibraryKind, PluginManifest,
    ResourceDeclaration,
};
pub use permissions::{Permission, PermissionSet};
pub use state::{PluginInfo, PluginState, PluginStatus};
pub use telemetry::TelemetryReport;
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid plugin id: {0:?}")]
    InvalidPluginId(String),

    #[error("invalid version '{version}': {source}")]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },

    #[error("unknown permission: {0}")]
    UnknownPermission(String),
}
