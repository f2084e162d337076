//! Sandboxed plugin host for Enclave.
//!
//! Installs plugins from manifests, runs each one in its own isolated
//! container, and talks to it over an authenticated, optionally encrypted
//! message channel with RPC on top.
//!
//! - [`PluginManager`] drives install, start, stop, update and uninstall
//!   and persists plugin records.
//! - [`SandboxManager`] owns one [`PluginSandbox`] per running plugin and
//!   routes `<pluginId>.<method>` calls.
//! - [`deps`] resolves, verifies and injects third-party libraries.
//! - [`Monitor`] turns sandbox telemetry into health status.
//! - [`Logger`] keeps a bounded, filterable log ring.

pub mod config;
pub mod deps;
mod error;
pub mod events;
mod fetch;
mod logger;
mod manager;
mod monitor;
mod policy;
pub mod sandbox;
mod sandbox_manager;

pub use config::{
    DependencySettings, HostConfig, IpcSettings, LoggingSettings, RpcSettings, SandboxSettings,
    StorageSettings,
};
pub use error::{HostError, HostResult};
pub use events::{
    DependencyEvent, EventBus, HostEvent, MonitorEvent, PluginEvent, SandboxEvent,
    SubscriptionId, UpdateEvent,
};
pub use fetch::HttpFetcher;
pub use logger::{LogEntry, LogFilter, LogLevel, Logger, LOG_STORAGE_KEY};
pub use manager::PluginManager;
pub use monitor::{HealthStatus, Monitor, MonitorConfig, PluginHealth, ResourceSummary};
pub use policy::{PolicyConfig, PolicyEngine, PolicyMode};
pub use sandbox::backend::{Container, ContainerCommand, ContainerSpec, IsolationBackend};
pub use sandbox::local::{BlobRegistry, LocalBackend};
pub use sandbox::{ChannelSettings, Content, PluginSandbox};
pub use sandbox_manager::{SandboxManager, ViolationPolicy};
