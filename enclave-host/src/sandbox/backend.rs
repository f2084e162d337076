//! The seam between a sandbox and the platform that isolates it.

use crate::error::HostResult;
use async_trait::async_trait;
use enclave_ipc::{IpcConfig, PortEnd, RpcConfig};
use enclave_sdk::ScriptElement;
use enclave_types::{PermissionSet, PluginId};
use std::fmt;
use std::time::Duration;

/// Capabilities an isolated context can be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Scripts,
    SameOrigin,
    Forms,
    Popups,
    Modals,
    Downloads,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scripts => "allow-scripts",
            Self::SameOrigin => "allow-same-origin",
            Self::Forms => "allow-forms",
            Self::Popups => "allow-popups",
            Self::Modals => "allow-modals",
            Self::Downloads => "allow-downloads",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The exact capability set every plugin container gets.
pub const SANDBOX_CAPABILITIES: [Capability; 6] = [
    Capability::Scripts,
    Capability::SameOrigin,
    Capability::Forms,
    Capability::Popups,
    Capability::Modals,
    Capability::Downloads,
];

/// What a backend needs to build one container.
#[derive(Debug)]
pub struct ContainerSpec {
    pub plugin_id: PluginId,
    pub origin: String,
    pub capabilities: Vec<Capability>,
    pub permissions: PermissionSet,
    /// Guest end of the host channel.
    pub port: PortEnd,
    /// Guest-side bus configuration.
    pub ipc: IpcConfig,
    pub rpc: RpcConfig,
}

/// Management operations on a live container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerCommand {
    WriteDocument(String),
    LoadUrl(String),
    ApplyCsp(String),
    InstallReporter(Duration),
    InjectScript(ScriptElement),
    InjectStyles { id: String, css: String },
    RemoveElement(String),
}

/// A live isolated context.
#[async_trait]
pub trait Container: Send + Sync {
    /// Resolves once the context has loaded.
    async fn loaded(&mut self) -> HostResult<()>;

    /// Applies a command and waits for the guest to acknowledge it.
    async fn execute(&self, command: ContainerCommand) -> HostResult<()>;

    /// Publishes `bytes` under a temporary object URL.
    fn publish_blob(&self, bytes: Vec<u8>) -> String;

    fn revoke_blob(&self, url: &str);

    /// Tears the context down, running the guest's unload hook.
    async fn detach(&mut self) -> HostResult<()>;
}

/// Creates isolated contexts.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    async fn create(&self, spec: ContainerSpec) -> HostResult<Box<dyn Container>>;
}
