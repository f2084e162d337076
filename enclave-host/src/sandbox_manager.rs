//! Owns every live sandbox and the host method table they share.

use crate::config::{HostConfig, SandboxSettings};
use crate::deps::{DependencyManager, ScriptTarget};
use crate::error::{HostError, HostResult};
use crate::events::{EventBus, SandboxEvent};
use crate::monitor::Monitor;
use crate::sandbox::backend::IsolationBackend;
use crate::sandbox::{ChannelSettings, Content, PluginSandbox};
use enclave_ipc::{CallOptions, MethodRegistry, RpcConfig, RpcError};
use enclave_types::{PermissionSet, PluginId, SandboxOptions, SandboxOverrides};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use tracing::{error, info, warn};

/// What happens to a sandbox that exceeds a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationPolicy {
    /// Emit `resource-violation` and keep running.
    #[default]
    Report,
    /// Emit `resource-violation`, then destroy the sandbox.
    Destroy,
}

struct Slot {
    sandbox: Arc<PluginSandbox>,
    permissions: PermissionSet,
}

struct ManagerInner {
    backend: Arc<dyn IsolationBackend>,
    defaults: SandboxOptions,
    violation_policy: ViolationPolicy,
    channel: ChannelSettings,
    rpc_config: RpcConfig,
    registry: MethodRegistry,
    sandboxes: RwLock<HashMap<PluginId, Slot>>,
    events: EventBus<SandboxEvent>,
    monitor: Monitor,
    dependencies: OnceLock<Arc<DependencyManager>>,
}

/// Creates, reloads and destroys sandboxes. Cheap to clone.
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<ManagerInner>,
}

impl SandboxManager {
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        settings: &SandboxSettings,
        channel: ChannelSettings,
        rpc_config: RpcConfig,
        monitor: Monitor,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                backend,
                defaults: settings.defaults.clone(),
                violation_policy: settings.violation_policy,
                channel,
                rpc_config,
                registry: MethodRegistry::new(),
                sandboxes: RwLock::new(HashMap::new()),
                events: EventBus::new(),
                monitor,
                dependencies: OnceLock::new(),
            }),
        }
    }

    pub fn from_config(
        config: &HostConfig,
        backend: Arc<dyn IsolationBackend>,
        monitor: Monitor,
    ) -> HostResult<Self> {
        Ok(Self::new(
            backend,
            &config.sandbox,
            ChannelSettings::from_config(&config.ipc)?,
            config.rpc.to_rpc_config(),
            monitor,
        ))
    }

    /// Lets [`Self::reload_sandbox`] carry a plugin's libraries over to the
    /// replacement sandbox. Only the first call has an effect.
    pub fn attach_dependencies(&self, dependencies: Arc<DependencyManager>) -> bool {
        self.inner.dependencies.set(dependencies).is_ok()
    }

    pub fn events(&self) -> &EventBus<SandboxEvent> {
        &self.inner.events
    }

    pub fn monitor(&self) -> &Monitor {
        &self.inner.monitor
    }

    pub fn defaults(&self) -> &SandboxOptions {
        &self.inner.defaults
    }

    pub fn violation_policy(&self) -> ViolationPolicy {
        self.inner.violation_policy
    }

    pub fn get_sandbox(&self, plugin_id: &PluginId) -> Option<Arc<PluginSandbox>> {
        self.inner
            .sandboxes
            .read()
            .unwrap()
            .get(plugin_id)
            .map(|slot| slot.sandbox.clone())
    }

    pub fn contains(&self, plugin_id: &PluginId) -> bool {
        self.inner.sandboxes.read().unwrap().contains_key(plugin_id)
    }

    pub fn plugin_ids(&self) -> Vec<PluginId> {
        let mut ids: Vec<PluginId> = self.inner.sandboxes.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Builds a sandbox with `overrides` merged over the configured defaults.
    /// Nothing is registered if the container cannot be created.
    pub async fn create_sandbox(
        &self,
        plugin_id: &PluginId,
        overrides: &SandboxOverrides,
        permissions: PermissionSet,
    ) -> HostResult<Arc<PluginSandbox>> {
        if self.contains(plugin_id) {
            return Err(HostError::SandboxExists(plugin_id.to_string()));
        }

        let sandbox = self.build(plugin_id, overrides, permissions.clone()).await?;

        let raced = {
            let mut sandboxes = self.inner.sandboxes.write().unwrap();
            if sandboxes.contains_key(plugin_id) {
                true
            } else {
                sandboxes.insert(
                    plugin_id.clone(),
                    Slot {
                        sandbox: sandbox.clone(),
                        permissions,
                    },
                );
                false
            }
        };
        if raced {
            let _ = sandbox.destroy().await;
            return Err(HostError::SandboxExists(plugin_id.to_string()));
        }

        info!(plugin_id = %plugin_id, "sandbox created");
        self.inner.events.emit(SandboxEvent::Created {
            plugin_id: plugin_id.clone(),
        });
        Ok(sandbox)
    }

    async fn build(
        &self,
        plugin_id: &PluginId,
        overrides: &SandboxOverrides,
        permissions: PermissionSet,
    ) -> HostResult<Arc<PluginSandbox>> {
        let options = self.inner.defaults.merged(overrides);
        let sandbox = Arc::new(PluginSandbox::new(
            plugin_id.clone(),
            options,
            self.inner.channel.clone(),
            self.inner.rpc_config.clone(),
            self.inner.registry.clone(),
        ));
        self.forward_events(&sandbox);

        if let Err(e) = sandbox
            .create_container(self.inner.backend.as_ref(), permissions)
            .await
        {
            error!(plugin_id = %plugin_id, error = %e, "failed to create sandbox container");
            let _ = sandbox.destroy().await;
            self.inner.events.emit(SandboxEvent::Error {
                plugin_id: plugin_id.clone(),
                message: e.to_string(),
            });
            return Err(e);
        }
        Ok(sandbox)
    }

    /// Re-emits a sandbox's events and feeds its metrics to the monitor.
    fn forward_events(&self, sandbox: &Arc<PluginSandbox>) {
        let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let instance = Arc::downgrade(sandbox);
        sandbox.events().on_any(move |event| {
            let Some(inner) = manager.upgrade() else {
                return;
            };
            if let SandboxEvent::Metrics { plugin_id, metrics } = event {
                inner.monitor.record(plugin_id, *metrics);
            }
            inner.events.emit(event.clone());

            let SandboxEvent::ResourceViolation { plugin_id, resource, .. } = event else {
                return;
            };
            if inner.violation_policy != ViolationPolicy::Destroy {
                return;
            }
            let Some(sandbox) = instance.upgrade() else {
                return;
            };
            warn!(plugin_id = %plugin_id, resource = %resource, "destroying sandbox over limit");
            let manager = SandboxManager { inner };
            let resource = *resource;
            tokio::spawn(async move {
                if manager.destroy_instance(&sandbox).await {
                    manager.inner.events.emit(SandboxEvent::Evicted {
                        plugin_id: sandbox.plugin_id().clone(),
                        resource,
                    });
                }
            });
        });
    }

    /// Destroys `sandbox` and unregisters it if it is still the live one.
    /// Returns whether it was.
    async fn destroy_instance(&self, sandbox: &Arc<PluginSandbox>) -> bool {
        let plugin_id = sandbox.plugin_id().clone();
        let removed = {
            let mut sandboxes = self.inner.sandboxes.write().unwrap();
            let live = sandboxes
                .get(&plugin_id)
                .is_some_and(|slot| Arc::ptr_eq(&slot.sandbox, sandbox));
            live && sandboxes.remove(&plugin_id).is_some()
        };
        if let Err(e) = sandbox.destroy().await {
            warn!(plugin_id = %plugin_id, error = %e, "sandbox teardown failed");
        }
        if removed {
            self.inner.events.emit(SandboxEvent::Destroyed { plugin_id });
        }
        removed
    }

    pub async fn destroy_sandbox(&self, plugin_id: &PluginId) -> HostResult<()> {
        let slot = self
            .inner
            .sandboxes
            .write()
            .unwrap()
            .remove(plugin_id)
            .ok_or_else(|| HostError::SandboxNotFound(plugin_id.to_string()))?;

        let result = slot.sandbox.destroy().await;
        if let Err(e) = &result {
            warn!(plugin_id = %plugin_id, error = %e, "sandbox teardown failed");
        }
        info!(plugin_id = %plugin_id, "sandbox destroyed");
        self.inner.events.emit(SandboxEvent::Destroyed {
            plugin_id: plugin_id.clone(),
        });
        result
    }

    /// Swaps in a freshly built sandbox running `content`. The old sandbox
    /// keeps running until the new one has loaded the plugin's libraries
    /// and its content.
    pub async fn reload_sandbox(
        &self,
        plugin_id: &PluginId,
        content: Content,
        overrides: &SandboxOverrides,
    ) -> HostResult<Arc<PluginSandbox>> {
        let permissions = self
            .inner
            .sandboxes
            .read()
            .unwrap()
            .get(plugin_id)
            .map(|slot| slot.permissions.clone())
            .ok_or_else(|| HostError::SandboxNotFound(plugin_id.to_string()))?;

        let sandbox = self.build(plugin_id, overrides, permissions.clone()).await?;
        if let Err(e) = self.prepare_replacement(plugin_id, &sandbox, content).await {
            let _ = sandbox.destroy().await;
            self.inner.events.emit(SandboxEvent::Error {
                plugin_id: plugin_id.clone(),
                message: e.to_string(),
            });
            return Err(e);
        }

        if let Some(dependencies) = self.inner.dependencies.get() {
            let target: Arc<dyn ScriptTarget> = sandbox.clone();
            dependencies.retarget(plugin_id, target);
        }
        let previous = self.inner.sandboxes.write().unwrap().insert(
            plugin_id.clone(),
            Slot {
                sandbox: sandbox.clone(),
                permissions,
            },
        );
        if let Some(old) = previous {
            if let Err(e) = old.sandbox.destroy().await {
                warn!(plugin_id = %plugin_id, error = %e, "old sandbox teardown failed");
            }
        }
        info!(plugin_id = %plugin_id, "sandbox reloaded");
        Ok(sandbox)
    }

    async fn prepare_replacement(
        &self,
        plugin_id: &PluginId,
        sandbox: &Arc<PluginSandbox>,
        content: Content,
    ) -> HostResult<()> {
        let Some(dependencies) = self.inner.dependencies.get() else {
            return sandbox.inject_content(content).await;
        };
        dependencies.load_into(plugin_id, &**sandbox).await?;
        let injected = sandbox.inject_content(content).await;
        if injected.is_err() {
            dependencies.loader().forget_target(sandbox.instance_id());
        }
        injected
    }

    pub async fn destroy_all(&self) {
        for plugin_id in self.plugin_ids() {
            if let Err(e) = self.destroy_sandbox(&plugin_id).await {
                warn!(plugin_id = %plugin_id, error = %e, "sandbox teardown failed");
            }
        }
    }

    // ── RPC ──────────────────────────────────────────────────────

    /// Registers a host method callable from every sandbox.
    pub fn register_rpc_method<F, Fut>(&self, name: &str, method: F) -> HostResult<()>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.inner.registry.register(name, method)?;
        Ok(())
    }

    pub fn unregister_rpc_method(&self, name: &str) -> bool {
        self.inner.registry.unregister(name)
    }

    /// Calls `method`, registered by `plugin_id` under `<pluginId>.<method>`,
    /// in that plugin's own sandbox.
    pub async fn call_plugin_method(
        &self,
        plugin_id: &PluginId,
        method: &str,
        args: Vec<Value>,
    ) -> HostResult<Value> {
        let sandbox = self
            .get_sandbox(plugin_id)
            .ok_or_else(|| HostError::SandboxNotFound(plugin_id.to_string()))?;
        sandbox
            .call(CallOptions::new(plugin_id.method(method), args))
            .await
    }

    /// Calls `<pluginId>.<method>` in the owning sandbox. Names no sandbox
    /// owns are served by the host method table.
    pub async fn call_rpc_method(&self, method: &str, args: Vec<Value>) -> HostResult<Value> {
        match self.route(method) {
            Some(sandbox) => sandbox.call(CallOptions::new(method, args)).await,
            None => Ok(self.inner.registry.invoke(method, args).await?),
        }
    }

    /// The sandbox whose plugin id is the longest `<id>.` prefix of `method`.
    fn route(&self, method: &str) -> Option<Arc<PluginSandbox>> {
        let sandboxes = self.inner.sandboxes.read().unwrap();
        sandboxes
            .iter()
            .filter(|(id, _)| {
                method
                    .strip_prefix(id.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
            })
            .max_by_key(|(id, _)| id.as_str().len())
            .map(|(_, slot)| slot.sandbox.clone())
    }
}
