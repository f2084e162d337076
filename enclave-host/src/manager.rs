//! Central plugin lifecycle manager.
//!
//! Validates manifests, drives install / start / stop / update /
//! uninstall, persists every state transition and exposes the
//! call-plugin-method surface to the host.

use crate::config::HostConfig;
use crate::deps::{DependencyLoader, DependencyManager, ScriptTarget, UpdateChecker};
use crate::error::{HostError, HostResult};
use crate::events::{EventBus, PluginEvent, SandboxEvent};
use crate::logger::{LogLevel, Logger};
use crate::monitor::Monitor;
use crate::policy::PolicyEngine;
use crate::sandbox::backend::IsolationBackend;
use crate::sandbox::Content;
use crate::sandbox_manager::SandboxManager;
use enclave_ipc::RpcError;
use enclave_storage::KeyValueStore;
use enclave_types::{
    Fetcher, PluginId, PluginInfo, PluginManifest, PluginStatus, SandboxOverrides,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const LOG_SOURCE: &str = "plugin-manager";

pub struct PluginManager {
    storage_prefix: String,
    update_interval: Duration,
    store: Arc<dyn KeyValueStore>,
    fetcher: Arc<dyn Fetcher>,
    policy: PolicyEngine,
    plugins: Arc<RwLock<HashMap<PluginId, PluginInfo>>>,
    sandboxes: SandboxManager,
    dependencies: Arc<DependencyManager>,
    updates: Arc<UpdateChecker>,
    monitor: Monitor,
    logger: Logger,
    events: EventBus<PluginEvent>,
}

impl PluginManager {
    /// `fetcher` serves entry code, styles and libraries; the backend
    /// creates the isolated containers.
    pub fn new(
        config: HostConfig,
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn IsolationBackend>,
        fetcher: Arc<dyn Fetcher>,
    ) -> HostResult<Self> {
        config.validate()?;

        let monitor = Monitor::new(config.monitor.clone());
        let sandboxes = SandboxManager::from_config(&config, backend, monitor.clone())?;
        let loader = Arc::new(DependencyLoader::new(fetcher.clone(), &config.dependencies));
        let dependencies = Arc::new(DependencyManager::new(loader));
        sandboxes.attach_dependencies(dependencies.clone());
        let logger = Logger::with_store(config.logging.clone(), store.clone());

        let manager = Self {
            storage_prefix: config.storage.prefix.clone(),
            update_interval: Duration::from_secs(config.dependencies.update_interval_secs),
            store,
            fetcher,
            policy: PolicyEngine::with_config(config.policy.clone()),
            plugins: Arc::new(RwLock::new(HashMap::new())),
            sandboxes,
            updates: Arc::new(UpdateChecker::new(dependencies.clone())),
            dependencies,
            monitor,
            logger,
            events: EventBus::new(),
        };
        manager.log_sandbox_events();
        manager.handle_evictions();
        Ok(manager)
    }

    /// Replaces the install policy from the config.
    #[must_use]
    pub fn with_policy(mut self, policy: PolicyEngine) -> Self {
        self.policy = policy;
        self
    }

    fn log_sandbox_events(&self) {
        let logger = self.logger.clone();
        let monitor = self.monitor.clone();
        self.sandboxes.events().on_any(move |event| match event {
            SandboxEvent::ResourceViolation {
                plugin_id,
                resource,
                metrics,
            } => {
                let usage = metrics.usage(*resource);
                logger.log(
                    LogLevel::Warn,
                    plugin_id.as_str(),
                    format!("{resource} limit exceeded"),
                    Some(json!({"used": usage.used, "limit": usage.limit})),
                );
            }
            SandboxEvent::Error { plugin_id, message } => {
                monitor.record_error(plugin_id, message.clone());
                logger.error(plugin_id.as_str(), message.clone());
            }
            _ => {}
        });
    }

    /// A sandbox destroyed by the violation policy leaves its plugin in
    /// `error` with the exceeded resource as cause.
    fn handle_evictions(&self) {
        let failures = self.failures();
        let dependencies = self.dependencies.clone();
        self.sandboxes.events().on("sandbox:evicted", move |event| {
            let SandboxEvent::Evicted { plugin_id, resource } = event else {
                return;
            };
            dependencies.release_plugin(plugin_id);
            let running = failures
                .plugins
                .read()
                .unwrap()
                .get(plugin_id)
                .is_some_and(|info| info.status() == PluginStatus::Running);
            if running {
                failures.record(
                    plugin_id,
                    format!("sandbox destroyed after exceeding its {resource} limit"),
                );
            }
        });
    }

    fn failures(&self) -> Failures {
        Failures {
            storage_prefix: self.storage_prefix.clone(),
            store: self.store.clone(),
            plugins: self.plugins.clone(),
            monitor: self.monitor.clone(),
            logger: self.logger.clone(),
            events: self.events.clone(),
        }
    }

    pub fn events(&self) -> &EventBus<PluginEvent> {
        &self.events
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    pub fn dependencies(&self) -> &Arc<DependencyManager> {
        &self.dependencies
    }

    pub fn updates(&self) -> &Arc<UpdateChecker> {
        &self.updates
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    // ================================================================
    // Queries
    // ================================================================

    pub fn get_plugin(&self, plugin_id: &PluginId) -> Option<PluginInfo> {
        self.plugins.read().unwrap().get(plugin_id).cloned()
    }

    /// Installed plugins sorted by id.
    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        let mut list: Vec<PluginInfo> = self.plugins.read().unwrap().values().cloned().collect();
        list.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        list
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.read().unwrap().len()
    }

    pub fn storage_key(&self, plugin_id: &PluginId) -> String {
        format!("{}{}", self.storage_prefix, plugin_id)
    }

    // ================================================================
    // Install / Uninstall
    // ================================================================

    /// Installs and starts a plugin. Any failure after validation rolls
    /// back the record, the persisted entry, the sandbox and its libraries.
    pub async fn install(&self, manifest: PluginManifest) -> HostResult<PluginInfo> {
        manifest.validate()?;
        let plugin_id = manifest.plugin_id()?;
        self.policy.check_manifest(&manifest)?;
        self.check_plugin_dependencies(&plugin_id, &manifest)?;

        let options = self
            .sandboxes
            .defaults()
            .merged(&SandboxOverrides::from_declared(manifest.resources));
        let mut info = PluginInfo::new(manifest, options);
        {
            let mut plugins = self.plugins.write().unwrap();
            if plugins.contains_key(&plugin_id) {
                return Err(HostError::PluginAlreadyInstalled(plugin_id.to_string()));
            }
            plugins.insert(plugin_id.clone(), info.clone());
        }
        info!(plugin_id = %plugin_id, version = %info.manifest.version, "installing plugin");

        let installed = async {
            self.persist(&info)?;
            self.provision(&plugin_id, &info.manifest).await?;
            info.transition(PluginStatus::Running);
            self.persist(&info)
        }
        .await;

        if let Err(e) = installed {
            error!(plugin_id = %plugin_id, error = %e, "install failed");
            self.teardown(&plugin_id).await;
            self.plugins.write().unwrap().remove(&plugin_id);
            if let Err(remove) = self.store.remove(&self.storage_key(&plugin_id)) {
                warn!(plugin_id = %plugin_id, error = %remove, "failed to remove plugin record");
            }
            self.logger
                .error(plugin_id.as_str(), format!("install failed: {e}"));
            self.events.emit(PluginEvent::Error {
                plugin_id,
                message: e.to_string(),
            });
            return Err(e);
        }

        self.plugins
            .write()
            .unwrap()
            .insert(plugin_id.clone(), info.clone());
        self.logger.info(
            plugin_id.as_str(),
            format!("installed version {}", info.manifest.version),
        );
        self.events.emit(PluginEvent::Install {
            plugin_id,
            version: info.manifest.version.clone(),
        });
        Ok(info)
    }

    /// Every declared plugin dependency must be installed at exactly the
    /// declared version.
    fn check_plugin_dependencies(
        &self,
        plugin_id: &PluginId,
        manifest: &PluginManifest,
    ) -> HostResult<()> {
        let plugins = self.plugins.read().unwrap();
        for (dependency, required) in &manifest.dependencies {
            let installed = PluginId::parse(dependency)
                .ok()
                .and_then(|id| plugins.get(&id))
                .ok_or_else(|| HostError::DependencyNotInstalled {
                    plugin_id: plugin_id.to_string(),
                    dependency: dependency.clone(),
                })?;
            let wanted = semver::Version::parse(required).map_err(|source| {
                enclave_types::Error::InvalidVersion {
                    version: required.clone(),
                    source,
                }
            })?;
            let have = installed.manifest.semver()?;
            if have != wanted {
                return Err(HostError::DependencyVersionMismatch {
                    plugin_id: plugin_id.to_string(),
                    dependency: dependency.clone(),
                    required: required.clone(),
                    installed: have.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Creates the sandbox, loads libraries, then injects entry code and styles.
    async fn provision(&self, plugin_id: &PluginId, manifest: &PluginManifest) -> HostResult<()> {
        let permissions = self.policy.permissions_for(manifest);
        let overrides = SandboxOverrides::from_declared(manifest.resources);
        let sandbox = self
            .sandboxes
            .create_sandbox(plugin_id, &overrides, permissions)
            .await?;

        let target: Arc<dyn ScriptTarget> = sandbox.clone();
        self.dependencies
            .load_for_plugin(plugin_id, target, &manifest.libraries)
            .await?;

        let entry = self.fetcher.get(&manifest.entry.main).await?;
        sandbox.inject_content(Content::Blob(entry.body)).await?;

        if let Some(styles) = &manifest.entry.styles {
            let css = self.fetcher.get(styles).await?.text()?;
            sandbox
                .inject_styles(&format!("{plugin_id}-styles"), css)
                .await?;
        }
        debug!(plugin_id = %plugin_id, "plugin provisioned");
        Ok(())
    }

    /// Destroys the sandbox, if any, and forgets the plugin's libraries.
    async fn teardown(&self, plugin_id: &PluginId) {
        if self.sandboxes.contains(plugin_id) {
            if let Err(e) = self.sandboxes.destroy_sandbox(plugin_id).await {
                warn!(plugin_id = %plugin_id, error = %e, "sandbox teardown failed");
            }
        }
        self.dependencies.release_plugin(plugin_id);
    }

    /// Stops the plugin and removes its record and persisted state.
    pub async fn uninstall(&self, plugin_id: &PluginId) -> HostResult<()> {
        if !self.plugins.read().unwrap().contains_key(plugin_id) {
            return Err(HostError::PluginNotFound(plugin_id.to_string()));
        }
        self.teardown(plugin_id).await;
        self.plugins.write().unwrap().remove(plugin_id);
        self.store.remove(&self.storage_key(plugin_id))?;
        self.store.remove(&format!("plugin_{plugin_id}_state"))?;
        self.monitor.remove(plugin_id);

        info!(plugin_id = %plugin_id, "plugin uninstalled");
        self.logger.info(plugin_id.as_str(), "uninstalled");
        self.events.emit(PluginEvent::Uninstall {
            plugin_id: plugin_id.clone(),
        });
        Ok(())
    }

    // ================================================================
    // Start / Stop / Update
    // ================================================================

    /// Re-provisions a stopped or failed plugin from its recorded manifest.
    /// On failure the plugin is left in `error` with the cause.
    pub async fn start(&self, plugin_id: &PluginId) -> HostResult<()> {
        let info = self
            .get_plugin(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;
        if info.status() == PluginStatus::Running && self.sandboxes.contains(plugin_id) {
            return Ok(());
        }

        if let Err(e) = self.provision(plugin_id, &info.manifest).await {
            self.teardown(plugin_id).await;
            self.record_failure(plugin_id, &e);
            return Err(e);
        }
        self.set_status(plugin_id, PluginStatus::Running)?;
        info!(plugin_id = %plugin_id, "plugin started");
        self.events.emit(PluginEvent::Start {
            plugin_id: plugin_id.clone(),
        });
        Ok(())
    }

    /// Runs the plugin's unload hook and destroys its sandbox.
    pub async fn stop(&self, plugin_id: &PluginId) -> HostResult<()> {
        let info = self
            .get_plugin(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;
        if info.status() == PluginStatus::Stopped {
            return Ok(());
        }
        self.teardown(plugin_id).await;
        self.set_status(plugin_id, PluginStatus::Stopped)?;
        info!(plugin_id = %plugin_id, "plugin stopped");
        self.events.emit(PluginEvent::Stop {
            plugin_id: plugin_id.clone(),
        });
        Ok(())
    }

    /// Stops the current version and installs `manifest` in its place.
    ///
    /// If the new version fails to install the original manifest is
    /// reinstalled. Should that fail too, the original manifest stays
    /// recorded in `error` state.
    pub async fn update(
        &self,
        plugin_id: &PluginId,
        manifest: PluginManifest,
    ) -> HostResult<PluginInfo> {
        manifest.validate()?;
        if manifest.plugin_id()? != *plugin_id {
            return Err(enclave_types::Error::InvalidManifest(format!(
                "update for '{plugin_id}' carries id '{}'",
                manifest.id
            ))
            .into());
        }
        self.policy.check_manifest(&manifest)?;
        let original = self
            .get_plugin(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;

        self.stop(plugin_id).await?;
        self.plugins.write().unwrap().remove(plugin_id);

        let from = original.manifest.version.clone();
        match self.install(manifest).await {
            Ok(info) => {
                info!(plugin_id = %plugin_id, %from, to = %info.manifest.version, "plugin updated");
                self.events.emit(PluginEvent::Update {
                    plugin_id: plugin_id.clone(),
                    from,
                    to: info.manifest.version.clone(),
                });
                Ok(info)
            }
            Err(e) => {
                warn!(plugin_id = %plugin_id, error = %e, "update failed, restoring {from}");
                self.restore_original(plugin_id, original, &e).await;
                Err(e)
            }
        }
    }

    async fn restore_original(
        &self,
        plugin_id: &PluginId,
        original: PluginInfo,
        cause: &HostError,
    ) {
        let was_stopped = original.status() == PluginStatus::Stopped;
        match self.install(original.manifest.clone()).await {
            Ok(_) if was_stopped => {
                if let Err(e) = self.stop(plugin_id).await {
                    warn!(plugin_id = %plugin_id, error = %e, "failed to stop restored plugin");
                }
            }
            Ok(_) => {}
            Err(rollback) => {
                error!(plugin_id = %plugin_id, error = %rollback, "rollback install failed");
                let mut info = original;
                info.fail(format!("update failed: {cause}; rollback failed: {rollback}"));
                if let Err(e) = self.persist(&info) {
                    warn!(plugin_id = %plugin_id, error = %e, "failed to persist plugin record");
                }
                self.plugins.write().unwrap().insert(plugin_id.clone(), info);
            }
        }
    }

    // ================================================================
    // Calls and events
    // ================================================================

    /// Calls `<pluginId>.<method>` inside the plugin's sandbox.
    pub async fn call_plugin_method(
        &self,
        plugin_id: &PluginId,
        method: &str,
        args: Vec<Value>,
    ) -> HostResult<Value> {
        if !self.plugins.read().unwrap().contains_key(plugin_id) {
            return Err(HostError::PluginNotFound(plugin_id.to_string()));
        }
        self.sandboxes
            .call_plugin_method(plugin_id, method, args)
            .await
    }

    /// Registers a method plugins can reach through `call_host_api`.
    pub fn register_host_api<F, Fut>(&self, name: &str, method: F) -> HostResult<()>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.sandboxes.register_rpc_method(name, method)
    }

    /// Delivers a host event to one plugin.
    pub fn post_event(&self, plugin_id: &PluginId, event: &str, data: Value) -> HostResult<()> {
        let sandbox = self
            .sandboxes
            .get_sandbox(plugin_id)
            .ok_or_else(|| HostError::SandboxNotFound(plugin_id.to_string()))?;
        sandbox.post_event(event, data)
    }

    /// Delivers a host event to every running plugin. Returns how many got it.
    pub fn broadcast_event(&self, event: &str, data: &Value) -> usize {
        let mut delivered = 0;
        for plugin_id in self.sandboxes.plugin_ids() {
            match self.post_event(&plugin_id, event, data.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(plugin_id = %plugin_id, error = %e, "event not delivered"),
            }
        }
        delivered
    }

    // ================================================================
    // Persistence
    // ================================================================

    fn persist(&self, info: &PluginInfo) -> HostResult<()> {
        let plugin_id = info.manifest.plugin_id()?;
        self.store.set_json(&self.storage_key(&plugin_id), info)?;
        Ok(())
    }

    fn set_status(&self, plugin_id: &PluginId, status: PluginStatus) -> HostResult<()> {
        let info = {
            let mut plugins = self.plugins.write().unwrap();
            let info = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;
            info.transition(status);
            info.clone()
        };
        self.persist(&info)
    }

    fn record_failure(&self, plugin_id: &PluginId, cause: &HostError) {
        self.failures().record(plugin_id, cause.to_string());
    }

    /// Loads persisted records. Entries that fail to parse are logged and
    /// skipped. Returns how many records were loaded.
    pub fn restore(&self) -> HostResult<usize> {
        let keys = self.store.keys_with_prefix(&self.storage_prefix)?;
        let mut restored = 0;
        for key in keys {
            let info: PluginInfo = match self.store.get_json(&key) {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%key, error = %e, "skipping unreadable plugin record");
                    self.logger
                        .warn(LOG_SOURCE, format!("skipping unreadable record {key}: {e}"));
                    continue;
                }
            };
            let plugin_id = match info.manifest.plugin_id() {
                Ok(id) => id,
                Err(e) => {
                    warn!(%key, error = %e, "skipping plugin record with invalid id");
                    continue;
                }
            };
            let mut plugins = self.plugins.write().unwrap();
            if !plugins.contains_key(&plugin_id) {
                plugins.insert(plugin_id, info);
                restored += 1;
            }
        }
        info!(restored, "plugin records restored");
        Ok(restored)
    }

    /// Re-provisions every restored plugin recorded as `running`. Failures
    /// are recorded as `error`. Returns how many plugins are running.
    pub async fn resume(&self) -> usize {
        let pending: Vec<(PluginId, PluginManifest)> = self
            .plugins
            .read()
            .unwrap()
            .iter()
            .filter(|(id, info)| {
                info.status() == PluginStatus::Running && !self.sandboxes.contains(id)
            })
            .map(|(id, info)| (id.clone(), info.manifest.clone()))
            .collect();

        let mut resumed = 0;
        for (plugin_id, manifest) in pending {
            match self.provision(&plugin_id, &manifest).await {
                Ok(()) => {
                    resumed += 1;
                    self.events.emit(PluginEvent::Start { plugin_id });
                }
                Err(e) => {
                    self.teardown(&plugin_id).await;
                    self.record_failure(&plugin_id, &e);
                }
            }
        }
        resumed
    }

    /// Starts periodic library update checks.
    pub fn start_update_checks(&self) -> JoinHandle<()> {
        self.updates.clone().start(self.update_interval)
    }

    /// Destroys every sandbox. Records keep their status so a later
    /// [`Self::resume`] restarts running plugins.
    pub async fn shutdown(&self) {
        self.sandboxes.destroy_all().await;
        for plugin_id in self.plugins.read().unwrap().keys() {
            self.dependencies.release_plugin(plugin_id);
        }
        info!("plugin host shut down");
    }
}

/// Everything a move to `error` touches. Cheap to clone, so event
/// handlers can hold one.
#[derive(Clone)]
struct Failures {
    storage_prefix: String,
    store: Arc<dyn KeyValueStore>,
    plugins: Arc<RwLock<HashMap<PluginId, PluginInfo>>>,
    monitor: Monitor,
    logger: Logger,
    events: EventBus<PluginEvent>,
}

impl Failures {
    /// Records `error` with its cause, persists it and broadcasts it.
    fn record(&self, plugin_id: &PluginId, message: String) {
        let info = {
            let mut plugins = self.plugins.write().unwrap();
            plugins.get_mut(plugin_id).map(|info| {
                info.fail(message.clone());
                info.clone()
            })
        };
        if let Some(info) = info {
            let key = format!("{}{}", self.storage_prefix, plugin_id);
            if let Err(e) = self.store.set_json(&key, &info) {
                warn!(plugin_id = %plugin_id, error = %e, "failed to persist plugin record");
            }
        }
        error!(plugin_id = %plugin_id, error = %message, "plugin failed");
        self.monitor.record_error(plugin_id, message.clone());
        self.logger.error(plugin_id.as_str(), message.clone());
        self.events.emit(PluginEvent::Error {
            plugin_id: plugin_id.clone(),
            message,
        });
    }
}
