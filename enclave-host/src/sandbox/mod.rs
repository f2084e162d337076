//! One isolated container per plugin.
//!
//! A [`PluginSandbox`] owns the host end of its container's message port,
//! the RPC endpoint bound to it, the metrics fed by guest telemetry and the
//! timer that checks those metrics against the sandbox limits.

pub mod backend;
pub mod csp;
pub mod local;

use crate::config::IpcSettings;
use crate::deps::ScriptTarget;
use crate::error::{HostError, HostResult};
use crate::events::{EventBus, SandboxEvent};
use async_trait::async_trait;
use backend::{Container, ContainerCommand, ContainerSpec, IsolationBackend, SANDBOX_CAPABILITIES};
use enclave_crypto::ChannelKey;
use enclave_ipc::port;
use enclave_ipc::{
    CallOptions, IpcBus, IpcConfig, MethodRegistry, RpcConfig, RpcManager, SendOptions,
};
use enclave_sdk::{ScriptElement, HOST_EVENT_CHANNEL, PLUGIN_EVENT_CHANNEL, UI_CHANNEL};
use enclave_types::{
    PermissionSet, PluginId, Resource, SandboxMetrics, SandboxOptions, TelemetryReport,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Plugin code handed to [`PluginSandbox::inject_content`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Written straight into the container document.
    Source(String),
    /// Published under a temporary object URL and loaded from it.
    Blob(Vec<u8>),
}

/// Origins and channel security shared by every sandbox of a host.
#[derive(Clone)]
pub struct ChannelSettings {
    pub host_origin: String,
    pub sandbox_scheme: String,
    pub encryption_key: Option<ChannelKey>,
    pub auth_token: Option<String>,
}

impl ChannelSettings {
    /// Resolves the channel key once so both ends of every channel share it.
    pub fn from_config(ipc: &IpcSettings) -> HostResult<Self> {
        Ok(Self {
            host_origin: ipc.host_origin.clone(),
            sandbox_scheme: ipc.sandbox_scheme.clone(),
            encryption_key: ipc.channel_key()?,
            auth_token: ipc
                .auth_token
                .clone()
                .filter(|_| ipc.enable_authentication),
        })
    }

    pub fn sandbox_origin(&self, plugin_id: &PluginId) -> String {
        format!("{}://{}", self.sandbox_scheme, plugin_id)
    }

    /// Host-side and guest-side bus configuration for one sandbox.
    fn bus_configs(&self, sandbox_origin: &str) -> (IpcConfig, IpcConfig) {
        let mut host = IpcConfig::new(&self.host_origin, sandbox_origin);
        let mut guest = IpcConfig::new(sandbox_origin, &self.host_origin);
        if let Some(key) = &self.encryption_key {
            host = host.with_encryption(key.clone());
            guest = guest.with_encryption(key.clone());
        }
        if let Some(token) = &self.auth_token {
            host = host.with_authentication(token.clone());
            guest = guest.with_authentication(token.clone());
        }
        (host, guest)
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        let ipc = IpcSettings::default();
        Self {
            host_origin: ipc.host_origin,
            sandbox_scheme: ipc.sandbox_scheme,
            encryption_key: None,
            auth_token: None,
        }
    }
}

struct Endpoint {
    bus: IpcBus,
    rpc: RpcManager,
}

pub struct PluginSandbox {
    plugin_id: PluginId,
    /// Distinguishes this sandbox from earlier and later ones of the same plugin.
    instance_id: String,
    options: SandboxOptions,
    channel: ChannelSettings,
    rpc_config: RpcConfig,
    registry: MethodRegistry,
    events: EventBus<SandboxEvent>,
    metrics: Arc<Mutex<SandboxMetrics>>,
    container: tokio::sync::Mutex<Option<Box<dyn Container>>>,
    endpoint: Mutex<Option<Endpoint>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl PluginSandbox {
    /// `registry` is the host method table served to the guest.
    pub fn new(
        plugin_id: PluginId,
        options: SandboxOptions,
        channel: ChannelSettings,
        rpc_config: RpcConfig,
        registry: MethodRegistry,
    ) -> Self {
        let metrics = SandboxMetrics::from_limits(&options.limits);
        Self {
            instance_id: format!("{plugin_id}#{}", Uuid::new_v4().simple()),
            plugin_id,
            options,
            channel,
            rpc_config,
            registry,
            events: EventBus::new(),
            metrics: Arc::new(Mutex::new(metrics)),
            container: tokio::sync::Mutex::new(None),
            endpoint: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn events(&self) -> &EventBus<SandboxEvent> {
        &self.events
    }

    pub fn origin(&self) -> String {
        self.channel.sandbox_origin(&self.plugin_id)
    }

    pub fn metrics(&self) -> SandboxMetrics {
        *self.metrics.lock().unwrap()
    }

    pub fn options(&self) -> SandboxOptions {
        self.options.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub async fn has_container(&self) -> bool {
        self.container.lock().await.is_some()
    }

    // ── Container setup ──────────────────────────────────────────

    /// Creates the isolated container, waits for it to load, applies the
    /// content policy and starts telemetry and limit checking.
    pub async fn create_container(
        &self,
        backend: &dyn IsolationBackend,
        permissions: PermissionSet,
    ) -> HostResult<()> {
        let mut slot = self.container.lock().await;
        if slot.is_some() {
            debug!(plugin_id = %self.plugin_id, "container already created");
            return Ok(());
        }
        if self.is_destroyed() {
            return Err(HostError::SandboxNotFound(self.plugin_id.to_string()));
        }

        let origin = self.origin();
        let (host_end, guest_end) = port::channel(&self.channel.host_origin, &origin);
        let (host_config, guest_config) = self.channel.bus_configs(&origin);
        let bus = IpcBus::new(host_config, host_end)?;
        let rpc = RpcManager::new(bus.clone(), self.registry.clone(), self.rpc_config.clone());
        let listeners = self.spawn_listeners(&bus);

        let spec = ContainerSpec {
            plugin_id: self.plugin_id.clone(),
            origin,
            capabilities: SANDBOX_CAPABILITIES.to_vec(),
            permissions,
            port: guest_end,
            ipc: guest_config,
            rpc: self.rpc_config.clone(),
        };

        let container = match self.attach(backend, spec).await {
            Ok(container) => container,
            Err(e) => {
                for task in listeners {
                    task.abort();
                }
                bus.close();
                return Err(e);
            }
        };

        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.extend(listeners);
            tasks.push(self.spawn_limit_checker());
        }

        *self.endpoint.lock().unwrap() = Some(Endpoint { bus, rpc });
        *slot = Some(container);
        info!(plugin_id = %self.plugin_id, "sandbox container created");
        Ok(())
    }

    async fn attach(
        &self,
        backend: &dyn IsolationBackend,
        spec: ContainerSpec,
    ) -> HostResult<Box<dyn Container>> {
        let mut container = backend.create(spec).await?;

        let timeout_ms = self.options.load_timeout_ms;
        let loaded =
            tokio::time::timeout(Duration::from_millis(timeout_ms), container.loaded()).await;
        let ready = match loaded {
            Ok(result) => result,
            Err(_) => Err(HostError::ContainerLoadTimeout {
                plugin_id: self.plugin_id.to_string(),
                timeout_ms,
            }),
        };

        let configured = match ready {
            Ok(()) => self.configure(container.as_ref()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = configured {
            if let Err(detach) = container.detach().await {
                debug!(plugin_id = %self.plugin_id, error = %detach, "detach after failed setup");
            }
            return Err(e);
        }
        Ok(container)
    }

    async fn configure(&self, container: &dyn Container) -> HostResult<()> {
        let policy = csp::build_policy(&self.options.csp);
        debug!(plugin_id = %self.plugin_id, %policy, "applying content policy");
        container.execute(ContainerCommand::ApplyCsp(policy)).await?;
        container
            .execute(ContainerCommand::InstallReporter(Duration::from_millis(
                self.options.telemetry_interval_ms,
            )))
            .await
    }

    fn spawn_listeners(&self, bus: &IpcBus) -> Vec<JoinHandle<()>> {
        let (_, mut telemetry) = bus.subscribe(TelemetryReport::CHANNEL);
        let metrics = self.metrics.clone();
        let events = self.events.clone();
        let id = self.plugin_id.clone();
        let telemetry_task = tokio::spawn(async move {
            while let Some(envelope) = telemetry.recv().await {
                let report: TelemetryReport = match serde_json::from_value(envelope.payload) {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(plugin_id = %id, error = %e, "dropping malformed telemetry");
                        continue;
                    }
                };
                let snapshot = apply_report(&metrics, &report);
                events.emit(SandboxEvent::Metrics {
                    plugin_id: id.clone(),
                    metrics: snapshot,
                });
            }
        });

        let (_, mut plugin_events) = bus.subscribe(PLUGIN_EVENT_CHANNEL);
        let events = self.events.clone();
        let id = self.plugin_id.clone();
        let event_task = tokio::spawn(async move {
            while let Some(envelope) = plugin_events.recv().await {
                let Some(event) = envelope.payload.get("event").and_then(Value::as_str) else {
                    warn!(plugin_id = %id, "plugin event without a name");
                    continue;
                };
                events.emit(SandboxEvent::PluginEvent {
                    plugin_id: id.clone(),
                    event: event.to_string(),
                    data: envelope.payload.get("data").cloned().unwrap_or(Value::Null),
                });
            }
        });

        let (_, mut ui) = bus.subscribe(UI_CHANNEL);
        let events = self.events.clone();
        let id = self.plugin_id.clone();
        let ui_task = tokio::spawn(async move {
            while let Some(envelope) = ui.recv().await {
                let payload = &envelope.payload;
                if payload.get("action").and_then(Value::as_str) != Some("register-component") {
                    continue;
                }
                if let Some(tag) = payload.get("tag").and_then(Value::as_str) {
                    debug!(plugin_id = %id, tag, "component registered");
                    events.emit(SandboxEvent::ComponentRegistered {
                        plugin_id: id.clone(),
                        tag: tag.to_string(),
                    });
                }
            }
        });

        vec![telemetry_task, event_task, ui_task]
    }

    fn spawn_limit_checker(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let events = self.events.clone();
        let id = self.plugin_id.clone();
        let period = Duration::from_millis(self.options.limit_check_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut violating = HashSet::new();
            loop {
                ticker.tick().await;
                let snapshot = *metrics.lock().unwrap();
                for resource in check_limits(&snapshot, &mut violating) {
                    let usage = snapshot.usage(resource);
                    warn!(
                        plugin_id = %id,
                        resource = %resource,
                        used = usage.used,
                        limit = usage.limit,
                        "resource limit exceeded"
                    );
                    events.emit(SandboxEvent::ResourceViolation {
                        plugin_id: id.clone(),
                        resource,
                        metrics: snapshot,
                    });
                }
            }
        })
    }

    // ── Content ──────────────────────────────────────────────────

    pub async fn inject_content(&self, content: Content) -> HostResult<()> {
        let slot = self.container.lock().await;
        let container = slot
            .as_ref()
            .ok_or_else(|| HostError::ContainerNotCreated(self.plugin_id.to_string()))?;
        match content {
            Content::Source(source) => {
                container
                    .execute(ContainerCommand::WriteDocument(source))
                    .await
            }
            Content::Blob(bytes) => {
                let url = container.publish_blob(bytes);
                let result = container.execute(ContainerCommand::LoadUrl(url.clone())).await;
                container.revoke_blob(&url);
                result
            }
        }
    }

    pub async fn inject_styles(&self, id: &str, css: String) -> HostResult<()> {
        self.execute(ContainerCommand::InjectStyles {
            id: id.to_string(),
            css,
        })
        .await
    }

    async fn execute(&self, command: ContainerCommand) -> HostResult<()> {
        let slot = self.container.lock().await;
        match slot.as_ref() {
            Some(container) => container.execute(command).await,
            None => Err(HostError::ContainerNotCreated(self.plugin_id.to_string())),
        }
    }

    // ── Messaging ────────────────────────────────────────────────

    fn with_endpoint<R>(&self, f: impl FnOnce(&Endpoint) -> R) -> HostResult<R> {
        match self.endpoint.lock().unwrap().as_ref() {
            Some(endpoint) => Ok(f(endpoint)),
            None => Err(HostError::ContainerNotCreated(self.plugin_id.to_string())),
        }
    }

    /// Calls a method the guest registered.
    pub async fn call(&self, options: CallOptions) -> HostResult<Value> {
        let rpc = self.with_endpoint(|e| e.rpc.clone())?;
        Ok(rpc.call_method(options).await?)
    }

    /// Delivers `event` to the plugin's `on` handlers.
    pub fn post_event(&self, event: &str, data: Value) -> HostResult<()> {
        let bus = self.with_endpoint(|e| e.bus.clone())?;
        bus.send(
            HOST_EVENT_CHANNEL,
            json!({"event": event, "data": data}),
            SendOptions::default(),
        )?;
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Stops timers, detaches the container and closes the channel.
    pub async fn destroy(&self) -> HostResult<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        let container = self.container.lock().await.take();
        let result = match container {
            Some(mut container) => container.detach().await,
            None => Ok(()),
        };
        if let Some(endpoint) = self.endpoint.lock().unwrap().take() {
            endpoint.bus.close();
        }
        info!(plugin_id = %self.plugin_id, "sandbox destroyed");
        result
    }
}

impl Drop for PluginSandbox {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl ScriptTarget for PluginSandbox {
    fn target_id(&self) -> &str {
        &self.instance_id
    }

    async fn inject_script(&self, element: ScriptElement) -> HostResult<()> {
        self.execute(ContainerCommand::InjectScript(element)).await
    }

    async fn remove_element(&self, id: &str) -> HostResult<()> {
        self.execute(ContainerCommand::RemoveElement(id.to_string()))
            .await
    }
}

/// Folds one telemetry report into `metrics`, returning the new snapshot.
fn apply_report(metrics: &Mutex<SandboxMetrics>, report: &TelemetryReport) -> SandboxMetrics {
    let mut m = metrics.lock().unwrap();
    match report {
        TelemetryReport::Sample {
            cpu_percent,
            heap_mb,
            dom_nodes,
            ..
        } => {
            m.memory.used = *heap_mb;
            m.cpu.used = *cpu_percent;
            m.dom_nodes.used = *dom_nodes as f64;
        }
        TelemetryReport::NetworkRequest { .. } => {
            m.network.used += 1.0;
        }
    }
    *m
}

/// Returns resources that entered violation since the last check.
/// A resource is re-armed once it drops back under its limit.
fn check_limits(metrics: &SandboxMetrics, violating: &mut HashSet<Resource>) -> Vec<Resource> {
    let mut entered = Vec::new();
    for resource in Resource::ALL {
        if metrics.usage(resource).exceeded() {
            if violating.insert(resource) {
                entered.push(resource);
            }
        } else {
            violating.remove(&resource);
        }
    }
    entered
}
