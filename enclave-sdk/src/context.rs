//! The API surface a plugin sees.

use crate::document::{DocumentRoot, Node};
use crate::error::{GuestError, GuestResult};
use crate::meter::ResourceMeter;
use enclave_ipc::{CallOptions, HandlerId, IpcBus, RpcError, RpcManager, SendOptions};
use enclave_storage::KeyValueStore;
use enclave_types::{
    FetchRequest, FetchResponse, Fetcher, Permission, PermissionSet, PluginId, TelemetryReport,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// Component registrations are announced to the host on this channel.
pub const UI_CHANNEL: &str = "ui";
/// Events emitted by the plugin.
pub const PLUGIN_EVENT_CHANNEL: &str = "plugin-event";
/// Events posted to the plugin by the host.
pub const HOST_EVENT_CHANNEL: &str = "host-event";

/// Builds a component's node from its props.
pub type ComponentFactory = Arc<dyn Fn(&Value) -> Node + Send + Sync>;

struct ContextInner {
    plugin_id: PluginId,
    permissions: PermissionSet,
    bus: IpcBus,
    rpc: RpcManager,
    store: Arc<dyn KeyValueStore>,
    fetcher: Arc<dyn Fetcher>,
    document: Arc<Mutex<DocumentRoot>>,
    meter: Arc<ResourceMeter>,
    components: RwLock<HashMap<String, ComponentFactory>>,
}

/// Handle given to [`crate::GuestModule`] hooks. Cheap to clone.
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.inner.plugin_id)
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        plugin_id: PluginId,
        permissions: PermissionSet,
        bus: IpcBus,
        rpc: RpcManager,
        store: Arc<dyn KeyValueStore>,
        fetcher: Arc<dyn Fetcher>,
        document: Arc<Mutex<DocumentRoot>>,
        meter: Arc<ResourceMeter>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                plugin_id,
                permissions,
                bus,
                rpc,
                store,
                fetcher,
                document,
                meter,
                components: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn plugin_id(&self) -> &PluginId {
        &self.inner.plugin_id
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.inner.permissions
    }

    fn require(&self, permission: Permission) -> GuestResult<()> {
        if self.inner.permissions.is_granted(permission) {
            Ok(())
        } else {
            Err(GuestError::PermissionDenied(permission))
        }
    }

    pub fn meter(&self) -> &ResourceMeter {
        &self.inner.meter
    }

    pub fn with_document<R>(&self, f: impl FnOnce(&mut DocumentRoot) -> R) -> R {
        f(&mut self.inner.document.lock().unwrap())
    }

    // ── RPC ──────────────────────────────────────────────────────

    /// Exposes `name` to the host as `<pluginId>.<name>`.
    pub fn register_api<F, Fut>(&self, name: &str, handler: F) -> GuestResult<()>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let method = self.inner.plugin_id.method(name);
        let meter = self.inner.meter.clone();
        self.inner.rpc.register_method(&method, move |args| {
            let meter = meter.clone();
            let fut = handler(args);
            async move {
                meter
                    .time(fut)
                    .await
                    .map_err(|e| RpcError::execution(format!("{e:#}")))
            }
        })?;
        debug!(plugin_id = %self.inner.plugin_id, method = %method, "registered api");
        Ok(())
    }

    /// Calls a method registered on the host.
    pub async fn call_host_api(&self, method: &str, args: Vec<Value>) -> GuestResult<Value> {
        self.require(Permission::HostApi)?;
        Ok(self
            .inner
            .rpc
            .call_method(CallOptions::new(method, args))
            .await?)
    }

    // ── UI ───────────────────────────────────────────────────────

    /// Registers a component under `<pluginId>-<tag>` and announces it to the host.
    pub fn register_component<F>(&self, tag: &str, factory: F) -> GuestResult<String>
    where
        F: Fn(&Value) -> Node + Send + Sync + 'static,
    {
        self.require(Permission::Ui)?;
        let name = format!("{}-{}", self.inner.plugin_id, tag);
        {
            let mut components = self.inner.components.write().unwrap();
            if components.contains_key(&name) {
                return Err(GuestError::DuplicateComponent(name));
            }
            components.insert(name.clone(), Arc::new(factory));
        }
        self.inner.bus.send(
            UI_CHANNEL,
            json!({"action": "register-component", "tag": name}),
            SendOptions::default(),
        )?;
        Ok(name)
    }

    /// Renders a registered component into the document.
    pub fn render_component(&self, tag: &str, props: &Value) -> GuestResult<()> {
        let namespaced = format!("{}-{}", self.inner.plugin_id, tag);
        let factory = {
            let components = self.inner.components.read().unwrap();
            components
                .get(&namespaced)
                .or_else(|| components.get(tag))
                .cloned()
        }
        .ok_or_else(|| GuestError::UnknownComponent(tag.to_string()))?;
        let node = factory(props);
        self.with_document(|doc| doc.append(node))
    }

    // ── Events ───────────────────────────────────────────────────

    pub fn emit(&self, event: &str, data: Value) -> GuestResult<()> {
        self.require(Permission::Events)?;
        self.inner.bus.send(
            PLUGIN_EVENT_CHANNEL,
            json!({"event": event, "data": data}),
            SendOptions::default(),
        )?;
        Ok(())
    }

    /// Subscribes to host events named `event`.
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let event = event.to_string();
        self.inner.bus.on(HOST_EVENT_CHANNEL, move |env| {
            if env.payload.get("event").and_then(Value::as_str) == Some(event.as_str()) {
                handler(env.payload.get("data").cloned().unwrap_or(Value::Null));
            }
        })
    }

    pub fn off(&self, handler: HandlerId) -> bool {
        self.inner.bus.off(HOST_EVENT_CHANNEL, handler)
    }

    // ── State and network ────────────────────────────────────────

    /// The plugin's persisted key-value state.
    pub fn state(&self) -> GuestResult<PluginState> {
        self.require(Permission::Storage)?;
        Ok(PluginState {
            store: self.inner.store.clone(),
            key: format!("plugin_{}_state", self.inner.plugin_id),
        })
    }

    /// Outbound request. Every call is reported to the host before it is made.
    pub async fn fetch(&self, request: FetchRequest) -> GuestResult<FetchResponse> {
        self.require(Permission::Network)?;
        let report = TelemetryReport::NetworkRequest {
            url: request.url.clone(),
            method: request.method.clone(),
        };
        self.inner.bus.send(
            TelemetryReport::CHANNEL,
            serde_json::to_value(&report)?,
            SendOptions::default(),
        )?;
        Ok(self.inner.fetcher.fetch(request).await?)
    }
}

/// JSON object persisted under `plugin_<pluginId>_state`.
#[derive(Clone)]
pub struct PluginState {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl PluginState {
    pub fn storage_key(&self) -> &str {
        &self.key
    }

    fn load(&self) -> GuestResult<Map<String, Value>> {
        Ok(self.store.get_json(&self.key)?.unwrap_or_default())
    }

    fn save(&self, map: &Map<String, Value>) -> GuestResult<()> {
        Ok(self.store.set_json(&self.key, map)?)
    }

    pub fn get(&self, key: &str) -> GuestResult<Option<Value>> {
        Ok(self.load()?.remove(key))
    }

    pub fn set(&self, key: &str, value: Value) -> GuestResult<()> {
        let mut map = self.load()?;
        map.insert(key.to_string(), value);
        self.save(&map)
    }

    pub fn remove(&self, key: &str) -> GuestResult<()> {
        let mut map = self.load()?;
        if map.remove(key).is_some() {
            self.save(&map)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> GuestResult<()> {
        self.save(&Map::new())
    }

    pub fn all(&self) -> GuestResult<Map<String, Value>> {
        self.load()
    }
}
