//! The runtime that lives inside a container.
//!
//! It owns the guest end of the IPC port, the closed document root, the
//! plugin's module and context, and the telemetry reporter. The isolation
//! backend drives it only through [`ControlMessage`]s.

use crate::context::PluginContext;
use crate::control::{ControlMessage, GuestHandle, ScriptElement, ScriptSource};
use crate::document::{DocumentRoot, Node};
use crate::error::{GuestError, GuestResult};
use crate::meter::ResourceMeter;
use crate::module::{GuestModule, ModuleRegistry, ScriptEngine, ScriptKind};
use enclave_crypto::Integrity;
use enclave_ipc::{
    IpcBus, IpcConfig, IpcError, MethodRegistry, PortEnd, RpcConfig, RpcManager, SendOptions,
};
use enclave_storage::KeyValueStore;
use enclave_types::{Fetcher, PermissionSet, PluginId, TelemetryReport, Timestamp};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ENTRY_ELEMENT_ID: &str = "enclave-entry";

/// Everything a guest needs to boot.
pub struct GuestSpec {
    pub plugin_id: PluginId,
    pub permissions: PermissionSet,
    pub port: PortEnd,
    pub ipc: IpcConfig,
    pub rpc: RpcConfig,
    pub engine: Arc<dyn ScriptEngine>,
    /// Loads entry URLs and script sources; also backs the plugin's `fetch`.
    pub fetcher: Arc<dyn Fetcher>,
    pub storage: Arc<dyn KeyValueStore>,
}

pub struct GuestRuntime {
    ctx: PluginContext,
    bus: IpcBus,
    engine: Arc<dyn ScriptEngine>,
    fetcher: Arc<dyn Fetcher>,
    document: Arc<Mutex<DocumentRoot>>,
    meter: Arc<ResourceMeter>,
    module: Option<Arc<dyn GuestModule>>,
    reporter: Option<JoinHandle<()>>,
}

impl GuestRuntime {
    /// Boots a guest on a new task.
    pub fn spawn(spec: GuestSpec) -> GuestHandle {
        let (control_tx, control_rx) = mpsc::channel(32);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            match Self::boot(spec) {
                Ok(runtime) => {
                    let _ = ready_tx.send(Ok(()));
                    runtime.run(control_rx).await;
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });
        GuestHandle::new(control_tx, ready_rx, task)
    }

    fn boot(spec: GuestSpec) -> GuestResult<Self> {
        let bus = IpcBus::new(spec.ipc, spec.port)?;
        let rpc = RpcManager::new(bus.clone(), MethodRegistry::new(), spec.rpc);
        let document = Arc::new(Mutex::new(DocumentRoot::new()));
        let meter = Arc::new(ResourceMeter::new());
        let ctx = PluginContext::new(
            spec.plugin_id,
            spec.permissions,
            bus.clone(),
            rpc,
            spec.storage,
            spec.fetcher.clone(),
            document.clone(),
            meter.clone(),
        );
        Ok(Self {
            ctx,
            bus,
            engine: spec.engine,
            fetcher: spec.fetcher,
            document,
            meter,
            module: None,
            reporter: None,
        })
    }

    async fn run(mut self, mut control: mpsc::Receiver<ControlMessage>) {
        while let Some(message) = control.recv().await {
            match message {
                ControlMessage::WriteDocument { source, ack } => {
                    let _ = ack.send(self.load_entry(source).await);
                }
                ControlMessage::LoadUrl { url, ack } => {
                    let result = match self.fetch_text(&url).await {
                        Ok(source) => self.load_entry(source).await,
                        Err(e) => Err(e),
                    };
                    let _ = ack.send(result);
                }
                ControlMessage::ApplyCsp { policy, ack } => {
                    self.document.lock().unwrap().set_csp(policy);
                    let _ = ack.send(Ok(()));
                }
                ControlMessage::InstallReporter { interval, ack } => {
                    self.install_reporter(interval);
                    let _ = ack.send(Ok(()));
                }
                ControlMessage::InjectScript { element, ack } => {
                    let _ = ack.send(self.inject_script(element).await);
                }
                ControlMessage::InjectStyles { id, css, ack } => {
                    let node = Node::new("style").with_id(id).with_text(css);
                    let _ = ack.send(self.document.lock().unwrap().append(node));
                }
                ControlMessage::RemoveElement { id, ack } => {
                    self.document.lock().unwrap().remove(&id);
                    let _ = ack.send(Ok(()));
                }
                ControlMessage::Detach { ack } => {
                    self.detach().await;
                    let _ = ack.send(Ok(()));
                    return;
                }
            }
        }
        // Backend dropped the handle without detaching.
        self.detach().await;
    }

    async fn fetch_text(&self, url: &str) -> GuestResult<String> {
        Ok(self.fetcher.get(url).await?.text()?)
    }

    async fn load_entry(&mut self, source: String) -> GuestResult<()> {
        let module = self
            .engine
            .evaluate(&source, ScriptKind::Entry)?
            .ok_or_else(|| GuestError::UnknownModule(ModuleRegistry::digest(&source)))?;

        {
            let mut doc = self.document.lock().unwrap();
            doc.remove(ENTRY_ELEMENT_ID);
            doc.append(Node::new("script").with_id(ENTRY_ELEMENT_ID).with_text(source))?;
        }

        self.meter
            .time(module.on_load(&self.ctx))
            .await
            .map_err(|e| GuestError::Hook {
                hook: "on_load",
                message: format!("{e:#}"),
            })?;
        self.module = Some(module);
        info!(plugin_id = %self.ctx.plugin_id(), "plugin module loaded");
        Ok(())
    }

    async fn inject_script(&self, element: ScriptElement) -> GuestResult<()> {
        let content = match &element.source {
            ScriptSource::Inline(source) => source.clone(),
            ScriptSource::Url(url) => self.fetch_text(url).await?,
        };

        if let Some(integrity) = &element.integrity {
            Integrity::parse(integrity)
                .and_then(|i| i.verify(content.as_bytes()))
                .map_err(|e| GuestError::Integrity {
                    element: element.id.clone(),
                    message: e.to_string(),
                })?;
        }

        let mut node = Node::new("script")
            .with_id(element.id.clone())
            .with_text(content.clone());
        if let ScriptSource::Url(url) = &element.source {
            node = node.with_attr("src", url.clone());
        }
        if let Some(integrity) = &element.integrity {
            node = node.with_attr("integrity", integrity.clone());
        }
        if let Some(cross_origin) = &element.cross_origin {
            node = node.with_attr("crossorigin", cross_origin.clone());
        }
        if element.module {
            node = node.with_attr("type", "module");
        }
        self.document.lock().unwrap().append(node)?;

        self.engine.evaluate(&content, ScriptKind::Library)?;
        debug!(plugin_id = %self.ctx.plugin_id(), element = %element.id, "script injected");
        Ok(())
    }

    fn install_reporter(&mut self, interval: Duration) {
        if let Some(old) = self.reporter.take() {
            old.abort();
        }
        let bus = self.bus.clone();
        let meter = self.meter.clone();
        let document = self.document.clone();
        let plugin_id = self.ctx.plugin_id().clone();

        self.reporter = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last_busy = meter.busy_nanos();
            let mut last_tick = Instant::now();
            loop {
                ticker.tick().await;
                let busy = meter.busy_nanos();
                let elapsed = last_tick.elapsed().as_nanos().max(1) as f64;
                let cpu_percent =
                    (busy.saturating_sub(last_busy) as f64 / elapsed * 100.0).min(100.0);
                last_busy = busy;
                last_tick = Instant::now();

                let (dom_nodes, doc_bytes) = {
                    let doc = document.lock().unwrap();
                    (doc.node_count(), doc.estimated_bytes())
                };
                let heap_mb = (meter.heap_bytes() + doc_bytes) as f64 / (1024.0 * 1024.0);

                let sample = TelemetryReport::Sample {
                    cpu_percent,
                    heap_mb,
                    dom_nodes,
                    sampled_at: Timestamp::now(),
                };
                let payload = match serde_json::to_value(&sample) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(plugin_id = %plugin_id, error = %e, "failed to encode telemetry");
                        continue;
                    }
                };
                match bus.send(TelemetryReport::CHANNEL, payload, SendOptions::default()) {
                    Ok(_) => {}
                    Err(IpcError::PortClosed) => break,
                    Err(e) => warn!(plugin_id = %plugin_id, error = %e, "failed to send telemetry"),
                }
            }
        }));
    }

    async fn detach(&mut self) {
        if let Some(module) = self.module.take() {
            if let Err(e) = module.on_unload(&self.ctx).await {
                warn!(plugin_id = %self.ctx.plugin_id(), error = %e, "on_unload failed");
            }
        }
        if let Some(reporter) = self.reporter.take() {
            reporter.abort();
        }
        self.document.lock().unwrap().clear();
        self.bus.close();
        info!(plugin_id = %self.ctx.plugin_id(), "guest detached");
    }
}
