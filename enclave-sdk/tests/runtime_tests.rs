use enclave_crypto::{HashAlgorithm, Integrity};
use enclave_ipc::port::channel;
use enclave_ipc::{
    CallOptions, Envelope, IpcBus, IpcConfig, MethodRegistry, RpcConfig, RpcManager, SendOptions,
};
use enclave_sdk::prelude::*;
use enclave_sdk::{
    ControlMessage, GuestHandle, GuestRuntime, GuestSpec, ModuleRegistry, ScriptElement,
    ScriptSource, PLUGIN_EVENT_CHANNEL, UI_CHANNEL,
};
use enclave_storage::{KeyValueStore, MemoryStore};
use enclave_types::{PermissionSet, StaticFetcher, TelemetryReport};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const HOST: &str = "enclave://host";
const GUEST: &str = "enclave-sandbox://acme.charts";
const ENTRY: &str = "export default class Charts {}";

/// Registers `render`, keeps its context around for inspection.
#[derive(Default)]
struct Charts {
    ctx: Mutex<Option<PluginContext>>,
    unloaded: Arc<AtomicBool>,
}

#[async_trait]
impl GuestModule for Charts {
    async fn on_load(&self, ctx: &PluginContext) -> anyhow::Result<()> {
        ctx.register_api("render", |args| async move { Ok(json!({"points": args.len()})) })?;
        *self.ctx.lock().unwrap() = Some(ctx.clone());
        Ok(())
    }

    async fn on_unload(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        self.unloaded.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    guest: GuestHandle,
    host: RpcManager,
    fetcher: Arc<StaticFetcher>,
    store: Arc<dyn KeyValueStore>,
    module: Arc<Charts>,
}

impl Harness {
    fn ctx(&self) -> PluginContext {
        self.module.ctx.lock().unwrap().clone().unwrap()
    }

    fn bus(&self) -> &IpcBus {
        self.host.bus()
    }

    fn subscribe(&self, channel: &str) -> UnboundedReceiver<Envelope> {
        self.bus().subscribe(channel).1
    }

    async fn load(&self) {
        self.guest
            .request(|ack| ControlMessage::WriteDocument {
                source: ENTRY.into(),
                ack,
            })
            .await
            .unwrap();
    }
}

async fn boot(permissions: PermissionSet) -> Harness {
    let (h, g) = channel(HOST, GUEST);
    let host_bus = IpcBus::new(IpcConfig::new(HOST, GUEST), h).unwrap();
    let host = RpcManager::new(host_bus, MethodRegistry::new(), RpcConfig::default());

    let module = Arc::new(Charts::default());
    let engine = ModuleRegistry::new();
    let shared = module.clone();
    engine.register(ENTRY, move || shared.clone() as Arc<dyn GuestModule>);

    let fetcher = Arc::new(StaticFetcher::new());
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let mut guest = GuestRuntime::spawn(GuestSpec {
        plugin_id: PluginId::parse("acme.charts").unwrap(),
        permissions,
        port: g,
        ipc: IpcConfig::new(GUEST, HOST),
        rpc: RpcConfig::default(),
        engine: Arc::new(engine),
        fetcher: fetcher.clone(),
        storage: store.clone(),
    });
    guest.loaded().await.unwrap();

    Harness {
        guest,
        host,
        fetcher,
        store,
        module,
    }
}

async fn next(rx: &mut UnboundedReceiver<Envelope>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no message within 2s")
        .expect("channel closed")
}

#[tokio::test]
async fn loaded_module_serves_namespaced_api() {
    let h = boot(PermissionSet::baseline()).await;
    h.load().await;

    let result = h
        .host
        .call_method(CallOptions::new("acme.charts.render", vec![json!(1), json!(2)]))
        .await
        .unwrap();
    assert_eq!(result, json!({"points": 2}));
}

#[tokio::test]
async fn unregistered_entry_source_is_rejected() {
    let h = boot(PermissionSet::baseline()).await;
    let err = h
        .guest
        .request(|ack| ControlMessage::WriteDocument {
            source: "alert(1)".into(),
            ack,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, GuestError::UnknownModule(_)));
}

#[tokio::test]
async fn entry_can_be_loaded_from_url() {
    let h = boot(PermissionSet::baseline()).await;
    h.fetcher.route("https://cdn.test/charts/main.js", ENTRY);
    h.guest
        .request(|ack| ControlMessage::LoadUrl {
            url: "https://cdn.test/charts/main.js".into(),
            ack,
        })
        .await
        .unwrap();
    assert_eq!(h.fetcher.hits("https://cdn.test/charts/main.js"), 1);
    assert!(h.ctx().with_document(|d| d.get("enclave-entry").is_some()));
}

#[tokio::test]
async fn script_integrity_is_enforced() {
    let h = boot(PermissionSet::baseline()).await;
    h.load().await;
    let body = "window.lodash = {}";
    h.fetcher.route("https://cdn.test/lodash.js", body);

    let good = Integrity::compute(HashAlgorithm::Sha384, body.as_bytes()).to_string();
    h.guest
        .request(|ack| ControlMessage::InjectScript {
            element: ScriptElement {
                id: "dep-lodash-4.17.21".into(),
                source: ScriptSource::Url("https://cdn.test/lodash.js".into()),
                integrity: Some(good.clone()),
                cross_origin: Some("anonymous".into()),
                module: false,
            },
            ack,
        })
        .await
        .unwrap();

    let attrs = h
        .ctx()
        .with_document(|d| d.get("dep-lodash-4.17.21").map(|n| n.attributes.clone()));
    let attrs = attrs.unwrap();
    assert_eq!(attrs.get("integrity"), Some(&good));
    assert_eq!(attrs.get("crossorigin").map(String::as_str), Some("anonymous"));

    let bad = Integrity::compute(HashAlgorithm::Sha256, b"something else").to_string();
    let err = h
        .guest
        .request(|ack| ControlMessage::InjectScript {
            element: ScriptElement {
                id: "dep-tampered-1.0.0".into(),
                source: ScriptSource::Inline(body.into()),
                integrity: Some(bad),
                cross_origin: None,
                module: true,
            },
            ack,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, GuestError::Integrity { .. }));
    assert!(h.ctx().with_document(|d| d.get("dep-tampered-1.0.0").is_none()));
}

#[tokio::test]
async fn styles_and_removal() {
    let h = boot(PermissionSet::baseline()).await;
    h.load().await;
    h.guest
        .request(|ack| ControlMessage::InjectStyles {
            id: "plugin-styles".into(),
            css: "body { margin: 0 }".into(),
            ack,
        })
        .await
        .unwrap();
    assert_eq!(h.ctx().with_document(|d| d.by_tag("style").count()), 1);

    h.guest
        .request(|ack| ControlMessage::RemoveElement {
            id: "plugin-styles".into(),
            ack,
        })
        .await
        .unwrap();
    assert_eq!(h.ctx().with_document(|d| d.by_tag("style").count()), 0);
}

#[tokio::test]
async fn reporter_sends_samples() {
    let h = boot(PermissionSet::baseline()).await;
    h.load().await;
    let mut telemetry = h.subscribe(TelemetryReport::CHANNEL);
    h.guest
        .request(|ack| ControlMessage::InstallReporter {
            interval: Duration::from_millis(20),
            ack,
        })
        .await
        .unwrap();

    let env = next(&mut telemetry).await;
    let report: TelemetryReport = serde_json::from_value(env.payload).unwrap();
    match report {
        TelemetryReport::Sample { dom_nodes, heap_mb, .. } => {
            assert_eq!(dom_nodes, 1);
            assert!(heap_mb > 0.0);
        }
        other => panic!("expected a sample, got {other:?}"),
    }
}

#[tokio::test]
async fn capabilities_require_permissions() {
    let h = boot(PermissionSet::baseline()).await;
    h.load().await;
    let ctx = h.ctx();

    assert!(matches!(ctx.state(), Err(GuestError::PermissionDenied(Permission::Storage))));
    assert!(matches!(
        ctx.fetch(FetchRequest::get("https://api.test/")).await,
        Err(GuestError::PermissionDenied(Permission::Network))
    ));
    assert!(matches!(
        ctx.register_component("chart", |_| Node::new("canvas")),
        Err(GuestError::PermissionDenied(Permission::Ui))
    ));
    // Events are always granted.
    ctx.emit("ready", Value::Null).unwrap();
}

#[tokio::test]
async fn fetch_is_reported_before_it_is_made() {
    let h = boot(PermissionSet::from_declared(&[Permission::Network])).await;
    h.load().await;
    h.fetcher.route("https://api.test/data", "{}");
    let mut telemetry = h.subscribe(TelemetryReport::CHANNEL);

    let response = h.ctx().fetch(FetchRequest::get("https://api.test/data")).await.unwrap();
    assert_eq!(response.status, 200);

    let report: TelemetryReport =
        serde_json::from_value(next(&mut telemetry).await.payload).unwrap();
    assert_eq!(
        report,
        TelemetryReport::NetworkRequest {
            url: "https://api.test/data".into(),
            method: "GET".into(),
        }
    );
}

#[tokio::test]
async fn state_persists_under_plugin_key() {
    let h = boot(PermissionSet::from_declared(&[Permission::Storage])).await;
    h.load().await;
    let state = h.ctx().state().unwrap();
    state.set("zoom", json!(2)).unwrap();
    state.set("theme", json!("dark")).unwrap();
    state.remove("theme").unwrap();

    assert_eq!(state.storage_key(), "plugin_acme.charts_state");
    assert_eq!(state.get("zoom").unwrap(), Some(json!(2)));
    let raw = h.store.get("plugin_acme.charts_state").unwrap().unwrap();
    assert_eq!(serde_json::from_str::<Value>(&raw).unwrap(), json!({"zoom": 2}));
}

#[tokio::test]
async fn events_flow_both_ways() {
    let h = boot(PermissionSet::from_declared(&[Permission::Ui])).await;
    h.load().await;
    let ctx = h.ctx();

    let mut plugin_events = h.subscribe(PLUGIN_EVENT_CHANNEL);
    ctx.emit("selected", json!({"series": 3})).unwrap();
    let env = next(&mut plugin_events).await;
    assert_eq!(env.payload, json!({"event": "selected", "data": {"series": 3}}));

    let mut ui = h.subscribe(UI_CHANNEL);
    let name = ctx.register_component("chart", |_| Node::new("canvas")).unwrap();
    assert_eq!(name, "acme.charts-chart");
    assert_eq!(next(&mut ui).await.payload["tag"], "acme.charts-chart");
    ctx.render_component("chart", &Value::Null).unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    ctx.on("theme-changed", move |data| {
        let _ = tx.send(data);
    });
    h.bus()
        .send(
            enclave_sdk::HOST_EVENT_CHANNEL,
            json!({"event": "theme-changed", "data": "dark"}),
            SendOptions::default(),
        )
        .unwrap();
    let data = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(data, Some(json!("dark")));
}

#[tokio::test]
async fn detach_runs_unload_and_stops() {
    let h = boot(PermissionSet::baseline()).await;
    h.load().await;
    let unloaded = h.module.unloaded.clone();

    h.guest.request(|ack| ControlMessage::Detach { ack }).await.unwrap();
    assert!(unloaded.load(Ordering::SeqCst));

    let err = h
        .guest
        .request(|ack| ControlMessage::ApplyCsp {
            policy: "default-src 'none'".into(),
            ack,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, GuestError::Detached));
}
