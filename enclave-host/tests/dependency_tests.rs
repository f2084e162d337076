use async_trait::async_trait;
use enclave_crypto::{HashAlgorithm, Integrity};
use enclave_host::deps::{
    element_id, DependencyInfo, DependencyLoader, DependencyManager, ScriptTarget, UpdateChecker,
};
use enclave_host::{DependencyEvent, DependencySettings, HostError, HostResult, UpdateEvent};
use enclave_sdk::{ScriptElement, ScriptSource};
use enclave_types::{LibraryDependency, LibraryKind, PluginId, StaticFetcher};
use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const REGISTRY: &str = "https://registry.npmjs.org";
const CDN: &str = "https://unpkg.com";

/// Records injected elements in order.
#[derive(Default)]
struct Document {
    id: String,
    elements: Mutex<Vec<ScriptElement>>,
}

impl Document {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            elements: Mutex::new(Vec::new()),
        })
    }

    fn ids(&self) -> Vec<String> {
        self.elements
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.id.clone())
            .collect()
    }

    fn element(&self, id: &str) -> Option<ScriptElement> {
        self.elements
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }
}

#[async_trait]
impl ScriptTarget for Document {
    fn target_id(&self) -> &str {
        &self.id
    }

    async fn inject_script(&self, element: ScriptElement) -> HostResult<()> {
        self.elements.lock().unwrap().push(element);
        Ok(())
    }

    async fn remove_element(&self, id: &str) -> HostResult<()> {
        self.elements.lock().unwrap().retain(|e| e.id != id);
        Ok(())
    }
}

fn publish(
    fetcher: &StaticFetcher,
    name: &str,
    versions: &[(&str, serde_json::Value)],
    latest: &str,
) {
    let mut docs = serde_json::Map::new();
    for (version, deps) in versions {
        docs.insert(version.to_string(), json!({"dependencies": deps}));
        let body = format!("/* {name} {version} */");
        let digest = Integrity::compute(HashAlgorithm::Sha384, body.as_bytes());
        fetcher.route(format!("{CDN}/{name}@{version}"), body);
        fetcher.route(format!("{CDN}/{name}@{version}.sri"), digest.to_string());
    }
    fetcher.route_json(
        format!("{REGISTRY}/{name}"),
        &json!({"versions": docs, "dist-tags": {"latest": latest}}),
    );
}

fn loader(fetcher: Arc<StaticFetcher>) -> DependencyLoader {
    DependencyLoader::new(fetcher, &DependencySettings::default())
}

fn lenient_loader(fetcher: Arc<StaticFetcher>) -> DependencyLoader {
    let settings = DependencySettings {
        require_integrity: false,
        ..DependencySettings::default()
    };
    DependencyLoader::new(fetcher, &settings)
}

fn umd(name: &str, url: &str, integrity: Option<String>) -> DependencyInfo {
    DependencyInfo {
        name: name.into(),
        version: "1.0.0".into(),
        kind: LibraryKind::Umd,
        url: Some(url.into()),
        integrity,
    }
}

#[tokio::test]
async fn concurrent_loads_fetch_and_inject_once() {
    let fetcher = Arc::new(StaticFetcher::new().with_latency(Duration::from_millis(20)));
    publish(&fetcher, "lodash", &[("4.17.21", json!({}))], "4.17.21");
    let loader = loader(fetcher.clone());
    let doc = Document::new("acme.charts");
    let info = DependencyInfo::npm("lodash", "^4.17.0");

    let results = join_all((0..5).map(|_| loader.load_dependency(doc.as_ref(), &info))).await;
    for r in results {
        assert_eq!(r.unwrap().version, "4.17.21");
    }

    assert_eq!(fetcher.hits(&format!("{CDN}/lodash@4.17.21")), 1);
    assert_eq!(fetcher.hits(&format!("{REGISTRY}/lodash")), 1);
    assert_eq!(loader.cache_len(), 1);
    assert_eq!(doc.ids(), vec!["dep-lodash-4-17-21"]);
    assert_eq!(loader.in_flight(), 0);
}

#[tokio::test]
async fn ranges_resolving_to_the_same_version_fetch_once() {
    let fetcher = Arc::new(StaticFetcher::new().with_latency(Duration::from_millis(20)));
    publish(&fetcher, "lodash", &[("4.17.21", json!({}))], "4.17.21");
    let loader = loader(fetcher.clone());
    let doc = Document::new("acme.charts");
    let requests = [
        DependencyInfo::npm("lodash", "^4.17.0"),
        DependencyInfo::npm("lodash", "4.17.21"),
        DependencyInfo::npm("lodash", "4.x"),
    ];

    let loads = requests.iter().map(|info| loader.load_dependency(doc.as_ref(), info));
    let results = join_all(loads).await;
    for r in results {
        assert_eq!(r.unwrap().version, "4.17.21");
    }

    assert_eq!(fetcher.hits(&format!("{CDN}/lodash@4.17.21")), 1);
    assert_eq!(fetcher.hits(&format!("{CDN}/lodash@4.17.21.sri")), 1);
    assert_eq!(doc.ids(), vec!["dep-lodash-4-17-21"]);
    assert_eq!(loader.in_flight(), 0);
}

#[tokio::test]
async fn separate_targets_share_cached_content() {
    let fetcher = Arc::new(StaticFetcher::new());
    publish(&fetcher, "dayjs", &[("1.11.10", json!({}))], "1.11.10");
    let loader = loader(fetcher.clone());
    let a = Document::new("acme.a");
    let b = Document::new("acme.b");
    let info = DependencyInfo::npm("dayjs", "1.11.10");

    loader.load_dependency(a.as_ref(), &info).await.unwrap();
    loader.load_dependency(b.as_ref(), &info).await.unwrap();

    assert_eq!(fetcher.hits(&format!("{CDN}/dayjs@1.11.10")), 1);
    assert_eq!(a.ids(), b.ids());
    assert!(loader.is_loaded("acme.b", "dayjs", "1.11.10"));
}

#[tokio::test]
async fn integrity_mismatch_is_not_cached_or_injected() {
    let fetcher = Arc::new(StaticFetcher::new());
    let url = "https://cdn.test/chart.umd.js";
    fetcher.route(url, "window.Chart = {}");
    let loader = loader(fetcher);
    let mut events = loader.events().subscribe();
    let doc = Document::new("acme.charts");

    let wrong = Integrity::compute(HashAlgorithm::Sha384, b"something else").to_string();
    let err = loader
        .load_dependency(doc.as_ref(), &umd("chart", url, Some(wrong)))
        .await
        .unwrap_err();

    assert!(matches!(err, HostError::Integrity { .. }));
    assert_eq!(loader.cache_len(), 0);
    assert!(loader.cached("chart", "1.0.0").is_none());
    assert!(doc.ids().is_empty());

    let mut names = Vec::new();
    while let Ok(e) = events.try_recv() {
        names.push(match e {
            DependencyEvent::Loading { .. } => "loading",
            DependencyEvent::Loaded { .. } => "loaded",
            DependencyEvent::Error { .. } => "error",
        });
    }
    assert_eq!(names, vec!["loading", "error"]);
}

#[tokio::test]
async fn published_digest_is_verified_and_attached() {
    let fetcher = Arc::new(StaticFetcher::new());
    let url = "https://cdn.test/chart.umd.js";
    let body = "window.Chart = {}";
    let digest = Integrity::compute(HashAlgorithm::Sha384, body.as_bytes()).to_string();
    fetcher.route(url, body);
    fetcher.route(format!("{url}.sri"), format!("{digest}\n"));
    let loader = loader(fetcher);
    let doc = Document::new("acme.charts");

    let resolution = loader
        .load_dependency(doc.as_ref(), &umd("chart", url, None))
        .await
        .unwrap();
    assert_eq!(resolution.integrity.as_deref(), Some(digest.as_str()));

    let element = doc.element(&element_id("chart", "1.0.0")).unwrap();
    assert_eq!(element.source, ScriptSource::Inline(body.to_string()));
    assert_eq!(element.integrity, Some(digest));
    assert_eq!(element.cross_origin.as_deref(), Some("anonymous"));
    assert!(!element.module);
}

#[tokio::test]
async fn missing_digest_fails_when_integrity_is_required() {
    let fetcher = Arc::new(StaticFetcher::new());
    let url = "https://cdn.test/chart.esm.js";
    fetcher.route(url, "export default {}");
    let loader = loader(fetcher);
    let doc = Document::new("acme.charts");

    let err = loader
        .load_dependency(doc.as_ref(), &umd("chart", url, None))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Dependency { .. }));
    assert_eq!(loader.cache_len(), 0);
    assert!(doc.ids().is_empty());
}

#[tokio::test]
async fn missing_digest_is_allowed_when_integrity_is_optional() {
    let fetcher = Arc::new(StaticFetcher::new());
    let url = "https://cdn.test/chart.esm.js";
    fetcher.route(url, "export default {}");
    let loader = lenient_loader(fetcher);
    let doc = Document::new("acme.charts");

    let resolution = loader
        .load_dependency(doc.as_ref(), &umd("chart", url, None))
        .await
        .unwrap();
    assert_eq!(resolution.integrity, None);
    let element = doc.element(&element_id("chart", "1.0.0")).unwrap();
    assert_eq!(element.integrity, None);
    assert_eq!(element.cross_origin, None);
}

#[tokio::test]
async fn digest_server_error_rejects_the_load() {
    let fetcher = Arc::new(StaticFetcher::new());
    let url = "https://cdn.test/chart.umd.js";
    fetcher.route(url, "window.Chart = {}");
    fetcher.fail(format!("{url}.sri"), 503);
    let loader = lenient_loader(fetcher.clone());
    let doc = Document::new("acme.charts");

    let err = loader
        .load_dependency(doc.as_ref(), &umd("chart", url, None))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Fetch(_)), "{err:?}");
    assert_eq!(loader.cache_len(), 0);
    assert!(doc.ids().is_empty());

    let body = "window.Chart = {}";
    let digest = Integrity::compute(HashAlgorithm::Sha384, body.as_bytes()).to_string();
    fetcher.route(format!("{url}.sri"), digest.clone());
    let resolution = loader
        .load_dependency(doc.as_ref(), &umd("chart", url, None))
        .await
        .unwrap();
    assert_eq!(resolution.integrity, Some(digest));
}

#[tokio::test]
async fn sub_dependencies_load_first_and_cycles_are_skipped() {
    let fetcher = Arc::new(StaticFetcher::new());
    publish(&fetcher, "app-lib", &[("2.0.0", json!({"helper": "^1.0.0"}))], "2.0.0");
    publish(&fetcher, "helper", &[("1.2.0", json!({"app-lib": "^2.0.0"}))], "1.2.0");
    let loader = loader(fetcher);
    let doc = Document::new("acme.charts");

    loader
        .load_dependency(doc.as_ref(), &DependencyInfo::npm("app-lib", "2.0.0"))
        .await
        .unwrap();
    assert_eq!(doc.ids(), vec!["dep-helper-1-2-0", "dep-app-lib-2-0-0"]);
}

#[tokio::test]
async fn unsatisfiable_range_fails() {
    let fetcher = Arc::new(StaticFetcher::new());
    publish(&fetcher, "lodash", &[("4.17.21", json!({}))], "4.17.21");
    let loader = loader(fetcher);
    let doc = Document::new("acme.charts");

    let err = loader
        .load_dependency(doc.as_ref(), &DependencyInfo::npm("lodash", "^5.0.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::NoMatchingVersion { .. }));
}

#[tokio::test]
async fn unload_removes_element_and_content() {
    let fetcher = Arc::new(StaticFetcher::new());
    publish(&fetcher, "lodash", &[("4.17.21", json!({}))], "4.17.21");
    let loader = loader(fetcher);
    let doc = Document::new("acme.charts");
    loader
        .load_dependency(doc.as_ref(), &DependencyInfo::npm("lodash", "4.17.21"))
        .await
        .unwrap();

    assert!(loader
        .unload_dependency(doc.as_ref(), "lodash", "4.17.21")
        .await
        .unwrap());
    assert!(doc.ids().is_empty());
    assert_eq!(loader.cache_len(), 0);
    assert!(!loader
        .unload_dependency(doc.as_ref(), "lodash", "4.17.21")
        .await
        .unwrap());
}

#[tokio::test]
async fn update_checker_finds_and_applies_newer_versions() {
    let fetcher = Arc::new(StaticFetcher::new());
    publish(&fetcher, "lodash", &[("4.17.20", json!({}))], "4.17.20");
    let manager = Arc::new(DependencyManager::new(Arc::new(loader(fetcher.clone()))));
    let plugin = PluginId::parse("acme.charts").unwrap();
    let doc = Document::new("acme.charts");

    let mut libraries = BTreeMap::new();
    libraries.insert(
        "lodash".to_string(),
        LibraryDependency {
            version: "^4.17.0".into(),
            kind: LibraryKind::Npm,
            url: None,
            integrity: None,
        },
    );
    manager
        .load_for_plugin(&plugin, doc.clone(), &libraries)
        .await
        .unwrap();

    let checker = UpdateChecker::new(manager.clone());
    let mut events = checker.events().subscribe();
    assert!(checker.check_for_updates().await.is_empty());

    publish(
        &fetcher,
        "lodash",
        &[("4.17.20", json!({})), ("4.17.21", json!({}))],
        "4.17.21",
    );
    let updates = checker.check_for_updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].current, "4.17.20");
    assert_eq!(updates[0].latest, "4.17.21");

    checker.apply_update(&updates[0]).await.unwrap();
    assert_eq!(doc.ids(), vec!["dep-lodash-4-17-21"]);
    assert_eq!(manager.resolutions(&plugin)[0].version, "4.17.21");

    let mut applied = Vec::new();
    while let Ok(e) = events.try_recv() {
        if let UpdateEvent::Applied { from, to, .. } = e {
            applied.push((from, to));
        }
    }
    assert_eq!(applied, vec![("4.17.20".to_string(), "4.17.21".to_string())]);
}
