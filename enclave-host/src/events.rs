//! Typed event buses.
//!
//! Every host component that publishes events owns one [`EventBus`] over its
//! own event enum. Handlers run synchronously, in registration order, on the
//! emitting task.

use crate::monitor::HealthStatus;
use enclave_types::{PluginId, Resource, SandboxMetrics};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// An event with a stable wire name such as `plugin:install`.
pub trait HostEvent: Clone + Send + Sync + 'static {
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscription<E> {
    id: SubscriptionId,
    /// `None` receives every event.
    name: Option<&'static str>,
    handler: Handler<E>,
}

/// Event name to ordered handlers. Clones share subscribers.
pub struct EventBus<E> {
    subscriptions: Arc<RwLock<Vec<Subscription<E>>>>,
    next_id: Arc<AtomicU64>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscriptions: self.subscriptions.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<E: HostEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: HostEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn add(&self, name: Option<&'static str>, handler: Handler<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().unwrap().push(Subscription { id, name, handler });
        id
    }

    /// Subscribes to events named `name`.
    pub fn on<F>(&self, name: &'static str, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add(Some(name), Arc::new(handler))
    }

    /// Subscribes to every event.
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write().unwrap();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Forwards every event into a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_any(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    pub fn emit(&self, event: E) {
        let name = event.name();
        let handlers: Vec<Handler<E>> = self
            .subscriptions
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.name.is_none_or(|n| n == name))
            .map(|s| s.handler.clone())
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().unwrap().len()
    }
}

// ── Event enums ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PluginEvent {
    Install { plugin_id: PluginId, version: String },
    Uninstall { plugin_id: PluginId },
    Start { plugin_id: PluginId },
    Stop { plugin_id: PluginId },
    Error { plugin_id: PluginId, message: String },
    Update { plugin_id: PluginId, from: String, to: String },
}

impl HostEvent for PluginEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Install { .. } => "plugin:install",
            Self::Uninstall { .. } => "plugin:uninstall",
            Self::Start { .. } => "plugin:start",
            Self::Stop { .. } => "plugin:stop",
            Self::Error { .. } => "plugin:error",
            Self::Update { .. } => "plugin:update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DependencyEvent {
    Loading { name: String, version: String },
    Loaded { name: String, version: String },
    Error { name: String, version: String, message: String },
}

impl HostEvent for DependencyEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Loading { .. } => "dependency:loading",
            Self::Loaded { .. } => "dependency:loaded",
            Self::Error { .. } => "dependency:error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UpdateEvent {
    Available { name: String, current: String, latest: String },
    Downloaded { name: String, version: String },
    Applied { name: String, from: String, to: String },
    Error { name: String, message: String },
}

impl HostEvent for UpdateEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Available { .. } => "update:available",
            Self::Downloaded { .. } => "update:downloaded",
            Self::Applied { .. } => "update:applied",
            Self::Error { .. } => "update:error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MonitorEvent {
    MetricsUpdate {
        plugin_id: PluginId,
        metrics: SandboxMetrics,
        status: HealthStatus,
    },
    HealthChange {
        plugin_id: PluginId,
        from: HealthStatus,
        to: HealthStatus,
    },
}

impl HostEvent for MonitorEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::MetricsUpdate { .. } => "metrics:update",
            Self::HealthChange { .. } => "health:change",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SandboxEvent {
    Created { plugin_id: PluginId },
    Destroyed { plugin_id: PluginId },
    /// Destroyed by the violation policy after exceeding `resource`.
    Evicted { plugin_id: PluginId, resource: Resource },
    /// Fresh metrics after a telemetry report.
    Metrics { plugin_id: PluginId, metrics: SandboxMetrics },
    ResourceViolation {
        plugin_id: PluginId,
        resource: Resource,
        metrics: SandboxMetrics,
    },
    /// Emitted by the plugin through its SDK.
    PluginEvent { plugin_id: PluginId, event: String, data: Value },
    ComponentRegistered { plugin_id: PluginId, tag: String },
    Error { plugin_id: PluginId, message: String },
}

impl HostEvent for SandboxEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "sandbox:created",
            Self::Destroyed { .. } => "sandbox:destroyed",
            Self::Evicted { .. } => "sandbox:evicted",
            Self::Metrics { .. } => "sandbox:metrics",
            Self::ResourceViolation { .. } => "resource-violation",
            Self::PluginEvent { .. } => "sandbox:plugin-event",
            Self::ComponentRegistered { .. } => "sandbox:component",
            Self::Error { .. } => "sandbox:error",
        }
    }
}

impl SandboxEvent {
    pub fn plugin_id(&self) -> &PluginId {
        match self {
            Self::Created { plugin_id }
            | Self::Destroyed { plugin_id }
            | Self::Evicted { plugin_id, .. }
            | Self::Metrics { plugin_id, .. }
            | Self::ResourceViolation { plugin_id, .. }
            | Self::PluginEvent { plugin_id, .. }
            | Self::ComponentRegistered { plugin_id, .. }
            | Self::Error { plugin_id, .. } => plugin_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn id() -> PluginId {
        PluginId::parse("acme.charts").unwrap()
    }

    #[test]
    fn handlers_run_in_registration_order_and_filter_by_name() {
        let bus = EventBus::<PluginEvent>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        bus.on("plugin:start", move |_| l.lock().unwrap().push("first"));
        let l = log.clone();
        bus.on_any(move |_| l.lock().unwrap().push("any"));
        let l = log.clone();
        bus.on("plugin:stop", move |_| l.lock().unwrap().push("stop"));

        bus.emit(PluginEvent::Start { plugin_id: id() });
        assert_eq!(*log.lock().unwrap(), vec!["first", "any"]);
    }

    #[test]
    fn off_removes_handler() {
        let bus = EventBus::<PluginEvent>::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let sub = bus.on_any(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(PluginEvent::Stop { plugin_id: id() });
        assert!(bus.off(sub));
        assert!(!bus.off(sub));
        bus.emit(PluginEvent::Stop { plugin_id: id() });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_names_match_wire_names() {
        let v = SandboxEvent::ResourceViolation {
            plugin_id: id(),
            resource: Resource::Network,
            metrics: SandboxMetrics::default(),
        };
        assert_eq!(v.name(), "resource-violation");
        assert_eq!(
            UpdateEvent::Available {
                name: "lodash".into(),
                current: "4.17.20".into(),
                latest: "4.17.21".into()
            }
            .name(),
            "update:available"
        );
    }
}
