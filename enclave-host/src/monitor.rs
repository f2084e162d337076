//! Per-plugin metrics aggregation and health classification.

use crate::error::{HostError, HostResult};
use crate::events::{EventBus, MonitorEvent};
use enclave_types::{PluginId, Resource, SandboxMetrics, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        })
    }
}

/// `[monitor]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// used/limit ratio at which a plugin is degraded.
    pub warning_threshold: f64,
    /// used/limit ratio at which a plugin is critical.
    pub critical_threshold: f64,
    /// Samples kept per plugin.
    pub history_size: usize,
    /// Recorded errors at which a plugin is degraded.
    pub degraded_errors: u64,
    /// Recorded errors at which a plugin is critical.
    pub critical_errors: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.75,
            critical_threshold: 0.9,
            history_size: 100,
            degraded_errors: 1,
            critical_errors: 5,
        }
    }
}

impl MonitorConfig {
    pub(crate) fn validate(&self) -> HostResult<()> {
        if !(self.warning_threshold > 0.0 && self.warning_threshold < self.critical_threshold) {
            return Err(HostError::Config(
                "monitor thresholds must satisfy 0 < warning < critical".into(),
            ));
        }
        if self.history_size == 0 {
            return Err(HostError::Config("monitor.history_size must be positive".into()));
        }
        if self.degraded_errors > self.critical_errors {
            return Err(HostError::Config(
                "monitor.degraded_errors exceeds monitor.critical_errors".into(),
            ));
        }
        Ok(())
    }

    fn classify(&self, peak_ratio: f64, errors: u64) -> HealthStatus {
        let by_usage = if peak_ratio >= self.critical_threshold {
            HealthStatus::Critical
        } else if peak_ratio >= self.warning_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        let by_errors = if self.critical_errors > 0 && errors >= self.critical_errors {
            HealthStatus::Critical
        } else if self.degraded_errors > 0 && errors >= self.degraded_errors {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        by_usage.max(by_errors)
    }
}

/// One value per limited resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    pub memory: f64,
    pub cpu: f64,
    pub network: f64,
    pub dom_nodes: f64,
}

impl ResourceSummary {
    fn get_mut(&mut self, resource: Resource) -> &mut f64 {
        match resource {
            Resource::Memory => &mut self.memory,
            Resource::Cpu => &mut self.cpu,
            Resource::Network => &mut self.network,
            Resource::DomNodes => &mut self.dom_nodes,
        }
    }
}

/// Snapshot returned by [`Monitor::health`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginHealth {
    pub plugin_id: PluginId,
    pub status: HealthStatus,
    pub latest: Option<SandboxMetrics>,
    pub average: ResourceSummary,
    pub peak: ResourceSummary,
    pub samples: usize,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub updated_at: Timestamp,
}

struct PluginStats {
    history: VecDeque<SandboxMetrics>,
    status: HealthStatus,
    error_count: u64,
    last_error: Option<String>,
    updated_at: Timestamp,
}

impl PluginStats {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            status: HealthStatus::Healthy,
            error_count: 0,
            last_error: None,
            updated_at: Timestamp::now(),
        }
    }

    fn latest_ratio(&self) -> f64 {
        self.history.back().map_or(0.0, SandboxMetrics::peak_ratio)
    }

    fn snapshot(&self, plugin_id: &PluginId) -> PluginHealth {
        let mut average = ResourceSummary::default();
        let mut peak = ResourceSummary::default();
        for sample in &self.history {
            for r in Resource::ALL {
                let used = sample.usage(r).used;
                *average.get_mut(r) += used;
                let p = peak.get_mut(r);
                *p = p.max(used);
            }
        }
        if !self.history.is_empty() {
            let n = self.history.len() as f64;
            for r in Resource::ALL {
                *average.get_mut(r) /= n;
            }
        }
        PluginHealth {
            plugin_id: plugin_id.clone(),
            status: self.status,
            latest: self.history.back().copied(),
            average,
            peak,
            samples: self.history.len(),
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Aggregates sandbox telemetry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Monitor {
    config: Arc<MonitorConfig>,
    stats: Arc<Mutex<HashMap<PluginId, PluginStats>>>,
    events: EventBus<MonitorEvent>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config: Arc::new(config),
            stats: Arc::new(Mutex::new(HashMap::new())),
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus<MonitorEvent> {
        &self.events
    }

    /// Appends a sample and reclassifies. Emits `metrics:update`, plus
    /// `health:change` when the status moved.
    pub fn record(&self, plugin_id: &PluginId, metrics: SandboxMetrics) -> HealthStatus {
        let (from, to) = {
            let mut stats = self.stats.lock().unwrap();
            let entry = stats.entry(plugin_id.clone()).or_insert_with(PluginStats::new);
            entry.history.push_back(metrics);
            while entry.history.len() > self.config.history_size {
                entry.history.pop_front();
            }
            entry.updated_at = Timestamp::now();
            let from = entry.status;
            entry.status = self.config.classify(entry.latest_ratio(), entry.error_count);
            (from, entry.status)
        };

        self.events.emit(MonitorEvent::MetricsUpdate {
            plugin_id: plugin_id.clone(),
            metrics,
            status: to,
        });
        self.emit_change(plugin_id, from, to);
        to
    }

    pub fn record_error(&self, plugin_id: &PluginId, message: impl Into<String>) -> HealthStatus {
        let (from, to) = {
            let mut stats = self.stats.lock().unwrap();
            let entry = stats.entry(plugin_id.clone()).or_insert_with(PluginStats::new);
            entry.error_count += 1;
            entry.last_error = Some(message.into());
            entry.updated_at = Timestamp::now();
            let from = entry.status;
            entry.status = self.config.classify(entry.latest_ratio(), entry.error_count);
            (from, entry.status)
        };
        self.emit_change(plugin_id, from, to);
        to
    }

    fn emit_change(&self, plugin_id: &PluginId, from: HealthStatus, to: HealthStatus) {
        if from == to {
            return;
        }
        if to > from {
            info!(plugin_id = %plugin_id, %from, %to, "plugin health degraded");
        } else {
            debug!(plugin_id = %plugin_id, %from, %to, "plugin health recovered");
        }
        self.events.emit(MonitorEvent::HealthChange {
            plugin_id: plugin_id.clone(),
            from,
            to,
        });
    }

    pub fn health(&self, plugin_id: &PluginId) -> Option<PluginHealth> {
        self.stats
            .lock()
            .unwrap()
            .get(plugin_id)
            .map(|s| s.snapshot(plugin_id))
    }

    /// Health of every tracked plugin, ordered by id.
    pub fn all_health(&self) -> Vec<PluginHealth> {
        let stats = self.stats.lock().unwrap();
        let mut all: Vec<_> = stats.iter().map(|(id, s)| s.snapshot(id)).collect();
        all.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        all
    }

    pub fn remove(&self, plugin_id: &PluginId) -> bool {
        self.stats.lock().unwrap().remove(plugin_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_types::{ResourceLimits, ResourceUsage};

    fn id() -> PluginId {
        PluginId::parse("acme.charts").unwrap()
    }

    fn memory(used: f64) -> SandboxMetrics {
        let mut m = SandboxMetrics::from_limits(&ResourceLimits::default());
        m.memory = ResourceUsage::new(used, 100.0);
        m
    }

    #[test]
    fn classifies_by_highest_ratio() {
        let monitor = Monitor::default();
        assert_eq!(monitor.record(&id(), memory(10.0)), HealthStatus::Healthy);
        assert_eq!(monitor.record(&id(), memory(80.0)), HealthStatus::Degraded);
        assert_eq!(monitor.record(&id(), memory(95.0)), HealthStatus::Critical);
        assert_eq!(monitor.record(&id(), memory(5.0)), HealthStatus::Healthy);
    }

    #[test]
    fn averages_and_peaks_over_bounded_history() {
        let monitor = Monitor::new(MonitorConfig {
            history_size: 2,
            ..MonitorConfig::default()
        });
        monitor.record(&id(), memory(90.0));
        monitor.record(&id(), memory(20.0));
        monitor.record(&id(), memory(40.0));

        let health = monitor.health(&id()).unwrap();
        assert_eq!(health.samples, 2);
        assert_eq!(health.average.memory, 30.0);
        assert_eq!(health.peak.memory, 40.0);
        assert_eq!(health.latest.unwrap().memory.used, 40.0);
    }

    #[test]
    fn errors_degrade_health() {
        let monitor = Monitor::new(MonitorConfig {
            degraded_errors: 1,
            critical_errors: 2,
            ..MonitorConfig::default()
        });
        assert_eq!(monitor.record_error(&id(), "boom"), HealthStatus::Degraded);
        assert_eq!(monitor.record_error(&id(), "boom again"), HealthStatus::Critical);
        let health = monitor.health(&id()).unwrap();
        assert_eq!(health.error_count, 2);
        assert_eq!(health.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn emits_update_for_every_sample_and_change_on_transition() {
        let monitor = Monitor::default();
        let mut rx = monitor.events().subscribe();
        monitor.record(&id(), memory(10.0));
        monitor.record(&id(), memory(20.0));
        monitor.record(&id(), memory(99.0));

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(crate::events::HostEvent::name(&event));
        }
        assert_eq!(
            names,
            vec!["metrics:update", "metrics:update", "metrics:update", "health:change"]
        );
    }

    #[test]
    fn remove_and_all_health() {
        let monitor = Monitor::default();
        let other = PluginId::parse("acme.maps").unwrap();
        monitor.record(&other, memory(1.0));
        monitor.record(&id(), memory(1.0));
        let ids: Vec<_> = monitor.all_health().into_iter().map(|h| h.plugin_id).collect();
        assert_eq!(ids, vec![id(), other.clone()]);
        assert!(monitor.remove(&other));
        assert!(!monitor.remove(&other));
        assert_eq!(monitor.all_health().len(), 1);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let config = MonitorConfig {
            warning_threshold: 0.95,
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
