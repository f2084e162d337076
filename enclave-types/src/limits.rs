//! Sandbox resource limits, the metrics that mirror them and sandbox options.

use crate::ResourceDeclaration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource limits enforced on a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    /// Heap ceiling in megabytes.
    pub max_memory: u64,
    /// CPU share in percent of one core.
    #[serde(rename = "maxCPU")]
    pub max_cpu: f64,
    /// Outbound requests allowed over the sandbox lifetime.
    pub max_network_requests: u64,
    #[serde(rename = "maxDOMNodes")]
    pub max_dom_nodes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory: 100,
            max_cpu: 50.0,
            max_network_requests: 100,
            max_dom_nodes: 1000,
        }
    }
}

impl ResourceLimits {
    /// Applies a manifest's declared limits over these.
    #[must_use]
    pub fn with_declared(mut self, declared: &ResourceDeclaration) -> Self {
        if let Some(v) = declared.max_memory {
            self.max_memory = v;
        }
        if let Some(v) = declared.max_cpu {
            self.max_cpu = v;
        }
        if let Some(v) = declared.max_network_requests {
            self.max_network_requests = v;
        }
        if let Some(v) = declared.max_dom_nodes {
            self.max_dom_nodes = v;
        }
        self
    }
}

/// A limited resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resource {
    Memory,
    Cpu,
    Network,
    DomNodes,
}

impl Resource {
    pub const ALL: [Resource; 4] = [Self::Memory, Self::Cpu, Self::Network, Self::DomNodes];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Network => "network",
            Self::DomNodes => "domNodes",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `{used, limit}` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub used: f64,
    pub limit: f64,
}

impl ResourceUsage {
    pub fn new(used: f64, limit: f64) -> Self {
        Self { used, limit }
    }

    /// `used / limit`, or zero for a zero limit.
    pub fn ratio(&self) -> f64 {
        if self.limit > 0.0 { self.used / self.limit } else { 0.0 }
    }

    pub fn exceeded(&self) -> bool {
        self.used > self.limit
    }
}

/// Live usage of every limited resource of one sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxMetrics {
    pub memory: ResourceUsage,
    pub cpu: ResourceUsage,
    pub network: ResourceUsage,
    pub dom_nodes: ResourceUsage,
}

impl SandboxMetrics {
    /// Zero usage against the given limits.
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        Self {
            memory: ResourceUsage::new(0.0, limits.max_memory as f64),
            cpu: ResourceUsage::new(0.0, limits.max_cpu),
            network: ResourceUsage::new(0.0, limits.max_network_requests as f64),
            dom_nodes: ResourceUsage::new(0.0, limits.max_dom_nodes as f64),
        }
    }

    pub fn usage(&self, resource: Resource) -> ResourceUsage {
        match resource {
            Resource::Memory => self.memory,
            Resource::Cpu => self.cpu,
            Resource::Network => self.network,
            Resource::DomNodes => self.dom_nodes,
        }
    }

    /// Resources whose usage is currently above the limit.
    pub fn violations(&self) -> Vec<Resource> {
        Resource::ALL
            .into_iter()
            .filter(|r| self.usage(*r).exceeded())
            .collect()
    }

    /// Highest used/limit ratio across all resources.
    pub fn peak_ratio(&self) -> f64 {
        Resource::ALL
            .into_iter()
            .map(|r| self.usage(r).ratio())
            .fold(0.0, f64::max)
    }
}

/// Content-Security-Policy allow-lists applied to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CspAllowList {
    pub script_src: Vec<String>,
    pub style_src: Vec<String>,
    pub connect_src: Vec<String>,
    pub img_src: Vec<String>,
    pub font_src: Vec<String>,
}

impl Default for CspAllowList {
    fn default() -> Self {
        Self {
            script_src: vec!["'self'".into()],
            style_src: vec!["'self'".into(), "'unsafe-inline'".into()],
            connect_src: vec!["'self'".into()],
            img_src: vec!["'self'".into(), "data:".into()],
            font_src: vec!["'self'".into()],
        }
    }
}

/// Options a sandbox is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxOptions {
    pub limits: ResourceLimits,
    pub csp: CspAllowList,
    pub telemetry_interval_ms: u64,
    pub limit_check_interval_ms: u64,
    pub load_timeout_ms: u64,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            csp: CspAllowList::default(),
            telemetry_interval_ms: 1_000,
            limit_check_interval_ms: 1_000,
            load_timeout_ms: 5_000,
        }
    }
}

/// Caller-supplied overrides merged over configured sandbox defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxOverrides {
    pub limits: Option<ResourceDeclaration>,
    pub csp: Option<CspAllowList>,
    pub telemetry_interval_ms: Option<u64>,
    pub limit_check_interval_ms: Option<u64>,
    pub load_timeout_ms: Option<u64>,
}

impl SandboxOverrides {
    /// Overrides carrying only a manifest's declared limits.
    pub fn from_declared(declared: Option<ResourceDeclaration>) -> Self {
        Self {
            limits: declared,
            ..Self::default()
        }
    }
}

impl SandboxOptions {
    /// Returns these options with `overrides` applied.
    #[must_use]
    pub fn merged(&self, overrides: &SandboxOverrides) -> Self {
        let mut out = self.clone();
        if let Some(decl) = &overrides.limits {
            out.limits = out.limits.with_declared(decl);
        }
        if let Some(csp) = &overrides.csp {
            out.csp = csp.clone();
        }
        if let Some(v) = overrides.telemetry_interval_ms {
            out.telemetry_interval_ms = v;
        }
        if let Some(v) = overrides.limit_check_interval_ms {
            out.limit_check_interval_ms = v;
        }
        if let Some(v) = overrides.load_timeout_ms {
            out.load_timeout_ms = v;
        }
        out
    }
}
