//! Host configuration, read from `enclave.toml`.
//!
//! ```toml
//! [ipc]
//! host_origin = "enclave://host"
//! enable_encryption = true
//! passphrase = "correct horse battery staple"
//!
//! [rpc]
//! timeout_ms = 5000
//! retries = 2
//!
//! [sandbox]
//! violation_policy = "report"
//!
//! [sandbox.defaults.limits]
//! maxMemory = 128
//!
//! [dependencies]
//! registry_url = "https://registry.npmjs.org"
//!
//! [policy]
//! mode = "denylist"
//! plugin_ids = ["evil.plugin"]
//! ```

use crate::error::{HostError, HostResult};
use crate::logger::LogLevel;
use crate::monitor::MonitorConfig;
use crate::policy::PolicyConfig;
use crate::sandbox_manager::ViolationPolicy;
use enclave_crypto::{derive_key, ChannelKey, KdfParams, Salt};
use enclave_ipc::RpcConfig;
use enclave_storage::{KeyValueStore, MemoryStore, SqliteStore};
use enclave_types::{PluginId, SandboxOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub ipc: IpcSettings,
    pub rpc: RpcSettings,
    pub sandbox: SandboxSettings,
    pub dependencies: DependencySettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub policy: PolicyConfig,
    pub monitor: MonitorConfig,
}

impl HostConfig {
    /// Reads and validates `path`. A missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> HostResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no host config found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        info!(path = %path.display(), "loaded host config");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> HostResult<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| HostError::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HostResult<()> {
        self.ipc.validate()?;
        self.rpc.validate()?;
        self.sandbox.validate()?;
        self.dependencies.validate()?;
        self.monitor.validate()?;
        if self.storage.prefix.is_empty() {
            return Err(HostError::Config("storage.prefix must not be empty".into()));
        }
        if self.logging.max_entries == 0 {
            return Err(HostError::Config("logging.max_entries must be positive".into()));
        }
        Ok(())
    }

    /// Opens the configured store: SQLite when a path is set, memory otherwise.
    pub fn open_store(&self) -> HostResult<Arc<dyn KeyValueStore>> {
        Ok(match &self.storage.path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        })
    }
}

fn config_error(message: impl Into<String>) -> HostError {
    HostError::Config(message.into())
}

// ── [ipc] ────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcSettings {
    pub host_origin: String,
    /// Sandboxes live at `<scheme>://<pluginId>`.
    pub sandbox_scheme: String,
    pub enable_encryption: bool,
    /// Base64 32-byte key. Takes precedence over `passphrase`.
    pub encryption_key: Option<String>,
    pub passphrase: Option<String>,
    /// Base64 salt for `passphrase`; random per process when absent.
    pub salt: Option<String>,
    pub enable_authentication: bool,
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for IpcSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcSettings")
            .field("host_origin", &self.host_origin)
            .field("sandbox_scheme", &self.sandbox_scheme)
            .field("enable_encryption", &self.enable_encryption)
            .field("enable_authentication", &self.enable_authentication)
            .finish_non_exhaustive()
    }
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            host_origin: "enclave://host".into(),
            sandbox_scheme: "enclave-sandbox".into(),
            enable_encryption: false,
            encryption_key: None,
            passphrase: None,
            salt: None,
            enable_authentication: false,
            auth_token: None,
        }
    }
}

impl IpcSettings {
    pub fn sandbox_origin(&self, plugin_id: &PluginId) -> String {
        format!("{}://{}", self.sandbox_scheme, plugin_id)
    }

    fn validate(&self) -> HostResult<()> {
        if self.host_origin.is_empty() || self.host_origin == enclave_ipc::ANY_ORIGIN {
            return Err(config_error("ipc.host_origin must be a concrete origin"));
        }
        if self.sandbox_scheme.is_empty() || self.sandbox_scheme.contains(':') {
            return Err(config_error("ipc.sandbox_scheme must be a bare scheme"));
        }
        if self.enable_encryption {
            match (&self.encryption_key, &self.passphrase) {
                (Some(key), _) => {
                    ChannelKey::from_base64(key)?;
                }
                (None, Some(p)) if !p.is_empty() => {}
                _ => {
                    return Err(config_error(
                        "ipc.enable_encryption requires encryption_key or passphrase",
                    ));
                }
            }
            if let Some(salt) = &self.salt {
                Salt::from_base64(salt)?;
            }
        }
        if self.enable_authentication && self.auth_token.as_deref().is_none_or(str::is_empty) {
            return Err(config_error("ipc.enable_authentication requires auth_token"));
        }
        Ok(())
    }

    /// Resolves the channel key, deriving it from the passphrase if needed.
    pub fn channel_key(&self) -> HostResult<Option<ChannelKey>> {
        if !self.enable_encryption {
            return Ok(None);
        }
        if let Some(key) = &self.encryption_key {
            return Ok(Some(ChannelKey::from_base64(key)?));
        }
        let Some(passphrase) = &self.passphrase else {
            return Err(config_error(
                "ipc.enable_encryption requires encryption_key or passphrase",
            ));
        };
        let salt = match &self.salt {
            Some(s) => Salt::from_base64(s)?,
            None => Salt::random(),
        };
        Ok(Some(derive_key(passphrase, &salt, &KdfParams::default())?))
    }
}

// ── [rpc] ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub timeout_ms: u64,
    pub retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            retries: 0,
            backoff_base_ms: 100,
            backoff_cap_ms: 5_000,
        }
    }
}

impl RpcSettings {
    fn validate(&self) -> HostResult<()> {
        if self.timeout_ms == 0 {
            return Err(config_error("rpc.timeout_ms must be positive"));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(config_error("rpc.backoff_base_ms exceeds rpc.backoff_cap_ms"));
        }
        Ok(())
    }

    pub fn to_rpc_config(&self) -> RpcConfig {
        RpcConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            retries: self.retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }
}

// ── [sandbox] ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Options every sandbox starts from before manifest overrides.
    pub defaults: SandboxOptions,
    pub violation_policy: ViolationPolicy,
}

impl SandboxSettings {
    fn validate(&self) -> HostResult<()> {
        let d = &self.defaults;
        if d.telemetry_interval_ms == 0 || d.limit_check_interval_ms == 0 {
            return Err(config_error("sandbox intervals must be positive"));
        }
        if d.load_timeout_ms == 0 {
            return Err(config_error("sandbox.defaults.loadTimeoutMs must be positive"));
        }
        let l = &d.limits;
        if l.max_memory == 0 || l.max_cpu <= 0.0 || l.max_dom_nodes == 0 {
            return Err(config_error("sandbox default limits must be positive"));
        }
        Ok(())
    }
}

// ── [dependencies] ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencySettings {
    /// npm-compatible registry serving package metadata at `<url>/<name>`.
    pub registry_url: String,
    /// CDN serving npm files at `<url>/<name>@<version>`.
    pub cdn_url: String,
    /// Appended to a script URL to find its digest document.
    pub integrity_suffix: String,
    /// Fail loads whose integrity cannot be established. When off, such
    /// loads go ahead with a warning.
    pub require_integrity: bool,
    pub update_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for DependencySettings {
    fn default() -> Self {
        Self {
            registry_url: "https://registry.npmjs.org".into(),
            cdn_url: "https://unpkg.com".into(),
            integrity_suffix: ".sri".into(),
            require_integrity: true,
            update_interval_secs: 3_600,
            request_timeout_secs: 30,
        }
    }
}

impl DependencySettings {
    fn validate(&self) -> HostResult<()> {
        if self.registry_url.is_empty() || self.cdn_url.is_empty() {
            return Err(config_error("dependencies.registry_url and cdn_url are required"));
        }
        if self.integrity_suffix.is_empty() {
            return Err(config_error("dependencies.integrity_suffix must not be empty"));
        }
        if self.update_interval_secs == 0 {
            return Err(config_error("dependencies.update_interval_secs must be positive"));
        }
        Ok(())
    }
}

// ── [storage] / [logging] ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Plugin records live under `<prefix><pluginId>`.
    pub prefix: String,
    /// SQLite file; in-memory when unset.
    pub path: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            prefix: "enclave_plugin_".into(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub min_level: LogLevel,
    pub max_entries: usize,
    pub persist: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            max_entries: 1_000,
            persist: true,
        }
    }
}
