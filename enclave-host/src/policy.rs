//! Install policy: plugin id allow/deny lists and denied permissions,
//! read from the `[policy]` section of the host config.

use crate::error::{HostError, HostResult};
use enclave_types::{Permission, PermissionSet, PluginManifest};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Policy mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Only listed plugins can be installed.
    Allowlist,
    /// All plugins except listed ones can be installed.
    Denylist,
    #[default]
    Unrestricted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    /// Allowed ids in allowlist mode, blocked ids in denylist mode.
    pub plugin_ids: Vec<String>,
    pub denied_permissions: HashSet<Permission>,
}

/// Enforces install policy decisions.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn with_config(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn is_plugin_allowed(&self, plugin_id: &str) -> bool {
        let listed = self.config.plugin_ids.iter().any(|id| id == plugin_id);
        match self.config.mode {
            PolicyMode::Unrestricted => true,
            PolicyMode::Allowlist => listed,
            PolicyMode::Denylist => !listed,
        }
    }

    pub fn is_permission_denied(&self, permission: Permission) -> bool {
        self.config.denied_permissions.contains(&permission)
    }

    /// Rejects a manifest whose id is blocked or that requests a denied permission.
    pub fn check_manifest(&self, manifest: &PluginManifest) -> HostResult<()> {
        if !self.is_plugin_allowed(&manifest.id) {
            return Err(HostError::PolicyDenied(format!(
                "plugin '{}' blocked by policy",
                manifest.id
            )));
        }
        if let Some(p) = manifest
            .permissions
            .iter()
            .find(|p| self.is_permission_denied(**p))
        {
            return Err(HostError::PolicyDenied(format!(
                "plugin '{}' requests denied permission '{}'",
                manifest.id,
                p.as_str()
            )));
        }
        Ok(())
    }

    /// Permissions a plugin runs with: its declaration minus policy denials.
    pub fn permissions_for(&self, manifest: &PluginManifest) -> PermissionSet {
        let mut set = PermissionSet::from_declared(&manifest.permissions);
        for p in &self.config.denied_permissions {
            set.deny(*p);
        }
        set
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str, permissions: Vec<Permission>) -> PluginManifest {
        let mut m = PluginManifest::from_json(&format!(
            r#"{{"id":"{id}","name":"X","version":"1.0.0",
                "entry":{{"main":"https://cdn.test/x.js"}}}}"#
        ))
        .unwrap();
        m.permissions = permissions;
        m
    }

    #[test]
    fn unrestricted_allows_all() {
        let engine = PolicyEngine::default();
        assert!(engine.is_plugin_allowed("anything"));
        assert!(!engine.is_permission_denied(Permission::Network));
    }

    #[test]
    fn allowlist_mode() {
        let engine = PolicyEngine::with_config(PolicyConfig {
            mode: PolicyMode::Allowlist,
            plugin_ids: vec!["acme.charts".into()],
            ..Default::default()
        });
        assert!(engine.is_plugin_allowed("acme.charts"));
        assert!(!engine.is_plugin_allowed("evil.plugin"));
    }

    #[test]
    fn denylist_mode_blocks_listed_allows_others() {
        let engine = PolicyEngine::with_config(PolicyConfig {
            mode: PolicyMode::Denylist,
            plugin_ids: vec!["evil.plugin".into()],
            ..Default::default()
        });
        assert!(!engine.is_plugin_allowed("evil.plugin"));
        assert!(engine.is_plugin_allowed("good.plugin"));
        assert!(matches!(
            engine.check_manifest(&manifest("evil.plugin", vec![])),
            Err(HostError::PolicyDenied(_))
        ));
    }

    #[test]
    fn denied_permissions_reject_manifest_and_strip_grants() {
        let engine = PolicyEngine::with_config(PolicyConfig {
            denied_permissions: [Permission::Network].into_iter().collect(),
            ..Default::default()
        });
        let err = engine
            .check_manifest(&manifest("acme.charts", vec![Permission::Network]))
            .unwrap_err();
        assert!(err.to_string().contains("network"));

        let m = manifest("acme.charts", vec![Permission::Storage]);
        engine.check_manifest(&m).unwrap();
        let perms = engine.permissions_for(&m);
        assert!(perms.is_granted(Permission::Storage));
        assert!(perms.is_granted(Permission::Events));
        assert!(perms.is_denied(Permission::Network));
    }

    #[test]
    fn parses_from_toml() {
        let config: PolicyConfig = toml::from_str(
            r#"
mode = "allowlist"
plugin_ids = ["acme.charts", "acme.maps"]
denied_permissions = ["network", "notifications"]
"#,
        )
        .unwrap();
        assert_eq!(config.mode, PolicyMode::Allowlist);
        assert_eq!(config.plugin_ids.len(), 2);
        assert!(config.denied_permissions.contains(&Permission::Notifications));
    }
}
