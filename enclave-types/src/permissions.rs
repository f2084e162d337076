//! Capability-based permission model for plugin sandboxes.
//!
//! Two tiers:
//! - Always granted: events, host-api
//! - Install-time declared: network, storage, ui, notifications

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Individual capability a plugin may declare in its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    // Always granted
    Events,
    HostApi,

    // Install-time
    Network,
    Storage,
    Ui,
    Notifications,
}

impl Permission {
    pub const ALL: [Permission; 6] = [
        Self::Events,
        Self::HostApi,
        Self::Network,
        Self::Storage,
        Self::Ui,
        Self::Notifications,
    ];

    /// Whether every plugin holds this permission regardless of its manifest.
    pub fn always_granted(&self) -> bool {
        matches!(self, Self::Events | Self::HostApi)
    }

    /// Manifest spelling of the permission.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::HostApi => "host-api",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Ui => "ui",
            Self::Notifications => "notifications",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownPermission(s.to_string()))
    }
}

/// Set of permissions granted to a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    granted: HashSet<Permission>,
    /// Permissions removed by policy; these win over the manifest.
    denied: HashSet<Permission>,
}

impl PermissionSet {
    /// Always-granted permissions only.
    pub fn baseline() -> Self {
        let granted = Permission::ALL
            .into_iter()
            .filter(Permission::always_granted)
            .collect();
        Self {
            granted,
            denied: HashSet::new(),
        }
    }

    /// Baseline plus everything the manifest declares.
    pub fn from_declared(declared: &[Permission]) -> Self {
        let mut set = Self::baseline();
        for p in declared {
            set.granted.insert(*p);
        }
        set
    }

    /// Every permission (for testing).
    pub fn all_granted() -> Self {
        Self {
            granted: Permission::ALL.into_iter().collect(),
            denied: HashSet::new(),
        }
    }

    pub fn is_granted(&self, permission: Permission) -> bool {
        self.granted.contains(&permission) && !self.denied.contains(&permission)
    }

    pub fn is_denied(&self, permission: Permission) -> bool {
        self.denied.contains(&permission)
    }

    pub fn grant(&mut self, permission: Permission) {
        self.denied.remove(&permission);
        self.granted.insert(permission);
    }

    pub fn deny(&mut self, permission: Permission) {
        self.granted.remove(&permission);
        self.denied.insert(permission);
    }

    /// Returns all granted permissions.
    pub fn granted_permissions(&self) -> &HashSet<Permission> {
        &self.granted
    }
}
