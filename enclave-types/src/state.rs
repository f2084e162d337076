//! Plugin lifecycle state and the persisted plugin record.

use crate::{PluginManifest, SandboxOptions, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an installed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Installing,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Installing => "installing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Current status plus the error that caused it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginState {
    pub status: PluginStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: Timestamp,
}

impl PluginState {
    pub fn new(status: PluginStatus) -> Self {
        Self {
            status,
            error: None,
            timestamp: Timestamp::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: PluginStatus::Error,
            error: Some(error.into()),
            timestamp: Timestamp::now(),
        }
    }
}

/// Everything the host knows about an installed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub manifest: PluginManifest,
    pub state: PluginState,
    pub sandbox_options: SandboxOptions,
}

impl PluginInfo {
    pub fn new(manifest: PluginManifest, sandbox_options: SandboxOptions) -> Self {
        Self {
            manifest,
            state: PluginState::new(PluginStatus::Installing),
            sandbox_options,
        }
    }

    pub fn status(&self) -> PluginStatus {
        self.state.status
    }

    /// Replaces the state with `status` and clears any previous error.
    pub fn transition(&mut self, status: PluginStatus) {
        self.state = PluginState::new(status);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = PluginState::failed(error);
    }
}
