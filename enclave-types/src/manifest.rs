//! Plugin manifest (camelCase JSON) describing a plugin bundle.

use crate::{Error, Permission, PluginId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level plugin manifest.
///
/// Required fields deserialize to empty values when absent so that
/// [`PluginManifest::validate`] can report which one is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique plugin identifier (e.g., "acme.charts").
    #[serde(default)]
    pub id: String,
    /// Human-readable plugin name.
    #[serde(default)]
    pub name: String,
    /// Semver version string.
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub entry: EntryPoints,
    /// Capabilities requested by this plugin.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Permission>,
    /// Other plugins this one requires, by id, pinned to an exact version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    /// Third-party libraries loaded into the sandbox before the entry code.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub libraries: BTreeMap<String, LibraryDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceDeclaration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiDeclaration>,
}

/// Code entry points, all given as URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoints {
    #[serde(default)]
    pub main: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub styles: Option<String>,
}

/// Distribution format of a library dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryKind {
    /// Resolved through the package registry; `version` may be a range.
    Npm,
    /// Fetched from an explicit URL as a classic script.
    Umd,
    /// Fetched from an explicit URL as a module script.
    Esm,
}

/// One entry of the manifest's `libraries` map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryDependency {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: LibraryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

/// Resource limits a plugin asks for. Missing values fall back to host defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    #[serde(rename = "maxMemory", default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<u64>,
    #[serde(rename = "maxCPU", default, skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<f64>,
    #[serde(rename = "maxNetworkRequests", default, skip_serializing_if = "Option::is_none")]
    pub max_network_requests: Option<u64>,
    #[serde(rename = "maxDOMNodes", default, skip_serializing_if = "Option::is_none")]
    pub max_dom_nodes: Option<u64>,
}

/// Names of the API surface a plugin exports and consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDeclaration {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
}

impl PluginManifest {
    /// Parses a manifest from JSON. Does not validate.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validates the manifest for required fields and constraints.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidManifest("id is required".into()));
        }
        if self.name.is_empty() {
            return Err(Error::InvalidManifest("name is required".into()));
        }
        if self.version.is_empty() {
            return Err(Error::InvalidManifest("version is required".into()));
        }
        if self.entry.main.is_empty() {
            return Err(Error::InvalidManifest("entry.main is required".into()));
        }
        PluginId::parse(&self.id)?;
        self.semver()?;

        for (name, lib) in &self.libraries {
            if lib.version.is_empty() {
                return Err(Error::InvalidManifest(format!(
                    "library '{name}' has no version"
                )));
            }
            if lib.kind != LibraryKind::Npm && lib.url.is_none() {
                return Err(Error::InvalidManifest(format!(
                    "library '{name}' needs a url"
                )));
            }
        }
        Ok(())
    }

    /// Validated plugin id.
    pub fn plugin_id(&self) -> Result<PluginId> {
        PluginId::parse(&self.id)
    }

    /// Parsed semantic version.
    pub fn semver(&self) -> Result<semver::Version> {
        semver::Version::parse(&self.version).map_err(|source| Error::InvalidVersion {
            version: self.version.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> PluginManifest {
        PluginManifest {
            id: "acme.charts".into(),
            name: "Charts".into(),
            version: "1.2.0".into(),
            description: None,
            entry: EntryPoints {
                main: "https://plugins.test/charts/main.js".into(),
                worker: None,
                styles: None,
            },
            permissions: vec![Permission::Ui],
            dependencies: BTreeMap::new(),
            libraries: BTreeMap::new(),
            resources: None,
            api: None,
        }
    }

    #[test]
    fn validate_valid_manifest() {
        assert!(manifest().validate().is_ok());
    }

    #[test]
    fn validate_missing_fields() {
        let m = PluginManifest { id: String::new(), ..manifest() };
        assert!(m.validate().unwrap_err().to_string().contains("id is required"));

        let m = PluginManifest { name: String::new(), ..manifest() };
        assert!(m.validate().unwrap_err().to_string().contains("name is required"));

        let m = PluginManifest { version: String::new(), ..manifest() };
        assert!(m.validate().unwrap_err().to_string().contains("version is required"));

        let mut m = manifest();
        m.entry.main.clear();
        assert!(m.validate().unwrap_err().to_string().contains("entry.main"));
    }

    #[test]
    fn validate_rejects_non_semver() {
        let m = PluginManifest { version: "one".into(), ..manifest() };
        assert!(matches!(m.validate(), Err(Error::InvalidVersion { .. })));
    }

    #[test]
    fn validate_rejects_umd_without_url() {
        let mut m = manifest();
        m.libraries.insert(
            "lodash".into(),
            LibraryDependency {
                version: "4.17.21".into(),
                kind: LibraryKind::Umd,
                url: None,
                integrity: None,
            },
        );
        assert!(m.validate().is_err());
    }

    #[test]
    fn parses_camel_case_json() {
        let json = r#"{
            "id": "acme.charts",
            "name": "Charts",
            "version": "1.0.0",
            "entry": {
                "main": "https://plugins.test/main.js",
                "styles": "https://plugins.test/s.css"
            },
            "permissions": ["ui", "storage"],
            "dependencies": { "acme.core": "2.0.0" },
            "libraries": { "lodash": { "version": "^4.17.0", "type": "npm" } },
            "resources": {
                "maxMemory": 64, "maxCPU": 25.0, "maxNetworkRequests": 10, "maxDOMNodes": 500
            },
            "api": { "exports": ["render"] }
        }"#;
        let m = PluginManifest::from_json(json).unwrap();
        m.validate().unwrap();
        assert_eq!(m.entry.styles.as_deref(), Some("https://plugins.test/s.css"));
        assert_eq!(m.permissions, vec![Permission::Ui, Permission::Storage]);
        assert_eq!(m.dependencies["acme.core"], "2.0.0");
        assert_eq!(m.libraries["lodash"].kind, LibraryKind::Npm);
        let res = m.resources.unwrap();
        assert_eq!(res.max_memory, Some(64));
        assert_eq!(res.max_dom_nodes, Some(500));
        assert_eq!(m.api.unwrap().exports, vec!["render".to_string()]);
    }

    #[test]
    fn missing_required_fields_reach_validation() {
        let m = PluginManifest::from_json(r#"{"name": "x"}"#).unwrap();
        assert!(m.validate().unwrap_err().to_string().contains("id is required"));
    }

    #[test]
    fn unknown_permission_fails_parse() {
        let json = r#"{"id":"a.b","name":"x","version":"1.0.0",
            "entry":{"main":"m.js"},"permissions":["camera"]}"#;
        assert!(PluginManifest::from_json(json).is_err());
    }
}
