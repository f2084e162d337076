//! npm-compatible package metadata.

use crate::config::DependencySettings;
use crate::error::{HostError, HostResult};
use enclave_types::Fetcher;
use semver::{Version, VersionReq};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Packument {
    #[serde(default)]
    versions: HashMap<String, VersionDocument>,
    #[serde(rename = "dist-tags", default)]
    dist_tags: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct VersionDocument {
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
}

/// Published versions of one package and their runtime dependencies.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageMetadata {
    pub name: String,
    versions: BTreeMap<Version, BTreeMap<String, String>>,
    latest: Option<Version>,
}

impl PackageMetadata {
    fn from_packument(name: &str, doc: Packument) -> Self {
        let versions = doc
            .versions
            .into_iter()
            .filter_map(|(v, meta)| Version::parse(&v).ok().map(|v| (v, meta.dependencies)))
            .collect();
        let latest = doc.dist_tags.get("latest").and_then(|v| Version::parse(v).ok());
        Self {
            name: name.to_string(),
            versions,
            latest,
        }
    }

    pub fn versions(&self) -> impl Iterator<Item = &Version> {
        self.versions.keys()
    }

    /// The `latest` dist-tag, else the highest stable version.
    pub fn latest(&self) -> Option<&Version> {
        self.latest.as_ref().or_else(|| {
            self.versions
                .keys()
                .rev()
                .find(|v| v.pre.is_empty())
        })
    }

    /// Highest published version matching an npm `range`.
    ///
    /// Understands `||` alternatives, hyphen ranges (`1.2 - 2`), x-ranges
    /// (`1.x`, `1.2.*`), whitespace or comma separated comparator sets and the
    /// `^`/`~` operators. A bare version is exact, and a bare partial one such
    /// as `1.2` means `1.2.x`. `latest` and `*` pick [`Self::latest`].
    pub fn max_satisfying(&self, range: &str) -> HostResult<Version> {
        let range = range.trim();
        let no_match = || HostError::NoMatchingVersion {
            name: self.name.clone(),
            range: range.to_string(),
        };

        if range.is_empty() || range == "latest" || range == "*" {
            return self.latest().cloned().ok_or_else(no_match);
        }
        let reqs = range
            .split("||")
            .map(|alt| VersionReq::parse(&npm_comparators(alt)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| no_match())?;
        self.versions
            .keys()
            .rev()
            .find(|v| reqs.iter().any(|req| req.matches(v)))
            .cloned()
            .ok_or_else(no_match)
    }

    /// Runtime dependencies declared by `version`.
    pub fn dependencies(&self, version: &Version) -> BTreeMap<String, String> {
        self.versions.get(version).cloned().unwrap_or_default()
    }
}

/// Rewrites one npm comparator set in the comma separated form
/// [`VersionReq`] parses.
fn npm_comparators(set: &str) -> String {
    let set = set.trim();
    if set.is_empty() || set == "*" {
        return "*".to_string();
    }
    if let Some((low, high)) = set.split_once(" - ") {
        return format!(">={}, <={}", bare(low.trim()), bare(high.trim()));
    }

    let mut out: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in set.split(|c: char| c.is_whitespace() || c == ',') {
        if token.is_empty() {
            continue;
        }
        let split = token
            .find(|c: char| !matches!(c, '<' | '>' | '=' | '^' | '~'))
            .unwrap_or(token.len());
        let (op, version) = token.split_at(split);
        if version.is_empty() {
            pending_op = Some(op);
            continue;
        }
        let op = match pending_op.take() {
            Some(pending) if op.is_empty() => pending,
            _ => op,
        };
        let version = bare(version);
        let wildcard = version
            .split('.')
            .any(|part| matches!(part, "x" | "X" | "*"));
        if op.is_empty() && !wildcard {
            out.push(format!("={version}"));
        } else {
            out.push(format!("{op}{version}"));
        }
    }
    out.join(", ")
}

fn bare(version: &str) -> &str {
    version.strip_prefix('v').unwrap_or(version)
}

/// Metadata lookups against the configured registry, cached per package.
pub struct Registry {
    fetcher: Arc<dyn Fetcher>,
    registry_url: String,
    cdn_url: String,
    cache: RwLock<HashMap<String, Arc<PackageMetadata>>>,
}

impl Registry {
    pub fn new(fetcher: Arc<dyn Fetcher>, settings: &DependencySettings) -> Self {
        Self {
            fetcher,
            registry_url: settings.registry_url.trim_end_matches('/').to_string(),
            cdn_url: settings.cdn_url.trim_end_matches('/').to_string(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn metadata_url(&self, name: &str) -> String {
        format!("{}/{}", self.registry_url, name.replace('/', "%2F"))
    }

    /// Where the CDN serves the package's default file.
    pub fn file_url(&self, name: &str, version: &Version) -> String {
        format!("{}/{}@{}", self.cdn_url, name, version)
    }

    pub async fn metadata(&self, name: &str) -> HostResult<Arc<PackageMetadata>> {
        if let Some(hit) = self.cache.read().unwrap().get(name) {
            return Ok(hit.clone());
        }
        self.refresh(name).await
    }

    /// Fetches metadata, bypassing and then replacing the cached copy.
    pub async fn refresh(&self, name: &str) -> HostResult<Arc<PackageMetadata>> {
        let url = self.metadata_url(name);
        debug!(package = name, %url, "fetching package metadata");
        let doc: Packument = self.fetcher.get(&url).await?.json()?;
        let meta = Arc::new(PackageMetadata::from_packument(name, doc));
        self.cache
            .write()
            .unwrap()
            .insert(name.to_string(), meta.clone());
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enclave_types::StaticFetcher;
    use serde_json::json;

    fn lodash() -> PackageMetadata {
        let doc: Packument = serde_json::from_value(json!({
            "name": "lodash",
            "dist-tags": {"latest": "4.17.21"},
            "versions": {
                "3.10.1": {},
                "4.17.20": {},
                "4.17.21": {"dependencies": {"tiny": "^1.0.0"}},
                "5.0.0-beta.1": {},
                "not-a-version": {}
            }
        }))
        .unwrap();
        PackageMetadata::from_packument("lodash", doc)
    }

    #[test]
    fn max_satisfying_picks_highest_match() {
        let meta = lodash();
        assert_eq!(meta.max_satisfying("^4.17.0").unwrap().to_string(), "4.17.21");
        assert_eq!(meta.max_satisfying("~3.10").unwrap().to_string(), "3.10.1");
        assert_eq!(meta.max_satisfying(">=3, <4.17.21").unwrap().to_string(), "4.17.20");
        assert_eq!(meta.max_satisfying("4.x").unwrap().to_string(), "4.17.21");
        assert_eq!(meta.max_satisfying("latest").unwrap().to_string(), "4.17.21");
    }

    #[test]
    fn bare_version_is_exact() {
        let meta = lodash();
        assert_eq!(meta.max_satisfying("4.17.20").unwrap().to_string(), "4.17.20");
        assert!(matches!(
            meta.max_satisfying("4.17.19"),
            Err(HostError::NoMatchingVersion { .. })
        ));
    }

    #[test]
    fn bare_partial_version_is_an_x_range() {
        let meta = lodash();
        assert_eq!(meta.max_satisfying("4.17").unwrap().to_string(), "4.17.21");
        assert_eq!(meta.max_satisfying("3").unwrap().to_string(), "3.10.1");
        assert_eq!(meta.max_satisfying("v4.17.20").unwrap().to_string(), "4.17.20");
    }

    #[test]
    fn npm_range_syntax() {
        let meta = lodash();
        assert_eq!(meta.max_satisfying("^3.0.0 || ^6").unwrap().to_string(), "3.10.1");
        assert_eq!(meta.max_satisfying("3.x || 4.17.20").unwrap().to_string(), "4.17.20");
        assert_eq!(meta.max_satisfying("3 - 4.17.20").unwrap().to_string(), "4.17.20");
        assert_eq!(meta.max_satisfying("3.0 - 4.16").unwrap().to_string(), "3.10.1");
        assert_eq!(meta.max_satisfying(">= 3 < 4").unwrap().to_string(), "3.10.1");
        assert_eq!(meta.max_satisfying(">=4.0.0 <4.17.21").unwrap().to_string(), "4.17.20");
        assert_eq!(meta.max_satisfying("3.X").unwrap().to_string(), "3.10.1");
        assert!(matches!(
            meta.max_satisfying("^6 || 2.x"),
            Err(HostError::NoMatchingVersion { .. })
        ));
    }

    #[test]
    fn comparator_sets_rewrite_to_comma_form() {
        assert_eq!(npm_comparators("1.2"), "=1.2");
        assert_eq!(npm_comparators(">= 1.2.3 < 2"), ">=1.2.3, <2");
        assert_eq!(npm_comparators("1.2.3 - 2.3"), ">=1.2.3, <=2.3");
        assert_eq!(npm_comparators("~v1.2"), "~1.2");
        assert_eq!(npm_comparators("1.x"), "1.x");
        assert_eq!(npm_comparators(" "), "*");
    }

    #[test]
    fn unsatisfiable_range_fails() {
        let meta = lodash();
        assert!(matches!(
            meta.max_satisfying("^6"),
            Err(HostError::NoMatchingVersion { name, range }) if name == "lodash" && range == "^6"
        ));
        assert_eq!(meta.versions().count(), 4);
    }

    #[test]
    fn dependencies_of_version() {
        let meta = lodash();
        let v = Version::parse("4.17.21").unwrap();
        assert_eq!(meta.dependencies(&v).get("tiny").map(String::as_str), Some("^1.0.0"));
        assert!(meta.dependencies(&Version::parse("3.10.1").unwrap()).is_empty());
    }

    #[tokio::test]
    async fn metadata_is_cached_until_refreshed() {
        let fetcher = Arc::new(StaticFetcher::new());
        let settings = DependencySettings {
            registry_url: "https://registry.test/".into(),
            ..Default::default()
        };
        let registry = Registry::new(fetcher.clone(), &settings);
        let url = registry.metadata_url("@acme/ui");
        assert_eq!(url, "https://registry.test/@acme%2Fui");
        fetcher.route_json(&url, &json!({"versions": {"1.0.0": {}}}));

        registry.metadata("@acme/ui").await.unwrap();
        registry.metadata("@acme/ui").await.unwrap();
        assert_eq!(fetcher.hits(&url), 1);

        fetcher.route_json(&url, &json!({"versions": {"1.0.0": {}, "1.1.0": {}}}));
        let fresh = registry.refresh("@acme/ui").await.unwrap();
        assert_eq!(fresh.latest().unwrap().to_string(), "1.1.0");
        assert_eq!(fetcher.hits(&url), 2);
    }
}
