//! Provider import from a registry catalog.
//!
//! The catalog is a JSON list of endpoints with the OAI sets each one
//! exposes:
//!
//! ```json
//! [{ "url": "http://example.org/oai", "sets": [{ "set_spec": "a", "set_type": "collection" }] }]
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ProviderConfig, Settings};
use crate::error::AppError;
use crate::models::Provider;
use crate::oai::normalize_base_url;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetDefinition {
    pub set_spec: String,
    #[serde(default)]
    pub set_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub url: String,
    #[serde(default)]
    pub sets: Vec<SetDefinition>,
}

/// Endpoint URL to its set definitions, ordered by URL.
pub type EndpointSets = BTreeMap<String, Vec<SetDefinition>>;

/// Parses a catalog document; an endpoint listed twice gets the union of its sets.
pub fn parse_catalog(json: &[u8]) -> Result<EndpointSets, AppError> {
    let entries: Vec<RegistryEntry> = serde_json::from_slice(json)?;
    let mut map = EndpointSets::new();
    for entry in entries {
        let url = entry.url.trim();
        if url.is_empty() {
            tracing::warn!("Skipping registry entry without URL");
            continue;
        }
        let sets = map.entry(url.to_string()).or_default();
        for set in entry.sets {
            if !sets.contains(&set) {
                sets.push(set);
            }
        }
    }
    Ok(map)
}

/// `[import]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub registry: String,
    /// Endpoint URLs never imported.
    pub exclude: Vec<String>,
    /// Set types to keep; `*` keeps all.
    pub include_set_types: Vec<String>,
    pub exclude_set_types: Vec<String>,
    /// Per-endpoint overrides, matched by URL.
    pub config: Vec<ProviderConfig>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            registry: String::new(),
            exclude: Vec::new(),
            include_set_types: vec!["*".to_string()],
            exclude_set_types: Vec::new(),
            config: Vec::new(),
        }
    }
}

impl ImportConfig {
    fn includes(&self, set: &SetDefinition) -> bool {
        let included = self.include_set_types.iter().any(|t| t == "*" || *t == set.set_type);
        included && !self.exclude_set_types.contains(&set.set_type)
    }

    fn is_excluded(&self, url: &str) -> bool {
        let url = normalize_base_url(url);
        self.exclude.iter().any(|e| normalize_base_url(e) == url)
    }

    /// Builds providers for every catalog endpoint that is not excluded.
    ///
    /// Sets are filtered by type. When the filter leaves nothing, the
    /// endpoint is harvested without set restriction.
    pub fn providers(&self, endpoints: &EndpointSets, settings: &Settings) -> Vec<Provider> {
        let mut providers = Vec::new();
        for (url, sets) in endpoints {
            if self.is_excluded(url) {
                tracing::debug!(url = %url, "Excluding endpoint");
                continue;
            }

            let override_for = self
                .config
                .iter()
                .find(|c| normalize_base_url(&c.url) == normalize_base_url(url));
            let mut provider = match override_for {
                Some(config) => config.overrides.apply(settings.provider(url), settings),
                None => settings.provider(url),
            };

            let selected: Vec<String> = sets
                .iter()
                .filter(|s| self.includes(s))
                .map(|s| s.set_spec.clone())
                .collect();
            tracing::debug!(
                url = %url,
                before = sets.len(),
                after = selected.len(),
                "Filtered registry sets"
            );
            if !selected.is_empty() {
                provider = provider.with_sets(selected);
            }
            providers.push(provider);
        }
        providers
    }
}
