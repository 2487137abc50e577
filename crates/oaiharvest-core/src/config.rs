//! Configuration file model.
//!
//! ```toml
//! [settings]
//! workdir = "workspace"
//! max_retry_count = 3
//! retry_delay = [10, 60]
//! max_jobs = 4
//!
//! [[action_sequences]]
//! format = { type = "prefix", value = "oai_dc" }
//! actions = [{ type = "strip" }, { type = "save", dir = "oai-dc", suffix = ".xml" }]
//!
//! [[providers]]
//! url = "http://example.org/oai"
//! sets = ["physics"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionSequence, SaveAction, SplitAction, StripAction};
use crate::cycle::ProgressStore;
use crate::error::AppError;
use crate::models::{MetadataFormat, Provider, ScenarioKind};
use crate::registry::ImportConfig;
use crate::retry::RetryPolicy;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvesterConfig {
    pub settings: Settings,
    pub action_sequences: Vec<ActionSequenceConfig>,
    pub providers: Vec<ProviderConfig>,
    pub import: Option<ImportConfig>,
}

/// Global defaults, overridable per provider where it makes sense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub workdir: PathBuf,
    pub max_retry_count: u32,
    /// Seconds to wait after the first, second, ... failed attempt.
    pub retry_delay: Vec<i64>,
    /// Providers harvested concurrently.
    pub max_jobs: usize,
    /// Instances per pipeline stage; defaults to `max_jobs`.
    pub resource_pool_size: Option<usize>,
    /// Request timeout in seconds, 0 for none.
    pub timeout: u64,
    pub overview_file: Option<PathBuf>,
    pub scenario: ScenarioKind,
    pub incremental: bool,
    pub dry_run: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("workspace"),
            max_retry_count: 1,
            retry_delay: vec![0],
            max_jobs: 1,
            resource_pool_size: None,
            timeout: 0,
            overview_file: None,
            scenario: ScenarioKind::ListRecords,
            incremental: true,
            dry_run: false,
        }
    }
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_seconds(self.max_retry_count, &self.retry_delay)
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs.max(1)
    }

    pub fn pool_size(&self) -> usize {
        self.resource_pool_size.unwrap_or(self.max_jobs).max(1)
    }

    pub fn overview_path(&self) -> PathBuf {
        self.overview_file
            .clone()
            .unwrap_or_else(|| self.workdir.join("overview.xml"))
    }

    /// Resolves `path` against the working directory unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }

    /// A provider with global defaults only.
    pub fn provider(&self, url: &str) -> Provider {
        Provider::new(url)
            .with_retry(self.retry_policy())
            .with_timeout(Duration::from_secs(self.timeout))
            .incremental(self.incremental)
    }
}

/// Per-provider settings; unset fields fall back to [`Settings`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOverrides {
    pub name: Option<String>,
    pub sets: Option<Vec<String>>,
    #[serde(rename = "static")]
    pub is_static: Option<bool>,
    pub scenario: Option<ScenarioKind>,
    pub timeout: Option<u64>,
    pub max_retry_count: Option<u32>,
    pub retry_delay: Option<Vec<i64>>,
    pub exclusive: Option<bool>,
    pub incremental: Option<bool>,
    pub group: Option<String>,
}

impl ProviderOverrides {
    pub fn apply(&self, mut provider: Provider, settings: &Settings) -> Provider {
        if let Some(name) = &self.name {
            provider = provider.with_name(name.clone());
        }
        if let Some(sets) = &self.sets {
            provider = provider.with_sets(sets.clone());
        }
        if self.max_retry_count.is_some() || self.retry_delay.is_some() {
            provider = provider.with_retry(RetryPolicy::from_seconds(
                self.max_retry_count.unwrap_or(settings.max_retry_count),
                self.retry_delay.as_deref().unwrap_or(&settings.retry_delay),
            ));
        }
        if let Some(timeout) = self.timeout {
            provider = provider.with_timeout(Duration::from_secs(timeout));
        }
        if let Some(incremental) = self.incremental {
            provider = provider.incremental(incremental);
        }
        if let Some(group) = &self.group {
            provider = provider.in_group(group.clone());
        }
        provider
            .with_scenario(self.scenario)
            .exclusive(self.exclusive.unwrap_or(false))
            .static_repository(self.is_static.unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub url: String,
    #[serde(flatten)]
    pub overrides: ProviderOverrides,
}

impl ProviderConfig {
    pub fn to_provider(&self, settings: &Settings) -> Provider {
        self.overrides.apply(settings.provider(&self.url), settings)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSequenceConfig {
    pub format: MetadataFormat,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

impl ActionSequenceConfig {
    pub fn build(&self, settings: &Settings) -> ActionSequence {
        let actions = self.actions.iter().map(|a| a.build(settings)).collect();
        ActionSequence::new(self.format.clone(), actions, settings.pool_size())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActionConfig {
    Strip,
    Split,
    Save {
        dir: PathBuf,
        #[serde(default = "default_suffix")]
        suffix: String,
        /// One subdirectory per provider.
        #[serde(default)]
        group: bool,
    },
}

fn default_suffix() -> String {
    ".xml".to_string()
}

impl ActionConfig {
    pub fn build(&self, settings: &Settings) -> Box<dyn Action> {
        match self {
            ActionConfig::Strip => Box::new(StripAction),
            ActionConfig::Split => Box::new(SplitAction),
            ActionConfig::Save { dir, suffix, group } => {
                Box::new(SaveAction::new(settings.resolve(dir), suffix.clone()).grouped(*group))
            }
        }
    }
}

impl HarvesterConfig {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, AppError> {
        let config: Self =
            toml::from_str(content).map_err(|e| AppError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if let Some(provider) = self.providers.iter().find(|p| p.url.trim().is_empty()) {
            return Err(AppError::ConfigError(format!(
                "provider {} has no URL",
                provider.overrides.name.as_deref().unwrap_or("<unnamed>")
            )));
        }
        Ok(())
    }

    /// Providers listed in the file, with defaults applied.
    pub fn providers(&self) -> Vec<Provider> {
        self.providers
            .iter()
            .map(|p| p.to_provider(&self.settings))
            .collect()
    }

    pub fn action_sequences(&self) -> Vec<ActionSequence> {
        self.action_sequences
            .iter()
            .map(|s| s.build(&self.settings))
            .collect()
    }

    pub fn overview_path(&self) -> PathBuf {
        self.settings.overview_path()
    }

    /// Opens the progress store at `overview`, or the configured overview
    /// file. Endpoints seen for the first time get the configured scenario.
    pub fn progress_store(&self, overview: Option<&Path>) -> Result<ProgressStore, AppError> {
        let path = overview
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.overview_path());
        Ok(ProgressStore::open(path)?.with_default_scenario(self.settings.scenario))
    }

    pub fn pool_size(&self) -> usize {
        self.settings.pool_size()
    }
}
