//! Harvest cycle: which endpoints to harvest this run, from which date,
//! and the persisted progress of every endpoint.
//!
//! Progress lives in an XML overview file:
//!
//! ```xml
//! <overview mode="normal" date="1970-01-01" scenario="ListRecords">
//!   <endpoint uri="http://example.org/oai" group="" block="false" retry="false"
//!             incremental="true" scenario="ListRecords"
//!             attempted="2024-01-01T10:00:00Z" harvested="2024-01-01T10:00:00Z"
//!             count="120" increment="20"/>
//! </overview>
//! ```
//!
//! Every mutation is written through to disk before it returns.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};

use crate::error::AppError;
use crate::models::ScenarioKind;
use crate::xml::Element;

/// Which endpoints a cycle harvests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HarvestMode {
    /// Every endpoint that is not blocked.
    #[default]
    Normal,
    /// Only endpoints whose last attempt failed.
    Retry,
    /// Like normal, with the cycle date as a floor for `from`.
    Refresh,
}

impl HarvestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestMode::Normal => "normal",
            HarvestMode::Retry => "retry",
            HarvestMode::Refresh => "refresh",
        }
    }
}

impl fmt::Display for HarvestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HarvestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(HarvestMode::Normal),
            "retry" => Ok(HarvestMode::Retry),
            "refresh" => Ok(HarvestMode::Refresh),
            _ => Err(format!("Unknown harvest mode: {}", s)),
        }
    }
}

/// Cycle-wide settings stored on the overview root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleProperties {
    pub mode: HarvestMode,
    /// Floor for `from` in refresh mode.
    pub date: NaiveDate,
    /// Scenario given to newly seen endpoints.
    pub scenario: ScenarioKind,
}

impl Default for CycleProperties {
    fn default() -> Self {
        Self {
            mode: HarvestMode::Normal,
            date: NaiveDate::default(),
            scenario: ScenarioKind::ListRecords,
        }
    }
}

/// Persisted progress of one endpoint, keyed by URI and group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointProgress {
    pub uri: String,
    pub group: String,
    /// Manual override; never set by the harvester.
    pub blocked: bool,
    /// Last attempt failed.
    pub retry: bool,
    pub incremental: bool,
    pub scenario: ScenarioKind,
    pub attempted: Option<DateTime<Utc>>,
    /// Last successful completion.
    pub harvested: Option<DateTime<Utc>>,
    pub count: u64,
    pub increment: u64,
}

impl EndpointProgress {
    pub fn new(uri: impl Into<String>, group: impl Into<String>, scenario: ScenarioKind) -> Self {
        Self {
            uri: uri.into(),
            group: group.into(),
            blocked: false,
            retry: false,
            incremental: true,
            scenario,
            attempted: None,
            harvested: None,
            count: 0,
            increment: 0,
        }
    }

    fn is(&self, uri: &str, group: &str) -> bool {
        self.uri == uri && self.group == group
    }

    fn from_element(e: &Element, default_scenario: ScenarioKind) -> Self {
        Self {
            uri: e.attr("uri").unwrap_or_default().to_string(),
            group: e.attr("group").unwrap_or_default().to_string(),
            blocked: parse_attr(e, "block").unwrap_or(false),
            retry: parse_attr(e, "retry").unwrap_or(false),
            incremental: parse_attr(e, "incremental").unwrap_or(true),
            scenario: parse_attr(e, "scenario").unwrap_or(default_scenario),
            attempted: e.attr("attempted").and_then(parse_timestamp),
            harvested: e.attr("harvested").and_then(parse_timestamp),
            count: parse_attr(e, "count").unwrap_or(0),
            increment: parse_attr(e, "increment").unwrap_or(0),
        }
    }

    fn to_element(&self) -> Element {
        let mut e = Element::new("endpoint")
            .with_attr("uri", &self.uri)
            .with_attr("group", &self.group)
            .with_attr("block", self.blocked.to_string())
            .with_attr("retry", self.retry.to_string())
            .with_attr("incremental", self.incremental.to_string())
            .with_attr("scenario", self.scenario.as_str());
        if let Some(attempted) = self.attempted {
            e.set_attr("attempted", format_timestamp(attempted));
        }
        if let Some(harvested) = self.harvested {
            e.set_attr("harvested", format_timestamp(harvested));
        }
        e.with_attr("count", self.count.to_string())
            .with_attr("increment", self.increment.to_string())
    }
}

#[derive(Debug, Clone, Default)]
struct Overview {
    properties: CycleProperties,
    endpoints: Vec<EndpointProgress>,
}

impl Overview {
    fn parse(bytes: &[u8]) -> Result<Self, AppError> {
        let root = Element::parse(bytes)
            .map_err(|e| AppError::PersistenceError(format!("corrupt overview: {e}")))?;
        if root.local_name() != "overview" {
            return Err(AppError::PersistenceError(format!(
                "expected <overview>, found <{}>",
                root.name()
            )));
        }
        let defaults = CycleProperties::default();
        let properties = CycleProperties {
            mode: parse_attr(&root, "mode").unwrap_or(defaults.mode),
            date: parse_attr(&root, "date").unwrap_or(defaults.date),
            scenario: parse_attr(&root, "scenario").unwrap_or(defaults.scenario),
        };
        let endpoints = root
            .children_named("endpoint")
            .map(|e| EndpointProgress::from_element(e, properties.scenario))
            .filter(|e| !e.uri.is_empty())
            .collect();
        Ok(Self {
            properties,
            endpoints,
        })
    }

    fn to_document(&self) -> Result<Vec<u8>, AppError> {
        let mut root = Element::new("overview")
            .with_attr("mode", self.properties.mode.as_str())
            .with_attr("date", self.properties.date.format("%Y-%m-%d").to_string())
            .with_attr("scenario", self.properties.scenario.as_str());
        for endpoint in &self.endpoints {
            root.push_child(endpoint.to_element());
        }
        root.to_document(true)
    }

    fn find_mut(&mut self, uri: &str, group: &str) -> Option<&mut EndpointProgress> {
        self.endpoints.iter_mut().find(|e| e.is(uri, group))
    }
}

/// Endpoint progress records backed by the overview file.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    overview: Mutex<Overview>,
}

impl ProgressStore {
    /// Loads the overview, or starts an empty one if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        let overview = if path.exists() {
            let bytes = fs::read(&path).map_err(|e| {
                AppError::PersistenceError(format!("cannot read {}: {e}", path.display()))
            })?;
            Overview::parse(&bytes)?
        } else {
            tracing::info!(path = %path.display(), "Starting a new harvest overview");
            Overview::default()
        };
        Ok(Self {
            path,
            overview: Mutex::new(overview),
        })
    }

    /// Creates a store with the given cycle properties and no endpoints.
    pub fn create(path: impl Into<PathBuf>, properties: CycleProperties) -> Result<Self, AppError> {
        let store = Self {
            path: path.into(),
            overview: Mutex::new(Overview {
                properties,
                endpoints: Vec::new(),
            }),
        };
        store.persist(&store.lock())?;
        Ok(store)
    }

    /// Sets the scenario given to endpoints seen for the first time.
    ///
    /// Endpoints already in the overview keep their own scenario. The new
    /// default is written with the next update.
    pub fn with_default_scenario(self, scenario: ScenarioKind) -> Self {
        self.lock().properties.scenario = scenario;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn properties(&self) -> CycleProperties {
        self.lock().properties.clone()
    }

    pub fn endpoints(&self) -> Vec<EndpointProgress> {
        self.lock().endpoints.clone()
    }

    /// Progress of an endpoint, created with defaults and persisted on first sight.
    pub fn next(&self, uri: &str, group: &str) -> Result<EndpointProgress, AppError> {
        let mut overview = self.lock();
        if let Some(existing) = overview.endpoints.iter().find(|e| e.is(uri, group)) {
            return Ok(existing.clone());
        }
        let created = EndpointProgress::new(uri, group, overview.properties.scenario);
        overview.endpoints.push(created.clone());
        self.persist(&overview)?;
        tracing::debug!(uri = %uri, group = %group, "Added endpoint to overview");
        Ok(created)
    }

    /// Like [`ProgressStore::next`] but never writes.
    pub fn peek(&self, uri: &str, group: &str) -> EndpointProgress {
        let overview = self.lock();
        overview
            .endpoints
            .iter()
            .find(|e| e.is(uri, group))
            .cloned()
            .unwrap_or_else(|| EndpointProgress::new(uri, group, overview.properties.scenario))
    }

    pub fn should_harvest(&self, progress: &EndpointProgress) -> bool {
        match self.lock().properties.mode {
            HarvestMode::Normal | HarvestMode::Refresh => !progress.blocked,
            HarvestMode::Retry => progress.attempted != progress.harvested,
        }
    }

    /// `from` for the next request, or `None` for a full harvest.
    pub fn request_from_date(&self, progress: &EndpointProgress) -> Option<NaiveDate> {
        if !progress.incremental {
            return None;
        }
        let properties = self.properties();
        let harvested = progress.harvested.map(|h| h.date_naive());
        let floor = (properties.mode == HarvestMode::Refresh).then_some(properties.date);
        harvested.max(floor)
    }

    /// Stamps the attempt, and the harvest on success.
    pub fn record_outcome(
        &self,
        uri: &str,
        group: &str,
        success: bool,
    ) -> Result<EndpointProgress, AppError> {
        let now = Utc::now().trunc_subsecs(0);
        self.update(uri, group, |e| {
            e.attempted = Some(now);
            if success {
                e.harvested = Some(now);
            }
            e.retry = !success;
        })
    }

    /// Sets the cumulative record count.
    pub fn set_count(&self, uri: &str, group: &str, count: u64) -> Result<EndpointProgress, AppError> {
        self.update(uri, group, |e| e.count = count)
    }

    /// Sets the number of records of the most recent run.
    pub fn set_increment(
        &self,
        uri: &str,
        group: &str,
        increment: u64,
    ) -> Result<EndpointProgress, AppError> {
        self.update(uri, group, |e| e.increment = increment)
    }

    fn update(
        &self,
        uri: &str,
        group: &str,
        change: impl FnOnce(&mut EndpointProgress),
    ) -> Result<EndpointProgress, AppError> {
        let mut overview = self.lock();
        let default_scenario = overview.properties.scenario;
        if overview.find_mut(uri, group).is_none() {
            overview
                .endpoints
                .push(EndpointProgress::new(uri, group, default_scenario));
        }
        let updated = match overview.find_mut(uri, group) {
            Some(endpoint) => {
                change(endpoint);
                endpoint.clone()
            }
            None => {
                return Err(AppError::PersistenceError(format!(
                    "endpoint {uri} missing from overview"
                )));
            }
        };
        self.persist(&overview)?;
        Ok(updated)
    }

    fn persist(&self, overview: &Overview) -> Result<(), AppError> {
        let bytes = overview.to_document()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn io_error(&self, e: std::io::Error) -> AppError {
        AppError::PersistenceError(format!("{}: {e}", self.path.display()))
    }

    fn lock(&self) -> MutexGuard<'_, Overview> {
        self.overview.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(path = %self.path.display(), "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }
}

fn parse_attr<T: FromStr>(e: &Element, name: &str) -> Option<T> {
    e.attr(name).and_then(|v| v.trim().parse().ok())
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|t| t.and_utc())
        })
}

fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
