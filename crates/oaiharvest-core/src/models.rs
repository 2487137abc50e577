use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::harvesting::fetch_repository;
use crate::oai::{OaiRequest, OaiResponse, Verb, normalize_base_url};
use crate::retry::RetryPolicy;
use crate::traits::OaiEndpoint;
use crate::xml::Element;

/// How records are obtained from a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioKind {
    /// Only resolve matching metadata prefixes.
    ListPrefixes,
    /// List identifiers, then fetch each record with GetRecord.
    ListIdentifiers,
    #[default]
    ListRecords,
}

impl ScenarioKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::ListPrefixes => "ListPrefixes",
            ScenarioKind::ListIdentifiers => "ListIdentifiers",
            ScenarioKind::ListRecords => "ListRecords",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScenarioKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "listprefixes" => Ok(ScenarioKind::ListPrefixes),
            "listidentifiers" => Ok(ScenarioKind::ListIdentifiers),
            "listrecords" => Ok(ScenarioKind::ListRecords),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

/// What a metadata-format selector compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Prefix,
    Schema,
    Namespace,
}

/// Input format selector of an action sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFormat {
    #[serde(rename = "type")]
    pub kind: FormatKind,
    pub value: String,
}

impl MetadataFormat {
    pub fn prefix(value: impl Into<String>) -> Self {
        Self {
            kind: FormatKind::Prefix,
            value: value.into(),
        }
    }

    pub fn schema(value: impl Into<String>) -> Self {
        Self {
            kind: FormatKind::Schema,
            value: value.into(),
        }
    }

    pub fn namespace(value: impl Into<String>) -> Self {
        Self {
            kind: FormatKind::Namespace,
            value: value.into(),
        }
    }

    /// Tests a `<metadataFormat>` element from a ListMetadataFormats response.
    pub fn matches(&self, format: &Element) -> bool {
        let field = match self.kind {
            FormatKind::Prefix => "metadataPrefix",
            FormatKind::Schema => "schema",
            FormatKind::Namespace => "metadataNamespace",
        };
        format
            .child_text(field)
            .is_some_and(|value| value == self.value.trim())
    }
}

impl fmt::Display for MetadataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FormatKind::Prefix => "prefix",
            FormatKind::Schema => "schema",
            FormatKind::Namespace => "namespace",
        };
        write!(f, "{}={}", kind, self.value)
    }
}

/// An OAI-PMH endpoint to harvest.
#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    /// Endpoint URL without query string; the provider's identity.
    pub base_url: String,
    name: Option<String>,
    /// Sets to restrict harvesting to; empty means the whole repository.
    pub sets: Vec<String>,
    pub retry: RetryPolicy,
    /// Zero means no timeout.
    pub timeout: Duration,
    pub exclusive: bool,
    pub incremental: bool,
    /// Overrides the scenario stored in the progress record.
    pub scenario: Option<ScenarioKind>,
    pub group: String,
    /// Whole repository is served as one document.
    pub is_static: bool,
    /// Static repository document fetched while resolving the name.
    repository: Option<OaiResponse>,
}

impl Provider {
    pub fn new(url: &str) -> Self {
        Self {
            base_url: normalize_base_url(url),
            name: None,
            sets: Vec::new(),
            retry: RetryPolicy::default(),
            timeout: Duration::ZERO,
            exclusive: false,
            incremental: true,
            scenario: None,
            group: String::new(),
            is_static: false,
            repository: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_sets(mut self, sets: Vec<String>) -> Self {
        self.sets = sets;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_scenario(mut self, scenario: Option<ScenarioKind>) -> Self {
        self.scenario = scenario;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn static_repository(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    /// Display name; the base URL until [`Provider::init`] has resolved one.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.base_url)
    }

    pub fn has_name(&self) -> bool {
        self.name.is_some()
    }

    /// Static repository document, if [`Provider::init`] fetched it.
    pub fn repository(&self) -> Option<&OaiResponse> {
        self.repository.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }

    /// A request for `verb` against this provider, carrying its timeout.
    pub fn request(&self, verb: Verb) -> OaiRequest {
        OaiRequest::new(self.base_url.clone(), verb).with_timeout(self.timeout())
    }

    /// Resolves the display name once: configured name, then the
    /// repository's own `repositoryName`, then the URL host.
    ///
    /// Static providers read the name from their repository document, which
    /// is kept for the scenario instead of being fetched again.
    pub async fn init<E: OaiEndpoint>(&mut self, endpoint: &E) {
        if self.name.is_some() {
            return;
        }

        let name = if self.is_static {
            match fetch_repository(self, endpoint).await {
                Ok(repository) => {
                    let name = repository.repository_name();
                    self.repository = Some(repository);
                    name
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %self.base_url,
                        error = %e,
                        "Cannot fetch static repository"
                    );
                    None
                }
            }
        } else {
            self.identify(endpoint).await
        };

        let name = name.unwrap_or_else(|| {
            url::Url::parse(&self.base_url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| self.base_url.clone())
        });
        tracing::info!(provider = %self.base_url, name = %name, "Resolved provider name");
        self.name = Some(name);
    }

    async fn identify<E: OaiEndpoint>(&self, endpoint: &E) -> Option<String> {
        let request = &self.request(Verb::Identify);
        let identified = self
            .retry
            .run("Identify", move || async move {
                let response = endpoint.invoke(request).await?;
                response.check()?;
                Ok(response)
            })
            .await;
        match identified {
            Ok(response) => response.repository_name(),
            Err(e) => {
                tracing::warn!(provider = %self.base_url, error = %e, "Identify failed");
                None
            }
        }
    }
}

/// Payload of a harvested record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordContent {
    /// Unparsed document bytes.
    Bytes(Vec<u8>),
    Tree(Element),
}

impl RecordContent {
    /// Parsed view of the content.
    pub fn to_tree(&self) -> Result<Element, AppError> {
        match self {
            RecordContent::Tree(element) => Ok(element.clone()),
            RecordContent::Bytes(bytes) => Element::parse(bytes),
        }
    }

    /// Serialized view of the content.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AppError> {
        match self {
            RecordContent::Bytes(bytes) => Ok(bytes.clone()),
            RecordContent::Tree(element) => element.to_document(true),
        }
    }
}

/// A record handed to the action pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub identifier: String,
    pub prefix: String,
    /// Display name of the provider the record came from.
    pub origin: String,
    pub content: RecordContent,
    /// Content still wrapped in the OAI `<record>` envelope.
    pub envelope: bool,
    /// Content holds several records rather than one.
    pub list: bool,
}

impl MetadataRecord {
    pub fn new(
        identifier: impl Into<String>,
        prefix: impl Into<String>,
        origin: impl Into<String>,
        content: RecordContent,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            prefix: prefix.into(),
            origin: origin.into(),
            content,
            envelope: false,
            list: false,
        }
    }

    pub fn enveloped(mut self, envelope: bool) -> Self {
        self.envelope = envelope;
        self
    }

    pub fn as_list(mut self, list: bool) -> Self {
        self.list = list;
        self
    }
}
