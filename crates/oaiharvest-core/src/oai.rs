//! OAI-PMH requests and responses.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use url::Url;

use crate::error::AppError;
use crate::xml::{Element, normalize_whitespace};

/// Schema location announced by OAI-PMH 2.0 responses.
pub const SCHEMA_LOCATION_V2_0: &str =
    "http://www.openarchives.org/OAI/2.0/ http://www.openarchives.org/OAI/2.0/OAI-PMH.xsd";

const SCHEMA_LOCATION_V1_1_MARKER: &str = "http://www.openarchives.org/OAI/1.1/";

/// Error code that signals an empty result rather than a failure.
pub const NO_RECORDS_MATCH: &str = "noRecordsMatch";

/// The OAI-PMH operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Identify,
    ListMetadataFormats,
    ListIdentifiers,
    ListRecords,
    GetRecord,
    ListSets,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Identify => "Identify",
            Verb::ListMetadataFormats => "ListMetadataFormats",
            Verb::ListIdentifiers => "ListIdentifiers",
            Verb::ListRecords => "ListRecords",
            Verb::GetRecord => "GetRecord",
            Verb::ListSets => "ListSets",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strips query string and fragment from an endpoint URL.
///
/// The result is the provider identity used as the progress-store key.
pub fn normalize_base_url(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].trim().to_string()
}

/// One request against an OAI-PMH endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct OaiRequest {
    pub base_url: String,
    pub verb: Verb,
    pub identifier: Option<String>,
    pub metadata_prefix: Option<String>,
    pub from: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub set: Option<String>,
    pub resumption_token: Option<String>,
    /// `None` means no timeout.
    pub timeout: Option<Duration>,
}

impl OaiRequest {
    pub fn new(base_url: impl Into<String>, verb: Verb) -> Self {
        Self {
            base_url: base_url.into(),
            verb,
            identifier: None,
            metadata_prefix: None,
            from: None,
            until: None,
            set: None,
            resumption_token: None,
            timeout: None,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.metadata_prefix = Some(prefix.into());
        self
    }

    pub fn with_set(mut self, set: Option<String>) -> Self {
        self.set = set;
        self
    }

    pub fn with_from(mut self, from: Option<NaiveDate>) -> Self {
        self.from = from;
        self
    }

    pub fn with_until(mut self, until: Option<NaiveDate>) -> Self {
        self.until = until;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Continues a listing; the token replaces every other argument on the wire.
    pub fn resume(mut self, token: impl Into<String>) -> Self {
        self.resumption_token = Some(token.into());
        self
    }

    /// Full request URL.
    pub fn url(&self) -> Result<Url, AppError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| AppError::BadUrl(format!("{}: {e}", self.base_url)))?;
        url.set_query(None);
        url.set_fragment(None);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("verb", self.verb.as_str());
            if let Some(token) = &self.resumption_token {
                query.append_pair("resumptionToken", token);
            } else {
                if let Some(identifier) = &self.identifier {
                    query.append_pair("identifier", identifier);
                }
                if let Some(prefix) = &self.metadata_prefix {
                    query.append_pair("metadataPrefix", prefix);
                }
                if let Some(from) = self.from {
                    query.append_pair("from", &from.format("%Y-%m-%d").to_string());
                }
                if let Some(until) = self.until {
                    query.append_pair("until", &until.format("%Y-%m-%d").to_string());
                }
                if let Some(set) = &self.set {
                    query.append_pair("set", set);
                }
            }
        }
        Ok(url)
    }
}

/// Protocol version of a response, told apart by its schema location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OaiVersion {
    V2_0,
    V1_1,
    Unknown,
}

/// An OAI `<error>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OaiProtocolError {
    pub code: String,
    pub message: String,
}

impl From<OaiProtocolError> for AppError {
    fn from(e: OaiProtocolError) -> Self {
        AppError::OaiError {
            code: e.code,
            message: e.message,
        }
    }
}

/// A parsed OAI-PMH response document.
///
/// Cheap to clone; the tree is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct OaiResponse {
    document: Arc<Element>,
    schema_location: String,
}

impl OaiResponse {
    pub fn parse(bytes: &[u8]) -> Result<Self, AppError> {
        Ok(Self::new(Element::parse(bytes)?))
    }

    pub fn new(document: Element) -> Self {
        let schema_location = document
            .attr_local("schemaLocation")
            .map(normalize_whitespace)
            .unwrap_or_default();
        Self {
            document: Arc::new(document),
            schema_location,
        }
    }

    pub fn document(&self) -> &Element {
        &self.document
    }

    /// `xsi:schemaLocation` of the root with whitespace collapsed.
    pub fn schema_location(&self) -> &str {
        &self.schema_location
    }

    pub fn version(&self) -> OaiVersion {
        if self.schema_location.contains(SCHEMA_LOCATION_V2_0) {
            OaiVersion::V2_0
        } else if self.schema_location.contains(SCHEMA_LOCATION_V1_1_MARKER) {
            OaiVersion::V1_1
        } else {
            OaiVersion::Unknown
        }
    }

    /// Element holding the payload of `verb`.
    ///
    /// In 1.1 responses the root itself is the verb element; in 2.0 it is a
    /// child of `OAI-PMH`.
    pub fn verb_element(&self, verb: Verb) -> Option<&Element> {
        let root = self.document();
        if root.local_name() == verb.as_str() {
            Some(root)
        } else {
            root.child(verb.as_str())
        }
    }

    /// Resumption token of a listing page; blank tokens count as absent.
    pub fn resumption_token(&self) -> Option<String> {
        let root = self.document();
        let holder = if root.local_name() == "OAI-PMH" {
            root.elements()
                .find(|e| e.child("resumptionToken").is_some())?
        } else {
            root
        };
        holder
            .child_text("resumptionToken")
            .filter(|token| !token.is_empty())
    }

    pub fn error(&self) -> Option<OaiProtocolError> {
        let error = self.document().child("error")?;
        Some(OaiProtocolError {
            code: error.attr("code").unwrap_or_default().to_string(),
            message: error.text().trim().to_string(),
        })
    }

    pub fn is_no_records_match(&self) -> bool {
        self.error().is_some_and(|e| e.code == NO_RECORDS_MATCH)
    }

    /// Fails on any OAI error other than `noRecordsMatch`.
    pub fn check(&self) -> Result<(), AppError> {
        match self.error() {
            Some(e) if e.code != NO_RECORDS_MATCH => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// `metadataPrefix` echoed in the `<request>` element.
    pub fn request_prefix(&self) -> Option<&str> {
        self.document().child("request")?.attr("metadataPrefix")
    }

    /// `repositoryName` of an Identify response.
    pub fn repository_name(&self) -> Option<String> {
        self.verb_element(Verb::Identify)?
            .child_text("repositoryName")
            .filter(|name| !name.is_empty())
    }
}
