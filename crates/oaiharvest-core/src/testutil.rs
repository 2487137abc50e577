//! Test utilities: mock endpoint and recording pipeline stage.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::action::Action;
use crate::error::AppError;
use crate::models::MetadataRecord;
use crate::oai::{OaiRequest, OaiResponse, Verb};
use crate::traits::OaiEndpoint;
use crate::xml::Element;

/// Wraps a verb payload in an OAI-PMH 2.0 response envelope.
pub fn oai_envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"
         xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
         xsi:schemaLocation="http://www.openarchives.org/OAI/2.0/ http://www.openarchives.org/OAI/2.0/OAI-PMH.xsd">
  <responseDate>2024-01-01T00:00:00Z</responseDate>
  <request>http://example.org/oai</request>
  {body}
</OAI-PMH>"#
    )
}

/// A `<record>` element with a Dublin Core payload.
pub fn dc_record(identifier: &str, title: &str) -> String {
    format!(
        r#"<record><header><identifier>{identifier}</identifier></header><metadata><oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>{title}</dc:title></oai_dc:dc></metadata></record>"#
    )
}

/// A deleted `<record>` element.
pub fn deleted_record(identifier: &str) -> String {
    format!(
        r#"<record><header status="deleted"><identifier>{identifier}</identifier></header></record>"#
    )
}

// ---------------------------------------------------------------------------
// MockEndpoint
// ---------------------------------------------------------------------------

/// Mock endpoint answering from a scripted queue per verb.
///
/// Every request is recorded. A verb with an empty queue answers with a
/// non-retryable error so unexpected calls surface in assertions.
#[derive(Clone, Default)]
pub struct MockEndpoint {
    responses: Arc<Mutex<HashMap<Verb, VecDeque<Result<OaiResponse, AppError>>>>>,
    documents: Arc<Mutex<HashMap<String, Element>>>,
    requests: Arc<Mutex<Vec<OaiRequest>>>,
    fetches: Arc<Mutex<Vec<String>>>,
}

impl MockEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response whose body is wrapped in an OAI-PMH envelope.
    pub fn push_ok(&self, verb: Verb, body: &str) {
        let response = OaiResponse::parse(oai_envelope(body).as_bytes()).unwrap();
        self.push(verb, Ok(response));
    }

    pub fn push_err(&self, verb: Verb, error: AppError) {
        self.push(verb, Err(error));
    }

    pub fn push(&self, verb: Verb, response: Result<OaiResponse, AppError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(verb)
            .or_default()
            .push_back(response);
    }

    /// Serves `document` for plain fetches of `url`.
    pub fn set_document(&self, url: &str, document: &str) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), Element::parse_str(document).unwrap());
    }

    pub fn requests(&self) -> Vec<OaiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, verb: Verb) -> Vec<OaiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.verb == verb)
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// URLs of plain document fetches, in order.
    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

impl OaiEndpoint for MockEndpoint {
    async fn invoke(&self, request: &OaiRequest) -> Result<OaiResponse, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .get_mut(&request.verb)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(AppError::Generic(format!(
                    "no scripted response for {}",
                    request.verb
                )))
            })
    }

    async fn fetch_document(
        &self,
        url: &str,
        _timeout: Option<Duration>,
    ) -> Result<Element, AppError> {
        self.fetches.lock().unwrap().push(url.to_string());
        self.documents
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| AppError::HttpError(format!("HTTP 404 for {url}")))
    }
}

// ---------------------------------------------------------------------------
// RecordingAction
// ---------------------------------------------------------------------------

/// Pipeline stage that collects every record it sees.
///
/// Clones share the same log, so pooled copies report to one place.
#[derive(Debug, Clone, Default)]
pub struct RecordingAction {
    seen: Arc<Mutex<Vec<MetadataRecord>>>,
    fail: bool,
}

impl RecordingAction {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stage that rejects every batch.
    pub fn failing() -> Self {
        Self {
            seen: Arc::default(),
            fail: true,
        }
    }

    pub fn records(&self) -> Vec<MetadataRecord> {
        self.seen.lock().unwrap().clone()
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .map(|r| r.identifier)
            .collect()
    }
}

impl Action for RecordingAction {
    fn perform(&mut self, records: Vec<MetadataRecord>) -> Result<Vec<MetadataRecord>, AppError> {
        if self.fail {
            return Err(AppError::ActionError("rejected".into()));
        }
        self.seen.lock().unwrap().extend(records.iter().cloned());
        Ok(records)
    }

    fn box_clone(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

impl fmt::Display for RecordingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("record")
    }
}
