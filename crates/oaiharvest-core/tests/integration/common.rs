//! Scripted OAI-PMH repositories for integration tests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use oaiharvest_core::{
    Action, AppError, Element, MetadataRecord, OaiEndpoint, OaiRequest, OaiResponse, Verb,
};
use tokio::time::Instant;

pub const CMDI_NAMESPACE: &str = "http://www.clarin.eu/cmd/";
pub const DC_NAMESPACE: &str = "http://www.openarchives.org/OAI/2.0/oai_dc/";

// =============================================================================
// Repository
// =============================================================================

#[derive(Debug, Clone)]
struct StoredRecord {
    identifier: String,
    prefix: String,
    sets: Vec<String>,
    datestamp: NaiveDate,
    deleted: bool,
}

/// One scripted repository.
#[derive(Debug, Clone)]
pub struct Repository {
    base_url: String,
    name: String,
    formats: Vec<(String, String)>,
    records: Vec<StoredRecord>,
    page_size: usize,
    failing_sets: HashSet<String>,
}

impl Repository {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            name: "Scripted Repository".to_string(),
            formats: Vec::new(),
            records: Vec::new(),
            page_size: 10,
            failing_sets: HashSet::new(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn format(mut self, prefix: &str, namespace: &str) -> Self {
        self.formats.push((prefix.to_string(), namespace.to_string()));
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn record(self, identifier: &str, prefix: &str, sets: &[&str]) -> Self {
        self.record_dated(identifier, prefix, sets, "2019-06-01")
    }

    pub fn record_dated(mut self, identifier: &str, prefix: &str, sets: &[&str], date: &str) -> Self {
        self.records.push(StoredRecord {
            identifier: identifier.to_string(),
            prefix: prefix.to_string(),
            sets: sets.iter().map(|s| s.to_string()).collect(),
            datestamp: date.parse().unwrap(),
            deleted: false,
        });
        self
    }

    pub fn deleted(mut self, identifier: &str, prefix: &str, sets: &[&str]) -> Self {
        self.records.push(StoredRecord {
            identifier: identifier.to_string(),
            prefix: prefix.to_string(),
            sets: sets.iter().map(|s| s.to_string()).collect(),
            datestamp: "2019-06-01".parse().unwrap(),
            deleted: true,
        });
        self
    }

    /// Requests restricted to `set` fail with a network error.
    pub fn failing_set(mut self, set: &str) -> Self {
        self.failing_sets.insert(set.to_string());
        self
    }

    fn answer(&self, request: &OaiRequest) -> Result<String, AppError> {
        match request.verb {
            Verb::Identify => Ok(format!(
                "<Identify><repositoryName>{}</repositoryName><baseURL>{}</baseURL><protocolVersion>2.0</protocolVersion></Identify>",
                self.name, self.base_url
            )),
            Verb::ListMetadataFormats => {
                let formats: String = self
                    .formats
                    .iter()
                    .map(|(prefix, namespace)| {
                        format!(
                            "<metadataFormat><metadataPrefix>{prefix}</metadataPrefix><schema>{namespace}schema.xsd</schema><metadataNamespace>{namespace}</metadataNamespace></metadataFormat>"
                        )
                    })
                    .collect();
                Ok(format!("<ListMetadataFormats>{formats}</ListMetadataFormats>"))
            }
            Verb::ListRecords | Verb::ListIdentifiers => self.list(request),
            Verb::GetRecord => {
                let identifier = request.identifier.as_deref().unwrap_or_default();
                let prefix = request.metadata_prefix.as_deref().unwrap_or_default();
                Ok(self
                    .records
                    .iter()
                    .find(|r| r.identifier == identifier && r.prefix == prefix)
                    .map(|r| format!("<GetRecord>{}</GetRecord>", record_xml(r)))
                    .unwrap_or_else(|| {
                        r#"<error code="idDoesNotExist">unknown identifier</error>"#.to_string()
                    }))
            }
            Verb::ListSets => Ok("<ListSets/>".to_string()),
        }
    }

    fn list(&self, request: &OaiRequest) -> Result<String, AppError> {
        // tokens are "<prefix>|<set>|<from>|<offset>"
        let (prefix, set, from, offset) = match &request.resumption_token {
            Some(token) => {
                let parts: Vec<&str> = token.split('|').collect();
                (
                    parts[0].to_string(),
                    Some(parts[1].to_string()).filter(|s| !s.is_empty()),
                    parts[2].parse::<NaiveDate>().ok(),
                    parts[3].parse::<usize>().unwrap(),
                )
            }
            None => (
                request.metadata_prefix.clone().unwrap_or_default(),
                request.set.clone(),
                request.from,
                0,
            ),
        };

        if let Some(set) = &set
            && self.failing_sets.contains(set)
        {
            return Err(AppError::NetworkError(format!("connection reset while listing {set}")));
        }

        let matching: Vec<&StoredRecord> = self
            .records
            .iter()
            .filter(|r| r.prefix == prefix)
            .filter(|r| set.as_ref().is_none_or(|s| r.sets.contains(s)))
            .filter(|r| from.is_none_or(|f| r.datestamp >= f))
            .collect();
        if matching.is_empty() {
            return Ok(r#"<error code="noRecordsMatch">nothing here</error>"#.to_string());
        }

        let page = &matching[offset.min(matching.len())..(offset + self.page_size).min(matching.len())];
        let items: String = page
            .iter()
            .map(|r| match request.verb {
                Verb::ListIdentifiers => header_xml(r),
                _ => record_xml(r),
            })
            .collect();
        let token = if offset + self.page_size < matching.len() {
            format!(
                "<resumptionToken>{}|{}|{}|{}</resumptionToken>",
                prefix,
                set.unwrap_or_default(),
                from.map(|f| f.to_string()).unwrap_or_default(),
                offset + self.page_size
            )
        } else {
            "<resumptionToken/>".to_string()
        };
        Ok(format!("<{0}>{items}{token}</{0}>", request.verb))
    }
}

fn header_xml(record: &StoredRecord) -> String {
    let status = if record.deleted { r#" status="deleted""# } else { "" };
    let sets: String = record
        .sets
        .iter()
        .map(|s| format!("<setSpec>{s}</setSpec>"))
        .collect();
    format!(
        "<header{status}><identifier>{}</identifier><datestamp>{}</datestamp>{sets}</header>",
        record.identifier, record.datestamp
    )
}

fn record_xml(record: &StoredRecord) -> String {
    if record.deleted {
        return format!("<record>{}</record>", header_xml(record));
    }
    let payload = if record.prefix == "cmdi" {
        format!(
            r#"<CMD xmlns="{CMDI_NAMESPACE}"><Header/><Components><title>{}</title></Components></CMD>"#,
            record.identifier
        )
    } else {
        format!(
            r#"<oai_dc:dc xmlns:oai_dc="{DC_NAMESPACE}" xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>{}</dc:title></oai_dc:dc>"#,
            record.identifier
        )
    };
    format!("<record>{}<metadata>{payload}</metadata></record>", header_xml(record))
}

fn envelope(request: &OaiRequest, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"
         xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"
         xsi:schemaLocation="http://www.openarchives.org/OAI/2.0/ http://www.openarchives.org/OAI/2.0/OAI-PMH.xsd">
  <responseDate>2024-01-01T00:00:00Z</responseDate>
  <request verb="{}">{}</request>
  {body}
</OAI-PMH>"#,
        request.verb, request.base_url
    )
}

// =============================================================================
// MockNetwork
// =============================================================================

/// Endpoint serving any number of scripted repositories by base URL.
///
/// Unknown base URLs answer with `BadUrl`. Every request is recorded.
#[derive(Clone, Default)]
pub struct MockNetwork {
    repositories: Arc<Mutex<HashMap<String, Repository>>>,
    documents: Arc<Mutex<HashMap<String, String>>>,
    requests: Arc<Mutex<Vec<OaiRequest>>>,
    fetches: Arc<Mutex<Vec<String>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, repository: Repository) -> Self {
        self.repositories
            .lock()
            .unwrap()
            .insert(repository.base_url.clone(), repository);
        self
    }

    /// Serves a static repository document at `url`.
    pub fn with_document(self, url: &str, xml: &str) -> Self {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), xml.to_string());
        self
    }

    pub fn requests(&self) -> Vec<OaiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, base_url: &str, verb: Verb) -> Vec<OaiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.base_url == base_url && r.verb == verb)
            .collect()
    }

    /// URLs of plain document fetches, in order.
    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

impl OaiEndpoint for MockNetwork {
    async fn invoke(&self, request: &OaiRequest) -> Result<OaiResponse, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        let repository = self
            .repositories
            .lock()
            .unwrap()
            .get(&request.base_url)
            .cloned()
            .ok_or_else(|| AppError::BadUrl(request.base_url.clone()))?;
        let body = repository.answer(request)?;
        OaiResponse::parse(envelope(request, &body).as_bytes())
    }

    async fn fetch_document(&self, url: &str, _timeout: Option<Duration>) -> Result<Element, AppError> {
        self.fetches.lock().unwrap().push(url.to_string());
        let xml = self
            .documents
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| AppError::HttpError(format!("HTTP 404 for {url}")))?;
        Element::parse_str(&xml)
    }
}

// =============================================================================
// TimedNetwork
// =============================================================================

/// One endpoint call and the time it was in flight.
#[derive(Debug, Clone)]
pub struct Call {
    pub base_url: String,
    pub verb: Verb,
    pub start: Instant,
    pub end: Instant,
}

impl Call {
    pub fn overlaps(&self, start: Instant, end: Instant) -> bool {
        self.start < end && self.end > start
    }
}

/// A [`MockNetwork`] whose calls each take `latency`.
///
/// Tracks how many calls are in flight at once and logs every call.
#[derive(Clone)]
pub struct TimedNetwork {
    inner: MockNetwork,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl TimedNetwork {
    pub fn new(inner: MockNetwork, latency: Duration) -> Self {
        Self {
            inner,
            latency,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Most calls ever in flight together.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl OaiEndpoint for TimedNetwork {
    async fn invoke(&self, request: &OaiRequest) -> Result<OaiResponse, AppError> {
        let start = Instant::now();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.latency).await;
        let result = self.inner.invoke(request).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call {
            base_url: request.base_url.clone(),
            verb: request.verb,
            start,
            end: Instant::now(),
        });
        result
    }

    async fn fetch_document(&self, url: &str, timeout: Option<Duration>) -> Result<Element, AppError> {
        self.inner.fetch_document(url, timeout).await
    }
}

// =============================================================================
// CollectingAction
// =============================================================================

/// Pipeline stage that keeps a copy of every record it sees.
#[derive(Debug, Clone, Default)]
pub struct CollectingAction {
    seen: Arc<Mutex<Vec<MetadataRecord>>>,
}

impl CollectingAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.identifier.clone())
            .collect()
    }

    pub fn records(&self) -> Vec<MetadataRecord> {
        self.seen.lock().unwrap().clone()
    }
}

impl Action for CollectingAction {
    fn perform(&mut self, records: Vec<MetadataRecord>) -> Result<Vec<MetadataRecord>, AppError> {
        self.seen.lock().unwrap().extend(records.iter().cloned());
        Ok(records)
    }

    fn box_clone(&self) -> Box<dyn Action> {
        Box::new(self.clone())
    }
}

impl fmt::Display for CollectingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("collect")
    }
}
