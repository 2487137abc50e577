//! Providers that publish their whole repository as one XML document.
//!
//! The document has a `Repository` root holding `Identify`,
//! `ListMetadataFormats` and one `ListRecords metadataPrefix="..."` child
//! per format. It is fetched once; nothing is paginated.

use std::collections::VecDeque;

use crate::dedup::{DedupStore, IdPrefix};
use crate::error::AppError;
use crate::models::{MetadataFormat, MetadataRecord, Provider, RecordContent};
use crate::oai::OaiResponse;
use crate::traits::OaiEndpoint;
use crate::xml::Element;

use super::{Harvesting, Paginator, live_identifier, match_formats, not_requested};

/// Fetches a static repository document with the provider's retry policy.
pub async fn fetch_repository<E: OaiEndpoint>(
    provider: &Provider,
    endpoint: &E,
) -> Result<OaiResponse, AppError> {
    let url = provider.base_url.as_str();
    let timeout = provider.timeout();
    let document = provider
        .retry
        .run("static repository", move || async move {
            let document = endpoint.fetch_document(url, timeout).await?;
            if document.local_name() != "Repository" {
                return Err(AppError::XmlError(format!(
                    "expected a Repository document, found <{}>",
                    document.name()
                )));
            }
            Ok(document)
        })
        .await?;
    Ok(OaiResponse::new(document))
}

/// Prefix discovery over a static repository.
pub struct StaticPrefixes<'a, E> {
    provider: &'a Provider,
    endpoint: &'a E,
    format: &'a MetadataFormat,
    repository: Option<OaiResponse>,
    prefixes: Option<VecDeque<String>>,
}

impl<'a, E: OaiEndpoint> StaticPrefixes<'a, E> {
    pub fn new(provider: &'a Provider, endpoint: &'a E, format: &'a MetadataFormat) -> Self {
        Self {
            provider,
            endpoint,
            format,
            repository: provider.repository().cloned(),
            prefixes: None,
        }
    }
}

impl<E: OaiEndpoint> Harvesting for StaticPrefixes<'_, E> {
    type Item = String;

    async fn request(&mut self) -> Result<(), AppError> {
        if self.repository.is_none() {
            self.repository = Some(fetch_repository(self.provider, self.endpoint).await?);
        }
        Ok(())
    }

    fn response(&self) -> Result<OaiResponse, AppError> {
        self.repository
            .clone()
            .ok_or_else(|| not_requested("response"))
    }

    fn request_more(&mut self) -> Result<bool, AppError> {
        Ok(false)
    }

    fn process_response(&mut self, response: &OaiResponse) -> Result<bool, AppError> {
        let prefixes = response
            .document()
            .child("ListMetadataFormats")
            .map(|list| match_formats(list, self.format))
            .unwrap_or_default();
        let found = !prefixes.is_empty();
        self.prefixes = Some(prefixes.into());
        Ok(found)
    }

    async fn parse_response(&mut self) -> Result<Option<String>, AppError> {
        match &mut self.prefixes {
            Some(prefixes) => Ok(prefixes.pop_front()),
            None => Err(not_requested("parse_response")),
        }
    }

    fn fully_parsed(&self) -> Result<bool, AppError> {
        match &self.prefixes {
            Some(prefixes) => Ok(prefixes.is_empty()),
            None => Err(not_requested("fully_parsed")),
        }
    }
}

/// Records of a static repository, one prefix at a time.
pub struct StaticRecordList<'a, E> {
    provider: &'a Provider,
    endpoint: &'a E,
    pages: Paginator,
    repository: Option<OaiResponse>,
    pending: Option<VecDeque<Element>>,
    seen: DedupStore,
}

impl<'a, E: OaiEndpoint> StaticRecordList<'a, E> {
    pub fn new(provider: &'a Provider, endpoint: &'a E, prefixes: Vec<String>) -> Self {
        Self {
            provider,
            endpoint,
            pages: Paginator::new(prefixes, Vec::new(), None),
            repository: None,
            pending: None,
            seen: DedupStore::new(),
        }
    }

    /// Reuses a repository document fetched earlier.
    pub fn with_repository(mut self, repository: OaiResponse) -> Self {
        self.repository = Some(repository);
        self
    }
}

impl<E: OaiEndpoint> Harvesting for StaticRecordList<'_, E> {
    type Item = MetadataRecord;

    async fn request(&mut self) -> Result<(), AppError> {
        self.pages.check()?;
        if self.repository.is_none() {
            self.repository = Some(fetch_repository(self.provider, self.endpoint).await?);
        }
        self.pending = None;
        Ok(())
    }

    fn response(&self) -> Result<OaiResponse, AppError> {
        self.repository
            .clone()
            .ok_or_else(|| not_requested("response"))
    }

    fn request_more(&mut self) -> Result<bool, AppError> {
        Ok(self.pages.advance())
    }

    fn abandon_position(&mut self) -> Result<bool, AppError> {
        self.pending = None;
        Ok(self.pages.skip())
    }

    fn process_response(&mut self, response: &OaiResponse) -> Result<bool, AppError> {
        let prefix = self.pages.prefix()?;
        let records: VecDeque<Element> = response
            .document()
            .children_named("ListRecords")
            .filter(|list| list.attr("metadataPrefix") == Some(prefix))
            .flat_map(|list| list.children_named("record"))
            .cloned()
            .collect();
        let found = !records.is_empty();
        self.pending = Some(records);
        Ok(found)
    }

    async fn parse_response(&mut self) -> Result<Option<MetadataRecord>, AppError> {
        let prefix = self.pages.prefix()?.to_string();
        let Some(pending) = self.pending.as_mut() else {
            return Err(not_requested("parse_response"));
        };
        while let Some(record) = pending.pop_front() {
            let Some(identifier) = live_identifier(&record) else {
                continue;
            };
            if !self
                .seen
                .insert_if_absent(IdPrefix::new(identifier.clone(), prefix.clone()))
            {
                continue;
            }
            return Ok(Some(
                MetadataRecord::new(
                    identifier,
                    prefix,
                    self.provider.name(),
                    RecordContent::Tree(record),
                )
                .enveloped(true),
            ));
        }
        Ok(None)
    }

    fn fully_parsed(&self) -> Result<bool, AppError> {
        match &self.pending {
            Some(pending) => Ok(pending.is_empty()),
            None => Err(not_requested("fully_parsed")),
        }
    }
}
