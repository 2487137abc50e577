use std::collections::VecDeque;

use chrono::NaiveDate;

use crate::dedup::{DedupStore, IdPrefix};
use crate::error::AppError;
use crate::models::{MetadataRecord, Provider, RecordContent};
use crate::oai::{OaiResponse, Verb};
use crate::traits::OaiEndpoint;
use crate::xml::Element;

use super::{Harvesting, Paginator, live_identifier, not_requested};

/// Paginated ListRecords over every prefix and set.
///
/// Each page is parsed record by record. Deleted records and records with
/// no metadata are skipped; a record already delivered under the same
/// prefix (through another set) is dropped.
pub struct ListRecords<'a, E> {
    provider: &'a Provider,
    endpoint: &'a E,
    pages: Paginator,
    response: Option<OaiResponse>,
    pending: Option<VecDeque<Element>>,
    seen: DedupStore,
}

impl<'a, E: OaiEndpoint> ListRecords<'a, E> {
    pub fn new(
        provider: &'a Provider,
        endpoint: &'a E,
        prefixes: Vec<String>,
        from: Option<NaiveDate>,
    ) -> Self {
        Self {
            provider,
            endpoint,
            pages: Paginator::new(prefixes, provider.sets.clone(), from),
            response: None,
            pending: None,
            seen: DedupStore::new(),
        }
    }

    pub fn position(&self) -> &Paginator {
        &self.pages
    }

    /// Number of distinct records delivered so far.
    pub fn delivered(&self) -> usize {
        self.seen.len()
    }
}

impl<E: OaiEndpoint> Harvesting for ListRecords<'_, E> {
    type Item = MetadataRecord;

    async fn request(&mut self) -> Result<(), AppError> {
        let request = &self.pages.request(self.provider, Verb::ListRecords)?;
        let endpoint = self.endpoint;
        tracing::debug!(
            provider = %self.provider.name(),
            prefix = ?request.metadata_prefix,
            set = ?request.set,
            token = ?request.resumption_token,
            "Requesting records"
        );
        let response = self
            .provider
            .retry
            .run(Verb::ListRecords.as_str(), move || async move {
                let response = endpoint.invoke(request).await?;
                response.check()?;
                if !response.is_no_records_match()
                    && response.verb_element(Verb::ListRecords).is_none()
                {
                    return Err(AppError::XmlError(
                        "response has no ListRecords element".to_string(),
                    ));
                }
                Ok(response)
            })
            .await?;
        self.response = Some(response);
        self.pending = None;
        Ok(())
    }

    fn response(&self) -> Result<OaiResponse, AppError> {
        self.response
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
        self.pages.set_token(response.resumption_token());
        let records: VecDeque<Element> = response
            .verb_element(Verb::ListRecords)
            .map(|list| list.children_named("record").cloned().collect())
            .unwrap_or_default();
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
            if record.child("metadata").is_none() {
                tracing::debug!(identifier = %identifier, "Record has no metadata, skipping");
                continue;
            }
            if !self
                .seen
                .insert_if_absent(IdPrefix::new(identifier.clone(), prefix.clone()))
            {
                tracing::debug!(identifier = %identifier, prefix = %prefix, "Duplicate record");
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
