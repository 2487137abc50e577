use std::collections::VecDeque;

use chrono::NaiveDate;

use crate::dedup::{DedupStore, IdPrefix};
use crate::error::AppError;
use crate::models::{MetadataRecord, Provider};
use crate::oai::{OaiResponse, Verb};
use crate::traits::OaiEndpoint;

use super::{GetRecord, Harvesting, Paginator, is_deleted, not_requested};

/// ListIdentifiers over every prefix and set, then one GetRecord per
/// distinct (identifier, prefix) pair.
///
/// Listing pages only collect pairs. The first `parse_response` freezes
/// the collection; each later call fetches one record. A failed GetRecord
/// is logged and yields `None`.
pub struct ListIdentifiers<'a, E> {
    provider: &'a Provider,
    endpoint: &'a E,
    pages: Paginator,
    response: Option<OaiResponse>,
    collected: DedupStore,
    targets: Option<VecDeque<IdPrefix>>,
    failed: usize,
}

impl<'a, E: OaiEndpoint> ListIdentifiers<'a, E> {
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
            collected: DedupStore::new(),
            targets: None,
            failed: 0,
        }
    }

    pub fn position(&self) -> &Paginator {
        &self.pages
    }

    /// Distinct pairs collected by the listing phase.
    pub fn collected(&self) -> usize {
        self.collected.len()
    }

    /// GetRecord calls that failed.
    pub fn failed(&self) -> usize {
        self.failed
    }
}

impl<E: OaiEndpoint> Harvesting for ListIdentifiers<'_, E> {
    type Item = MetadataRecord;

    async fn request(&mut self) -> Result<(), AppError> {
        let request = &self.pages.request(self.provider, Verb::ListIdentifiers)?;
        let endpoint = self.endpoint;
        tracing::debug!(
            provider = %self.provider.name(),
            prefix = ?request.metadata_prefix,
            set = ?request.set,
            token = ?request.resumption_token,
            "Requesting identifiers"
        );
        let response = self
            .provider
            .retry
            .run(Verb::ListIdentifiers.as_str(), move || async move {
                let response = endpoint.invoke(request).await?;
                response.check()?;
                if !response.is_no_records_match()
                    && response.verb_element(Verb::ListIdentifiers).is_none()
                {
                    return Err(AppError::XmlError(
                        "response has no ListIdentifiers element".to_string(),
                    ));
                }
                Ok(response)
            })
            .await?;
        self.response = Some(response);
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
        Ok(self.pages.skip())
    }

    fn process_response(&mut self, response: &OaiResponse) -> Result<bool, AppError> {
        if self.targets.is_some() {
            return Err(AppError::ProtocolError(
                "listing page received after record fetching started".to_string(),
            ));
        }
        let prefix = self.pages.prefix()?.to_string();
        self.pages.set_token(response.resumption_token());

        let Some(list) = response.verb_element(Verb::ListIdentifiers) else {
            return Ok(false);
        };

        let mut added = 0;
        for element in list.elements() {
            // 2.0 lists <header> elements, 1.1 lists bare <identifier> elements.
            let identifier = match element.local_name() {
                "header" if !is_deleted(element) => element.child_text("identifier"),
                "identifier" if !is_deleted(element) => Some(element.text().trim().to_string()),
                _ => None,
            };
            let Some(identifier) = identifier.filter(|id| !id.is_empty()) else {
                continue;
            };
            if self
                .collected
                .insert_if_absent(IdPrefix::new(identifier, prefix.clone()))
            {
                added += 1;
            }
        }
        tracing::debug!(
            provider = %self.provider.name(),
            prefix = %prefix,
            added,
            total = self.collected.len(),
            "Collected identifiers"
        );
        Ok(added > 0)
    }

    async fn parse_response(&mut self) -> Result<Option<MetadataRecord>, AppError> {
        if self.response.is_none() {
            return Err(not_requested("parse_response"));
        }
        let collected = &self.collected;
        let targets = self
            .targets
            .get_or_insert_with(|| collected.iter().cloned().collect());
        let Some(key) = targets.pop_front() else {
            return Ok(None);
        };

        let identifier = key.identifier.clone();
        match GetRecord::new(self.provider, self.endpoint, key).fetch().await {
            Ok(record) => Ok(record),
            Err(e @ AppError::ProtocolError(_)) => Err(e),
            Err(e) => {
                self.failed += 1;
                tracing::warn!(
                    provider = %self.provider.name(),
                    identifier = %identifier,
                    error = %e,
                    "GetRecord failed, skipping record"
                );
                Ok(None)
            }
        }
    }

    fn fully_parsed(&self) -> Result<bool, AppError> {
        if self.response.is_none() {
            return Err(not_requested("fully_parsed"));
        }
        Ok(match &self.targets {
            Some(targets) => targets.is_empty(),
            None => self.collected.is_empty(),
        })
    }
}
