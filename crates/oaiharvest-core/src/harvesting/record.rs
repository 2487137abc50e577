use crate::dedup::IdPrefix;
use crate::error::AppError;
use crate::models::{MetadataRecord, Provider, RecordContent};
use crate::oai::{OaiResponse, Verb};
use crate::traits::OaiEndpoint;
use crate::xml::Element;

use super::{Harvesting, live_identifier, not_requested};

/// GetRecord for one (identifier, prefix) pair.
pub struct GetRecord<'a, E> {
    provider: &'a Provider,
    endpoint: &'a E,
    key: IdPrefix,
    response: Option<OaiResponse>,
    record: Option<Element>,
    processed: bool,
}

impl<'a, E: OaiEndpoint> GetRecord<'a, E> {
    pub fn new(provider: &'a Provider, endpoint: &'a E, key: IdPrefix) -> Self {
        Self {
            provider,
            endpoint,
            key,
            response: None,
            record: None,
            processed: false,
        }
    }

    /// Requests, processes and parses in one go.
    pub async fn fetch(mut self) -> Result<Option<MetadataRecord>, AppError> {
        self.request().await?;
        let response = self.response()?;
        self.process_response(&response)?;
        self.parse_response().await
    }
}

impl<E: OaiEndpoint> Harvesting for GetRecord<'_, E> {
    type Item = MetadataRecord;

    async fn request(&mut self) -> Result<(), AppError> {
        let request = &self
            .provider
            .request(Verb::GetRecord)
            .with_identifier(self.key.identifier.clone())
            .with_prefix(self.key.prefix.clone());
        let endpoint = self.endpoint;
        let response = self
            .provider
            .retry
            .run(Verb::GetRecord.as_str(), move || async move {
                let response = endpoint.invoke(request).await?;
                response.check()?;
                Ok(response)
            })
            .await?;
        self.response = Some(response);
        self.processed = false;
        Ok(())
    }

    fn response(&self) -> Result<OaiResponse, AppError> {
        self.response
            .clone()
            .ok_or_else(|| not_requested("response"))
    }

    fn request_more(&mut self) -> Result<bool, AppError> {
        Ok(false)
    }

    fn process_response(&mut self, response: &OaiResponse) -> Result<bool, AppError> {
        self.processed = true;
        self.record = response
            .verb_element(Verb::GetRecord)
            .and_then(|e| e.child("record"))
            .filter(|record| live_identifier(record).is_some())
            .cloned();
        Ok(self.record.is_some())
    }

    async fn parse_response(&mut self) -> Result<Option<MetadataRecord>, AppError> {
        if !self.processed {
            return Err(not_requested("parse_response"));
        }
        let Some(record) = self.record.take() else {
            return Ok(None);
        };
        Ok(Some(
            MetadataRecord::new(
                self.key.identifier.clone(),
                self.key.prefix.clone(),
                self.provider.name(),
                RecordContent::Tree(record),
            )
            .enveloped(true),
        ))
    }

    fn fully_parsed(&self) -> Result<bool, AppError> {
        if !self.processed {
            return Err(not_requested("fully_parsed"));
        }
        Ok(self.record.is_none())
    }
}
