use std::collections::VecDeque;

use crate::error::AppError;
use crate::models::{MetadataFormat, Provider};
use crate::oai::{OaiResponse, Verb};
use crate::traits::OaiEndpoint;
use crate::xml::Element;

use super::{Harvesting, not_requested};

/// Prefixes of the `metadataFormat` elements under `list` that match `format`,
/// in document order without repeats.
pub fn match_formats(list: &Element, format: &MetadataFormat) -> Vec<String> {
    let mut prefixes: Vec<String> = Vec::new();
    for candidate in list.descendants("metadataFormat") {
        if !format.matches(candidate) {
            continue;
        }
        if let Some(prefix) = candidate.child_text("metadataPrefix")
            && !prefix.is_empty()
            && !prefixes.contains(&prefix)
        {
            prefixes.push(prefix);
        }
    }
    prefixes
}

/// Single-shot ListMetadataFormats, yielding the prefixes that match the
/// action sequence's input format.
pub struct ListPrefixes<'a, E> {
    provider: &'a Provider,
    endpoint: &'a E,
    format: &'a MetadataFormat,
    response: Option<OaiResponse>,
    prefixes: Option<VecDeque<String>>,
}

impl<'a, E: OaiEndpoint> ListPrefixes<'a, E> {
    pub fn new(provider: &'a Provider, endpoint: &'a E, format: &'a MetadataFormat) -> Self {
        Self {
            provider,
            endpoint,
            format,
            response: None,
            prefixes: None,
        }
    }
}

impl<E: OaiEndpoint> Harvesting for ListPrefixes<'_, E> {
    type Item = String;

    async fn request(&mut self) -> Result<(), AppError> {
        let request = &self.provider.request(Verb::ListMetadataFormats);
        let endpoint = self.endpoint;
        let response = self
            .provider
            .retry
            .run(Verb::ListMetadataFormats.as_str(), move || async move {
                let response = endpoint.invoke(request).await?;
                response.check()?;
                if response.verb_element(Verb::ListMetadataFormats).is_none() {
                    return Err(AppError::XmlError(
                        "response has no ListMetadataFormats element".to_string(),
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
        Ok(false)
    }

    fn process_response(&mut self, response: &OaiResponse) -> Result<bool, AppError> {
        let Some(list) = response.verb_element(Verb::ListMetadataFormats) else {
            self.prefixes = Some(VecDeque::new());
            return Ok(false);
        };
        let prefixes = match_formats(list, self.format);
        tracing::debug!(
            provider = %self.provider.name(),
            format = %self.format,
            ?prefixes,
            "Matched metadata formats"
        );
        self.prefixes = Some(prefixes.into());
        Ok(true)
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
