use std::time::Duration;

use oaiharvest_core::error::AppError;
use oaiharvest_core::registry::{EndpointSets, parse_catalog};

use crate::endpoint::ReqwestEndpoint;

/// Reads endpoint catalogs from a registry.
#[derive(Clone)]
pub struct RegistryReader {
    endpoint: ReqwestEndpoint,
    timeout: Option<Duration>,
}

impl RegistryReader {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            endpoint: ReqwestEndpoint::new()?,
            timeout: Some(Duration::from_secs(30)),
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Endpoint URLs of the catalog at `url`, each with its set definitions.
    pub async fn endpoint_sets(&self, url: &str) -> Result<EndpointSets, AppError> {
        tracing::info!(registry = %url, "Reading registry catalog");
        let body = self.endpoint.get(url, self.timeout).await?;
        let endpoints = parse_catalog(&body)?;
        tracing::info!(registry = %url, endpoints = endpoints.len(), "Registry catalog read");
        Ok(endpoints)
    }
}
