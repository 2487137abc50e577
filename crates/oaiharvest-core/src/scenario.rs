//! Drives harvesting variants through their state machine and feeds the
//! resulting records to an action sequence.
//!
//! ```text
//! INIT --request--> HAS_PAGE --process--> PARSING --fully parsed--> HAS_PAGE
//!   |                  |                                               |
//!   |            request failed: abandon position          request_more == false
//!   v                  v                                               v
//! FAILED <--- nothing left, something abandoned          DONE (or FAILED if
//!                                                        anything was abandoned)
//! ```

use std::fmt;

use chrono::NaiveDate;

use crate::action::ActionSequence;
use crate::error::AppError;
use crate::harvesting::{
    Harvesting, ListIdentifiers, ListPrefixes, ListRecords, StaticPrefixes, StaticRecordList,
};
use crate::models::{MetadataRecord, Provider, ScenarioKind};
use crate::oai::OaiResponse;
use crate::traits::OaiEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioState {
    Init,
    HasPage,
    Parsing,
    Done,
    Failed,
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioState::Init => "init",
            ScenarioState::HasPage => "has-page",
            ScenarioState::Parsing => "parsing",
            ScenarioState::Done => "done",
            ScenarioState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of one scenario run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioOutcome {
    pub state: ScenarioState,
    /// Listing requests issued (a retried request counts once).
    pub requests: usize,
    /// Records that passed the whole action sequence.
    pub delivered: usize,
    /// Records a pipeline stage rejected.
    pub rejected: usize,
    /// Records whose individual fetch failed.
    pub skipped: usize,
    /// Prefix/set positions given up after exhausted retries.
    pub abandoned: usize,
}

impl ScenarioOutcome {
    fn new() -> Self {
        Self {
            state: ScenarioState::Init,
            requests: 0,
            delivered: 0,
            rejected: 0,
            skipped: 0,
            abandoned: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ScenarioState::Done
    }

    fn enter(&mut self, next: ScenarioState) {
        tracing::trace!(from = %self.state, to = %next, "Scenario transition");
        self.state = next;
    }

    fn finish(&mut self) {
        let last = if self.abandoned == 0 {
            ScenarioState::Done
        } else {
            ScenarioState::Failed
        };
        self.enter(last);
    }
}

/// Harvests one provider for one action sequence.
pub struct Scenario<'a, E> {
    provider: &'a Provider,
    endpoint: &'a E,
    sequence: &'a ActionSequence,
    repository: Option<OaiResponse>,
}

impl<'a, E: OaiEndpoint> Scenario<'a, E> {
    pub fn new(provider: &'a Provider, endpoint: &'a E, sequence: &'a ActionSequence) -> Self {
        Self {
            provider,
            endpoint,
            sequence,
            repository: None,
        }
    }

    /// Metadata prefixes of the provider that match the sequence's input format.
    pub async fn get_prefixes(&mut self) -> Result<Vec<String>, AppError> {
        let format = self.sequence.format();
        let (prefixes, response) = if self.provider.is_static {
            collect(StaticPrefixes::new(self.provider, self.endpoint, format)).await?
        } else {
            collect(ListPrefixes::new(self.provider, self.endpoint, format)).await?
        };
        if self.provider.is_static {
            self.repository = Some(response);
        }
        Ok(prefixes)
    }

    /// Runs the scenario `kind` over `prefixes`.
    pub async fn run(
        &mut self,
        kind: ScenarioKind,
        prefixes: Vec<String>,
        from: Option<NaiveDate>,
    ) -> Result<ScenarioOutcome, AppError> {
        if prefixes.is_empty() || kind == ScenarioKind::ListPrefixes {
            let mut outcome = ScenarioOutcome::new();
            outcome.finish();
            return Ok(outcome);
        }
        match (kind, self.provider.is_static) {
            (_, true) => self.list_static(prefixes).await,
            (ScenarioKind::ListIdentifiers, false) => self.list_identifiers(prefixes, from).await,
            _ => self.list_records(prefixes, from).await,
        }
    }

    /// ListRecords, delivering each page as it arrives.
    pub async fn list_records(
        &self,
        prefixes: Vec<String>,
        from: Option<NaiveDate>,
    ) -> Result<ScenarioOutcome, AppError> {
        let mut harvesting = ListRecords::new(self.provider, self.endpoint, prefixes, from);
        let mut outcome = ScenarioOutcome::new();
        self.walk(&mut harvesting, &mut outcome, true).await?;
        outcome.finish();
        Ok(outcome)
    }

    /// ListIdentifiers for every position, then GetRecord per identifier.
    pub async fn list_identifiers(
        &self,
        prefixes: Vec<String>,
        from: Option<NaiveDate>,
    ) -> Result<ScenarioOutcome, AppError> {
        let mut harvesting = ListIdentifiers::new(self.provider, self.endpoint, prefixes, from);
        let mut outcome = ScenarioOutcome::new();
        self.walk(&mut harvesting, &mut outcome, false).await?;

        if harvesting.response().is_ok() {
            outcome.enter(ScenarioState::Parsing);
            self.drain(&mut harvesting, &mut outcome).await?;
            outcome.skipped = harvesting.failed();
        }
        outcome.finish();
        Ok(outcome)
    }

    async fn list_static(&mut self, prefixes: Vec<String>) -> Result<ScenarioOutcome, AppError> {
        let mut harvesting = StaticRecordList::new(self.provider, self.endpoint, prefixes);
        if let Some(repository) = self.repository.take() {
            harvesting = harvesting.with_repository(repository);
        }
        let mut outcome = ScenarioOutcome::new();
        self.walk(&mut harvesting, &mut outcome, true).await?;
        outcome.finish();
        Ok(outcome)
    }

    /// Requests every position in turn. With `deliver`, each page is parsed
    /// and delivered before the next request.
    async fn walk<H>(
        &self,
        harvesting: &mut H,
        outcome: &mut ScenarioOutcome,
        deliver: bool,
    ) -> Result<(), AppError>
    where
        H: Harvesting<Item = MetadataRecord>,
    {
        loop {
            outcome.requests += 1;
            if let Err(e) = harvesting.request().await {
                if matches!(e, AppError::ProtocolError(_)) {
                    return Err(self.protocol(e));
                }
                if e.is_provider_fatal() {
                    tracing::error!(provider = %self.provider.name(), error = %e, "Provider failed");
                    return Err(e);
                }
                outcome.abandoned += 1;
                tracing::warn!(
                    provider = %self.provider.name(),
                    error = %e,
                    "Request failed, abandoning position"
                );
                if harvesting.abandon_position().map_err(|e| self.protocol(e))? {
                    continue;
                }
                break;
            }
            outcome.enter(ScenarioState::HasPage);

            let response = harvesting.response().map_err(|e| self.protocol(e))?;
            harvesting
                .process_response(&response)
                .map_err(|e| self.protocol(e))?;

            if deliver {
                outcome.enter(ScenarioState::Parsing);
                self.drain(harvesting, outcome).await?;
                outcome.enter(ScenarioState::HasPage);
            }

            if !harvesting.request_more().map_err(|e| self.protocol(e))? {
                break;
            }
        }
        Ok(())
    }

    async fn drain<H>(&self, harvesting: &mut H, outcome: &mut ScenarioOutcome) -> Result<(), AppError>
    where
        H: Harvesting<Item = MetadataRecord>,
    {
        while !harvesting.fully_parsed().map_err(|e| self.protocol(e))? {
            let record = harvesting
                .parse_response()
                .await
                .map_err(|e| self.protocol(e))?;
            if let Some(record) = record {
                if self.sequence.run(record).await {
                    outcome.delivered += 1;
                } else {
                    outcome.rejected += 1;
                }
            }
        }
        Ok(())
    }

    fn protocol(&self, e: AppError) -> AppError {
        if matches!(e, AppError::ProtocolError(_)) {
            tracing::error!(
                provider = %self.provider.name(),
                sequence = %self.sequence,
                error = %e,
                "Harvesting contract violated"
            );
        }
        e
    }
}

async fn collect<H>(mut harvesting: H) -> Result<(Vec<String>, OaiResponse), AppError>
where
    H: Harvesting<Item = String>,
{
    harvesting.request().await?;
    let response = harvesting.response()?;
    harvesting.process_response(&response)?;
    let mut prefixes = Vec::new();
    while !harvesting.fully_parsed()? {
        if let Some(prefix) = harvesting.parse_response().await? {
            prefixes.push(prefix);
        }
    }
    Ok((prefixes, response))
}
