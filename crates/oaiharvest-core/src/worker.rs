use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::access::ExclusiveAccess;
use crate::action::ActionSequence;
use crate::cycle::{EndpointProgress, HarvestMode, ProgressStore};
use crate::error::AppError;
use crate::models::{Provider, ScenarioKind};
use crate::scenario::{Scenario, ScenarioOutcome};
use crate::traits::OaiEndpoint;

/// Events emitted while harvesting, for monitoring/logging.
#[derive(Debug, Clone)]
pub enum HarvestEvent<'a> {
    Skipped {
        provider: &'a str,
        reason: &'a str,
    },
    /// Dry run: the provider is eligible and would be harvested.
    WouldHarvest {
        provider: &'a str,
        scenario: ScenarioKind,
        from: Option<NaiveDate>,
    },
    Started {
        provider: &'a str,
        scenario: ScenarioKind,
        from: Option<NaiveDate>,
    },
    PrefixesResolved {
        provider: &'a str,
        sequence: &'a ActionSequence,
        prefixes: &'a [String],
    },
    ScenarioFinished {
        provider: &'a str,
        outcome: &'a ScenarioOutcome,
    },
    ScenarioFailed {
        provider: &'a str,
        error: &'a str,
    },
    Finished {
        provider: &'a str,
        success: bool,
        delivered: usize,
    },
}

/// Trait for receiving harvest events (decoupled logging).
pub trait HarvestReporter: Send + Sync {
    fn report(&self, event: HarvestEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHarvestReporter;

impl HarvestReporter for TracingHarvestReporter {
    fn report(&self, event: HarvestEvent<'_>) {
        match event {
            HarvestEvent::Skipped { provider, reason } => {
                tracing::info!(%provider, %reason, "Skipping provider");
            }
            HarvestEvent::WouldHarvest {
                provider,
                scenario,
                from,
            } => {
                tracing::info!(%provider, %scenario, ?from, "Would harvest provider");
            }
            HarvestEvent::Started {
                provider,
                scenario,
                from,
            } => {
                tracing::info!(%provider, %scenario, ?from, "Harvesting provider");
            }
            HarvestEvent::PrefixesResolved {
                provider,
                sequence,
                prefixes,
            } => {
                tracing::debug!(%provider, %sequence, ?prefixes, "Resolved prefixes");
            }
            HarvestEvent::ScenarioFinished { provider, outcome } => {
                tracing::info!(
                    %provider,
                    state = %outcome.state,
                    requests = outcome.requests,
                    delivered = outcome.delivered,
                    rejected = outcome.rejected,
                    skipped = outcome.skipped,
                    abandoned = outcome.abandoned,
                    "Scenario finished"
                );
            }
            HarvestEvent::ScenarioFailed { provider, error } => {
                tracing::warn!(%provider, %error, "Scenario failed");
            }
            HarvestEvent::Finished {
                provider,
                success,
                delivered,
            } => {
                if success {
                    tracing::info!(%provider, %delivered, "Provider finished");
                } else {
                    tracing::warn!(%provider, %delivered, "Provider finished with failures");
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Harvested,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReport {
    pub provider: String,
    pub status: ProviderStatus,
    pub delivered: usize,
}

/// Totals of one harvest cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestSummary {
    pub reports: Vec<ProviderReport>,
}

impl HarvestSummary {
    fn count(&self, status: ProviderStatus) -> usize {
        self.reports.iter().filter(|r| r.status == status).count()
    }

    pub fn harvested(&self) -> usize {
        self.count(ProviderStatus::Harvested)
    }

    pub fn failed(&self) -> usize {
        self.count(ProviderStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(ProviderStatus::Skipped)
    }

    pub fn delivered(&self) -> usize {
        self.reports.iter().map(|r| r.delivered).sum()
    }
}

/// Runs one harvest cycle over a list of providers.
///
/// At most `max_jobs` providers are harvested at once; submission waits
/// for a free slot. Each provider is one task that works through every
/// action sequence until one completes.
pub struct Harvester<E, R> {
    endpoint: E,
    sequences: Arc<Vec<ActionSequence>>,
    progress: Arc<ProgressStore>,
    access: ExclusiveAccess,
    reporter: Arc<R>,
    max_jobs: usize,
    dry_run: bool,
}

impl<E, R> Harvester<E, R>
where
    E: OaiEndpoint + 'static,
    R: HarvestReporter + 'static,
{
    pub fn new(
        endpoint: E,
        sequences: Vec<ActionSequence>,
        progress: Arc<ProgressStore>,
        reporter: R,
    ) -> Self {
        Self {
            endpoint,
            sequences: Arc::new(sequences),
            progress,
            access: ExclusiveAccess::new(),
            reporter: Arc::new(reporter),
            max_jobs: 1,
            dry_run: false,
        }
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.max(1);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run(&self, providers: Vec<Provider>) -> HarvestSummary {
        if self.dry_run {
            return self.preview(providers);
        }

        let slots = Arc::new(Semaphore::new(self.max_jobs));
        let mut tasks = JoinSet::new();
        let mut summary = HarvestSummary::default();

        for provider in providers {
            let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                tracing::error!("Worker pool closed");
                break;
            };
            let worker = ProviderWorker {
                provider,
                endpoint: self.endpoint.clone(),
                sequences: Arc::clone(&self.sequences),
                progress: Arc::clone(&self.progress),
                access: self.access.clone(),
                reporter: Arc::clone(&self.reporter),
            };
            tasks.spawn(async move {
                let report = worker.run().await;
                drop(permit);
                report
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => summary.reports.push(report),
                Err(e) => tracing::error!(error = %e, "Provider task aborted"),
            }
        }
        summary
    }

    fn preview(&self, providers: Vec<Provider>) -> HarvestSummary {
        let mut summary = HarvestSummary::default();
        for provider in providers {
            let progress = self.progress.peek(&provider.base_url, &provider.group);
            let status = match skip_reason(&self.progress, &progress) {
                Some(reason) => {
                    self.reporter.report(HarvestEvent::Skipped {
                        provider: provider.name(),
                        reason,
                    });
                    ProviderStatus::Skipped
                }
                None => {
                    self.reporter.report(HarvestEvent::WouldHarvest {
                        provider: provider.name(),
                        scenario: provider.scenario.unwrap_or(progress.scenario),
                        from: from_date(&self.progress, &provider, &progress),
                    });
                    ProviderStatus::Harvested
                }
            };
            summary.reports.push(ProviderReport {
                provider: provider.name().to_string(),
                status,
                delivered: 0,
            });
        }
        summary
    }
}

fn skip_reason(store: &ProgressStore, progress: &EndpointProgress) -> Option<&'static str> {
    if store.should_harvest(progress) {
        return None;
    }
    Some(match store.properties().mode {
        HarvestMode::Retry => "last attempt succeeded",
        HarvestMode::Normal | HarvestMode::Refresh => "blocked",
    })
}

fn from_date(
    store: &ProgressStore,
    provider: &Provider,
    progress: &EndpointProgress,
) -> Option<NaiveDate> {
    if provider.incremental {
        store.request_from_date(progress)
    } else {
        None
    }
}

/// Harvests a single provider.
struct ProviderWorker<E, R> {
    provider: Provider,
    endpoint: E,
    sequences: Arc<Vec<ActionSequence>>,
    progress: Arc<ProgressStore>,
    access: ExclusiveAccess,
    reporter: Arc<R>,
}

impl<E: OaiEndpoint, R: HarvestReporter> ProviderWorker<E, R> {
    async fn run(mut self) -> ProviderReport {
        let uri = self.provider.base_url.clone();
        let group = self.provider.group.clone();

        let progress = match self.progress.next(&uri, &group) {
            Ok(progress) => progress,
            Err(e) => {
                tracing::error!(provider = %uri, error = %e, "Cannot read endpoint progress");
                return self.report(ProviderStatus::Failed, 0);
            }
        };
        if let Some(reason) = skip_reason(&self.progress, &progress) {
            self.reporter.report(HarvestEvent::Skipped {
                provider: self.provider.name(),
                reason,
            });
            return self.report(ProviderStatus::Skipped, 0);
        }

        self.provider.init(&self.endpoint).await;
        let scenario = self.provider.scenario.unwrap_or(progress.scenario);
        let from = from_date(&self.progress, &self.provider, &progress);
        self.reporter.report(HarvestEvent::Started {
            provider: self.provider.name(),
            scenario,
            from,
        });

        let (success, delivered) = self.harvest(scenario, from).await;

        let bookkeeping = self
            .progress
            .record_outcome(&uri, &group, success)
            .and_then(|_| self.progress.set_increment(&uri, &group, delivered as u64))
            .and_then(|_| {
                self.progress
                    .set_count(&uri, &group, progress.count + delivered as u64)
            });
        let success = match bookkeeping {
            Ok(_) => success,
            Err(e) => {
                tracing::error!(provider = %self.provider.name(), error = %e, "Cannot record progress");
                false
            }
        };

        self.reporter.report(HarvestEvent::Finished {
            provider: self.provider.name(),
            success,
            delivered,
        });
        let status = if success {
            ProviderStatus::Harvested
        } else {
            ProviderStatus::Failed
        };
        self.report(status, delivered)
    }

    /// Tries the action sequences in order until one completes.
    ///
    /// Sequences whose format the provider does not offer are passed over.
    /// The run succeeds when a sequence completed, or when none applied and
    /// none failed.
    async fn harvest(&self, kind: ScenarioKind, from: Option<NaiveDate>) -> (bool, usize) {
        let name = self.provider.name();
        let mut delivered = 0;
        let mut failed = false;

        for sequence in self.sequences.iter() {
            let _access = self.access.acquire(self.provider.exclusive).await;
            let mut scenario = Scenario::new(&self.provider, &self.endpoint, sequence);

            let result = match scenario.get_prefixes().await {
                Ok(prefixes) => {
                    self.reporter.report(HarvestEvent::PrefixesResolved {
                        provider: name,
                        sequence,
                        prefixes: &prefixes,
                    });
                    if prefixes.is_empty() {
                        continue;
                    }
                    scenario.run(kind, prefixes, from).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => {
                    delivered += outcome.delivered;
                    self.reporter.report(HarvestEvent::ScenarioFinished {
                        provider: name,
                        outcome: &outcome,
                    });
                    if outcome.is_done() {
                        return (true, delivered);
                    }
                    failed = true;
                }
                Err(e) => {
                    failed = true;
                    self.reporter.report(HarvestEvent::ScenarioFailed {
                        provider: name,
                        error: &e.to_string(),
                    });
                    if e.is_provider_fatal() || matches!(e, AppError::ProtocolError(_)) {
                        break;
                    }
                }
            }
        }
        (!failed, delivered)
    }

    fn report(&self, status: ProviderStatus, delivered: usize) -> ProviderReport {
        ProviderReport {
            provider: self.provider.name().to_string(),
            status,
            delivered,
        }
    }
}
