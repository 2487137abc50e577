pub mod access;
pub mod action;
pub mod config;
pub mod cycle;
pub mod dedup;
pub mod error;
pub mod harvesting;
pub mod models;
pub mod oai;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod scenario;
pub mod traits;
pub mod worker;
pub mod xml;

#[cfg(test)]
pub mod testutil;

pub use access::{AccessGuard, ExclusiveAccess};
pub use action::{Action, ActionSequence, SaveAction, SplitAction, StripAction};
pub use config::{HarvesterConfig, ProviderConfig, Settings};
pub use cycle::{CycleProperties, EndpointProgress, HarvestMode, ProgressStore};
pub use dedup::{DedupStore, IdPrefix};
pub use error::AppError;
pub use models::{FormatKind, MetadataFormat, MetadataRecord, Provider, RecordContent, ScenarioKind};
pub use oai::{OaiRequest, OaiResponse, OaiVersion, Verb};
pub use pool::ResourcePool;
pub use registry::{EndpointSets, ImportConfig, SetDefinition, parse_catalog};
pub use retry::RetryPolicy;
pub use scenario::{Scenario, ScenarioOutcome, ScenarioState};
pub use traits::OaiEndpoint;
pub use worker::{
    HarvestEvent, HarvestReporter, HarvestSummary, Harvester, ProviderReport, ProviderStatus,
    TracingHarvestReporter,
};
pub use xml::Element;
