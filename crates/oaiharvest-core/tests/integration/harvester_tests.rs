//! Full harvest cycles: coordinator, progress store and scenarios together.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use oaiharvest_core::{
    ActionSequence, HarvestMode, Harvester, HarvesterConfig, MetadataFormat, OaiEndpoint,
    ProgressStore, Provider, ProviderStatus, ScenarioKind, StripAction, TracingHarvestReporter,
    Verb,
};
use tokio::time::Instant;

use super::common::{CollectingAction, DC_NAMESPACE, MockNetwork, Repository, TimedNetwork};

const A: &str = "http://a.example.org/oai";
const B: &str = "http://b.example.org/oai";
const C: &str = "http://c.example.org/oai";
const D: &str = "http://d.example.org/oai";

fn repository(url: &str) -> Repository {
    Repository::new(url)
        .named(&format!("Repository at {url}"))
        .format("oai_dc", DC_NAMESPACE)
        .record_dated(&format!("{url}/1"), "oai_dc", &[], "2019-06-01")
        .record_dated(&format!("{url}/2"), "oai_dc", &[], "2021-03-15")
}

fn harvester<E: OaiEndpoint + 'static>(
    network: &E,
    collector: &CollectingAction,
    store: &Arc<ProgressStore>,
) -> Harvester<E, TracingHarvestReporter> {
    let sequence = ActionSequence::new(
        MetadataFormat::prefix("oai_dc"),
        vec![Box::new(StripAction), Box::new(collector.clone())],
        2,
    );
    Harvester::new(
        network.clone(),
        vec![sequence],
        Arc::clone(store),
        TracingHarvestReporter,
    )
}

fn store_with(dir: &Path, overview: &str) -> Arc<ProgressStore> {
    let path = dir.join("overview.xml");
    std::fs::write(&path, overview).unwrap();
    Arc::new(ProgressStore::open(&path).unwrap())
}

#[tokio::test]
async fn test_incremental_request_starts_at_last_harvest() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        dir.path(),
        &format!(r#"<overview mode="normal"><endpoint uri="{A}" harvested="2020-01-01T00:00:00Z" attempted="2020-01-01T00:00:00Z"/></overview>"#),
    );
    let network = MockNetwork::new().with(repository(A));
    let collector = CollectingAction::new();

    let summary = harvester(&network, &collector, &store)
        .run(vec![Provider::new(A)])
        .await;
    assert_eq!(summary.harvested(), 1);

    let requests = network.requests_for(A, Verb::ListRecords);
    assert_eq!(requests[0].from, NaiveDate::from_ymd_opt(2020, 1, 1));
    assert!(requests[0].url().unwrap().as_str().contains("from=2020-01-01"));
    assert_eq!(collector.identifiers(), vec![format!("{A}/2")]);
}

#[tokio::test]
async fn test_non_incremental_endpoint_sends_no_from() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        dir.path(),
        &format!(r#"<overview><endpoint uri="{A}" incremental="false" harvested="2020-01-01T00:00:00Z"/></overview>"#),
    );
    let network = MockNetwork::new().with(repository(A));
    let collector = CollectingAction::new();

    harvester(&network, &collector, &store)
        .run(vec![Provider::new(A)])
        .await;

    let requests = network.requests_for(A, Verb::ListRecords);
    assert_eq!(requests[0].from, None);
    assert!(!requests[0].url().unwrap().as_str().contains("from="));
    assert_eq!(collector.identifiers().len(), 2);
}

#[tokio::test]
async fn test_retry_mode_only_revisits_failed_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        dir.path(),
        &format!(
            r#"<overview mode="retry">
                 <endpoint uri="{A}" attempted="2024-05-01T08:00:00Z" harvested="2024-05-01T08:00:00Z"/>
                 <endpoint uri="{B}" attempted="2024-05-01T08:00:00Z" harvested="2024-04-01T08:00:00Z"/>
               </overview>"#
        ),
    );
    assert_eq!(store.properties().mode, HarvestMode::Retry);
    let network = MockNetwork::new().with(repository(A)).with(repository(B));
    let collector = CollectingAction::new();

    let summary = harvester(&network, &collector, &store)
        .with_max_jobs(2)
        .run(vec![Provider::new(A), Provider::new(B)])
        .await;
    assert_eq!(summary.skipped(), 1);
    assert_eq!(summary.harvested(), 1);
    assert!(network.requests_for(A, Verb::ListRecords).is_empty());
    assert_eq!(network.requests_for(B, Verb::ListRecords).len(), 1);

    let b = store.peek(B, "");
    assert_eq!(b.attempted, b.harvested);
}

#[tokio::test]
async fn test_refresh_mode_uses_cycle_date_as_floor() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        dir.path(),
        &format!(r#"<overview mode="refresh" date="2021-01-01"><endpoint uri="{A}" harvested="2020-01-01T00:00:00Z"/></overview>"#),
    );
    let network = MockNetwork::new().with(repository(A));
    let collector = CollectingAction::new();

    harvester(&network, &collector, &store)
        .run(vec![Provider::new(A)])
        .await;
    let requests = network.requests_for(A, Verb::ListRecords);
    assert_eq!(requests[0].from, NaiveDate::from_ymd_opt(2021, 1, 1));
}

#[tokio::test]
async fn test_one_bad_provider_does_not_stop_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(dir.path(), "<overview/>");
    let network = MockNetwork::new().with(repository(A)).with(repository(B));
    let collector = CollectingAction::new();

    let summary = harvester(&network, &collector, &store)
        .with_max_jobs(2)
        .run(vec![
            Provider::new(A),
            Provider::new(C).exclusive(true),
            Provider::new(B),
        ])
        .await;
    assert_eq!(summary.reports.len(), 3);
    assert_eq!(summary.harvested(), 2);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.delivered(), 4);

    let failed = summary
        .reports
        .iter()
        .find(|r| r.status == ProviderStatus::Failed)
        .unwrap();
    assert_eq!(failed.provider, "c.example.org");

    let c = store.peek(C, "");
    assert!(c.attempted.is_some());
    assert!(c.harvested.is_none());
    assert_eq!(store.endpoints().len(), 3);
}

#[tokio::test]
async fn test_provider_name_comes_from_identify() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(dir.path(), "<overview/>");
    let network = MockNetwork::new().with(repository(A));
    let collector = CollectingAction::new();

    let summary = harvester(&network, &collector, &store)
        .run(vec![Provider::new(A)])
        .await;
    assert_eq!(summary.reports[0].provider, format!("Repository at {A}"));
    assert!(
        collector
            .records()
            .iter()
            .all(|r| r.origin == format!("Repository at {A}"))
    );
}

#[tokio::test]
async fn test_scenario_comes_from_progress_unless_overridden() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(
        dir.path(),
        &format!(
            r#"<overview scenario="ListIdentifiers">
                 <endpoint uri="{B}" scenario="ListRecords"/>
               </overview>"#
        ),
    );
    let network = MockNetwork::new().with(repository(A)).with(repository(B));
    let collector = CollectingAction::new();

    harvester(&network, &collector, &store)
        .run(vec![
            Provider::new(A),
            Provider::new(B).with_scenario(Some(ScenarioKind::ListIdentifiers)),
        ])
        .await;

    assert_eq!(network.requests_for(A, Verb::GetRecord).len(), 2);
    assert_eq!(network.requests_for(B, Verb::GetRecord).len(), 2);
    assert!(network.requests_for(B, Verb::ListRecords).is_empty());
    assert_eq!(store.peek(A, "").scenario, ScenarioKind::ListIdentifiers);
}

#[tokio::test]
async fn test_counts_accumulate_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(dir.path(), "<overview/>");
    let network = MockNetwork::new().with(repository(A));
    let collector = CollectingAction::new();
    let harvester = harvester(&network, &collector, &store);

    harvester.run(vec![Provider::new(A).incremental(false)]).await;
    harvester.run(vec![Provider::new(A).incremental(false)]).await;

    let reloaded = ProgressStore::open(store.path()).unwrap();
    let progress = reloaded.peek(A, "");
    assert_eq!(progress.count, 4);
    assert_eq!(progress.increment, 2);
}

#[tokio::test]
async fn test_settings_scenario_drives_new_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let config = HarvesterConfig::from_toml_str(&format!(
        "[settings]\nscenario = \"ListIdentifiers\"\n\n[[providers]]\nurl = \"{A}\"\n"
    ))
    .unwrap();
    let store = Arc::new(
        config
            .progress_store(Some(&dir.path().join("overview.xml")))
            .unwrap(),
    );
    let network = MockNetwork::new().with(repository(A));
    let collector = CollectingAction::new();

    let summary = harvester(&network, &collector, &store)
        .run(config.providers())
        .await;
    assert_eq!(summary.harvested(), 1);
    assert_eq!(network.requests_for(A, Verb::ListIdentifiers).len(), 1);
    assert_eq!(network.requests_for(A, Verb::GetRecord).len(), 2);
    assert!(network.requests_for(A, Verb::ListRecords).is_empty());

    let reloaded = ProgressStore::open(store.path()).unwrap();
    assert_eq!(reloaded.peek(A, "").scenario, ScenarioKind::ListIdentifiers);
}

#[tokio::test]
async fn test_static_provider_fetches_its_document_once() {
    let url = "http://static.example.org/repository.xml";
    let document = format!(
        r#"<Repository xmlns="http://www.openarchives.org/OAI/2.0/static-repository"
                       xmlns:oai="http://www.openarchives.org/OAI/2.0/">
             <Identify><oai:repositoryName>Static Archive</oai:repositoryName></Identify>
             <ListMetadataFormats>
               <oai:metadataFormat><oai:metadataPrefix>oai_dc</oai:metadataPrefix><oai:metadataNamespace>{DC_NAMESPACE}</oai:metadataNamespace></oai:metadataFormat>
             </ListMetadataFormats>
             <ListRecords metadataPrefix="oai_dc">
               <oai:record><oai:header><oai:identifier>oai:static:1</oai:identifier></oai:header>
                 <oai:metadata><dc xmlns="{DC_NAMESPACE}"/></oai:metadata></oai:record>
             </ListRecords>
           </Repository>"#
    );
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(dir.path(), "<overview/>");
    let network = MockNetwork::new().with_document(url, &document);
    let collector = CollectingAction::new();

    let summary = harvester(&network, &collector, &store)
        .run(vec![Provider::new(url).static_repository(true)])
        .await;
    assert_eq!(summary.harvested(), 1);
    assert_eq!(summary.reports[0].provider, "Static Archive");
    assert_eq!(collector.identifiers(), vec!["oai:static:1"]);
    assert!(network.requests().is_empty());
    assert_eq!(network.fetches(), vec![url.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_max_jobs_bounds_concurrent_providers() {
    let urls: Vec<String> = (1..=5)
        .map(|n| format!("http://p{n}.example.org/oai"))
        .collect();
    let mut inner = MockNetwork::new();
    for url in &urls {
        inner = inner.with(repository(url));
    }
    let network = TimedNetwork::new(inner, Duration::from_millis(100));
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(dir.path(), "<overview/>");
    let collector = CollectingAction::new();

    let started = Instant::now();
    let summary = harvester(&network, &collector, &store)
        .with_max_jobs(2)
        .run(urls.iter().map(|url| Provider::new(url)).collect())
        .await;

    assert_eq!(summary.harvested(), 5);
    assert_eq!(network.peak(), 2);
    // Identify, ListMetadataFormats and ListRecords per provider, three waves
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test(start_paused = true)]
async fn test_exclusive_provider_runs_alone() {
    let inner = MockNetwork::new()
        .with(repository(A))
        .with(repository(B))
        .with(repository(C))
        .with(repository(D));
    let network = TimedNetwork::new(inner, Duration::from_millis(100));
    let dir = tempfile::tempdir().unwrap();
    let store = store_with(dir.path(), "<overview/>");
    let collector = CollectingAction::new();

    let summary = harvester(&network, &collector, &store)
        .with_max_jobs(4)
        .run(vec![
            Provider::new(A),
            Provider::new(B).exclusive(true),
            Provider::new(C),
            Provider::new(D),
        ])
        .await;
    assert_eq!(summary.harvested(), 4);
    assert!(network.peak() >= 2);

    // Identify happens before any sequence takes the lock
    let calls: Vec<_> = network
        .calls()
        .into_iter()
        .filter(|c| c.verb != Verb::Identify)
        .collect();
    let exclusive: Vec<_> = calls.iter().filter(|c| c.base_url == B).collect();
    assert!(!exclusive.is_empty());
    let start = exclusive.iter().map(|c| c.start).min().unwrap();
    let end = exclusive.iter().map(|c| c.end).max().unwrap();

    let others: Vec<_> = calls.iter().filter(|c| c.base_url != B).collect();
    assert_eq!(others.len(), 6);
    assert!(others.iter().all(|c| !c.overlaps(start, end)));
}
