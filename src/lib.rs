pub mod aggregator;
pub mod config;
pub mod error;
pub mod events;
pub mod header;
pub mod links;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod staging;
pub mod store;
pub mod toolkit;

pub use aggregator::{Aggregator, Outcome, RebuildOutcome, RebuildSummary};
pub use config::{AggregatorSettings, CliArgs, Command, RepositorySettings};
pub use error::{AggregatorError, StoreError, ToolkitError};
pub use events::{EventInspector, EventRouter, StoreEvent, StoreEventKind};
pub use logging::{LoggingConfig, init_logging};
pub use model::{DescriptorKind, Fragment, IndexOperation, RepoPath};
pub use registry::{
    AggregatorConfiguration, AggregatorConfigurations, RepositoryRegistry, StoreRegistry,
};
pub use store::{ArtifactStore, FsStore, LockMode};
pub use toolkit::{DescriptorToolkit, SimpleDescriptorToolkit};

use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::task;
use tracing::Instrument;

/// Builds the engine for `settings` and enables every aggregating repository.
pub fn build_aggregator(settings: &AggregatorSettings) -> Result<Arc<Aggregator>> {
    let registry = Arc::new(StoreRegistry::from_settings(settings));
    let configurations = Arc::new(AggregatorConfigurations::new());
    let aggregator = Arc::new(Aggregator::from_settings(
        settings,
        registry,
        configurations,
    ));

    for configuration in AggregatorConfiguration::from_settings(settings)? {
        let repository_id = configuration.repository_id.clone();
        if aggregator.enable(configuration) == Outcome::Failed {
            tracing::warn!(repository = %repository_id, "index could not be materialized on enable");
        }
    }
    Ok(aggregator)
}

pub async fn run(settings: AggregatorSettings, command: Command) -> Result<()> {
    let started = Instant::now();
    let aggregator = build_aggregator(&settings)?;

    tracing::info!(
        index_root = %settings.index_root,
        repositories = settings.repositories.len(),
        "starting p2 aggregator",
    );

    match command {
        Command::Rebuild { repository } => {
            let results = match repository {
                Some(id) => {
                    anyhow::ensure!(
                        settings.repository(&id).is_some(),
                        "repository {id:?} is not configured"
                    );
                    let span = logging::repository_span("rebuild", &id);
                    let aggregator = aggregator.clone();
                    task::spawn_blocking(move || {
                        let outcome = aggregator.scan_and_rebuild(&id);
                        vec![(id, outcome)]
                    })
                    .instrument(span)
                    .await?
                }
                None => {
                    let aggregator = aggregator.clone();
                    task::spawn_blocking(move || aggregator.scan_and_rebuild_all()).await?
                }
            };

            let mut aborted = Vec::new();
            for (repository_id, outcome) in results {
                match outcome {
                    RebuildOutcome::Completed(summary) => tracing::info!(
                        repository = %repository_id,
                        artifacts = summary.artifact_fragments,
                        metadata = summary.metadata_fragments,
                        failed = summary.failed,
                        "rebuild completed"
                    ),
                    RebuildOutcome::Disabled => tracing::info!(
                        repository = %repository_id,
                        "aggregation disabled, rebuild skipped"
                    ),
                    RebuildOutcome::Aborted => aborted.push(repository_id),
                }
            }
            anyhow::ensure!(aborted.is_empty(), "rebuild aborted for {aborted:?}");
        }
        Command::Update { repository, path } => {
            apply_event(&aggregator, StoreEvent::stored(repository, RepoPath::parse(&path)?)).await?;
        }
        Command::Remove { repository, path } => {
            apply_event(&aggregator, StoreEvent::deleted(repository, RepoPath::parse(&path)?, None)).await?;
        }
    }

    crate::log_slow_operation!(started.elapsed(), 10_000, "command finished");
    tracing::debug!(metrics = %aggregator.metrics().encode(), "aggregator metrics");
    Ok(())
}

async fn apply_event(aggregator: &Arc<Aggregator>, event: StoreEvent) -> Result<()> {
    anyhow::ensure!(
        EventInspector::classify(&event).is_some(),
        "{} is not a p2 fragment",
        event.path
    );
    let span = logging::repository_span("apply", &event.repository_id);
    let inspector = Arc::new(EventInspector::new(aggregator.clone()));
    let router = EventRouter::spawn(inspector);
    let path = event.path.clone();
    let repository_id = event.repository_id.clone();
    anyhow::ensure!(router.publish(event).await, "event router is not running");
    router.shutdown().instrument(span).await;

    let failed: u64 = ["update_artifacts", "remove_artifacts", "update_metadata", "remove_metadata"]
        .iter()
        .map(|operation| {
            aggregator
                .metrics()
                .operation_count(&repository_id, operation, Outcome::Failed.as_str())
        })
        .sum();
    anyhow::ensure!(failed == 0, "could not apply {path} to the aggregate index of {repository_id:?}");
    Ok(())
}
