//! Aggregation engine: keeps a repository's aggregate index in step with the module
//! fragments published into it.
//!
//! Every mutating operation runs the same transaction under the repository's index
//! lock: stage the exposed index, repair and apply the fragment, maintain links and
//! swap the staged file back. Failures never escape an operation; they are logged and
//! reported as [`Outcome::Failed`] with the exposed index left as it was.

mod rebuild;

pub use rebuild::{RebuildOutcome, RebuildSummary};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::AggregatorSettings;
use crate::error::{AggregatorError, StoreError};
use crate::header::prepare_fragment;
use crate::links;
use crate::metrics::AggregatorMetrics;
use crate::model::{DEFAULT_INDEX_ROOT, DescriptorKind, Fragment, IndexOperation, RepoPath};
use crate::registry::{AggregatorConfiguration, AggregatorConfigurations, RepositoryRegistry};
use crate::staging::StagingArea;
use crate::store::{ArtifactStore, LockMode, StoreItem, guess_content_type};
use crate::toolkit::{DescriptorToolkit, SimpleDescriptorToolkit};

/// Result of a mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Aggregation is not enabled for the repository; nothing was touched.
    Disabled,
    Applied,
    /// The operation was aborted and logged; the exposed index is unchanged.
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Disabled => "disabled",
            Outcome::Applied => "applied",
            Outcome::Failed => "failed",
        }
    }
}

pub struct Aggregator {
    registry: Arc<dyn RepositoryRegistry>,
    configurations: Arc<AggregatorConfigurations>,
    toolkit: Arc<dyn DescriptorToolkit>,
    metrics: Arc<AggregatorMetrics>,
    index_root: RepoPath,
    staging_dir: Option<PathBuf>,
}

impl Aggregator {
    pub fn new(
        registry: Arc<dyn RepositoryRegistry>,
        configurations: Arc<AggregatorConfigurations>,
        toolkit: Arc<dyn DescriptorToolkit>,
    ) -> Self {
        Self {
            registry,
            configurations,
            toolkit,
            metrics: Arc::new(AggregatorMetrics::new()),
            index_root: RepoPath::parse(DEFAULT_INDEX_ROOT).unwrap_or_else(|_| RepoPath::root()),
            staging_dir: None,
        }
    }

    /// Engine over the given registry using the built-in descriptor toolkit.
    pub fn from_settings(
        settings: &AggregatorSettings,
        registry: Arc<dyn RepositoryRegistry>,
        configurations: Arc<AggregatorConfigurations>,
    ) -> Self {
        Self::new(
            registry,
            configurations,
            Arc::new(SimpleDescriptorToolkit::new()),
        )
        .with_index_root(settings.index_root.clone())
        .with_staging_dir(settings.staging_dir.clone())
    }

    pub fn with_index_root(mut self, index_root: RepoPath) -> Self {
        self.index_root = index_root;
        self
    }

    pub fn with_staging_dir(mut self, staging_dir: Option<PathBuf>) -> Self {
        self.staging_dir = staging_dir;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AggregatorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn index_root(&self) -> &RepoPath {
        &self.index_root
    }

    pub fn configurations(&self) -> &Arc<AggregatorConfigurations> {
        &self.configurations
    }

    pub fn metrics(&self) -> &Arc<AggregatorMetrics> {
        &self.metrics
    }

    /// Enables aggregation and materializes an empty index when none exists yet.
    pub fn enable(&self, configuration: AggregatorConfiguration) -> Outcome {
        let repository_id = configuration.repository_id.clone();
        let started = Instant::now();
        self.configurations.enable(configuration);

        let result = self.store(&repository_id).and_then(|store| {
            let _guard = store.lock(&self.index_root, LockMode::Create);
            // a disable may have slipped in before the lock was granted
            if !self.is_enabled(&repository_id) {
                return Ok(Outcome::Disabled);
            }
            self.ensure_index(store.as_ref()).map(|_| Outcome::Applied)
        });
        self.finish(&repository_id, "enable", &self.index_root, result, started)
    }

    /// Disables aggregation and deletes the whole index subtree.
    pub fn disable(&self, repository_id: &str) -> Outcome {
        let started = Instant::now();
        if self.configurations.disable(repository_id).is_none() {
            warn!(repository = %repository_id, "aggregation was not enabled for repository");
            self.metrics
                .record_operation(repository_id, "disable", "disabled", started.elapsed());
            return Outcome::Disabled;
        }

        let result = self.store(repository_id).and_then(|store| {
            let _guard = store.lock(&self.index_root, LockMode::Delete);
            if self.is_enabled(repository_id) {
                debug!(repository = %repository_id, "re-enabled while waiting for the index lock, keeping index");
                return Ok(Outcome::Applied);
            }
            let existed = store.delete(&self.index_root)?;
            debug!(repository = %repository_id, index = %self.index_root, existed, "deleted aggregate index");
            Ok(Outcome::Applied)
        });
        self.finish(repository_id, "disable", &self.index_root, result, started)
    }

    pub fn is_enabled(&self, repository_id: &str) -> bool {
        self.configurations.is_enabled(repository_id)
    }

    pub fn update_artifacts(&self, fragment: &Fragment) -> Outcome {
        self.apply(DescriptorKind::Artifacts, IndexOperation::Merge, fragment)
    }

    pub fn remove_artifacts(&self, fragment: &Fragment) -> Outcome {
        self.apply(DescriptorKind::Artifacts, IndexOperation::Remove, fragment)
    }

    pub fn update_metadata(&self, fragment: &Fragment) -> Outcome {
        self.apply(DescriptorKind::Metadata, IndexOperation::Merge, fragment)
    }

    pub fn remove_metadata(&self, fragment: &Fragment) -> Outcome {
        self.apply(DescriptorKind::Metadata, IndexOperation::Remove, fragment)
    }

    /// Reads an exposed index file, materializing the index if it is absent.
    ///
    /// Returns `Ok(None)` when aggregation is disabled for the repository.
    pub fn read_index(
        &self,
        repository_id: &str,
        kind: DescriptorKind,
    ) -> Result<Option<Vec<u8>>, AggregatorError> {
        if !self.is_enabled(repository_id) {
            return Ok(None);
        }
        let store = self.store(repository_id)?;
        let exposed = self.index_root.join(kind.file_name())?;

        {
            let _guard = store.lock(&self.index_root, LockMode::Read);
            if let Some(bytes) = store.get(&exposed)? {
                return Ok(Some(bytes));
            }
        }

        {
            let _guard = store.lock(&self.index_root, LockMode::Create);
            if !self.is_enabled(repository_id) {
                return Ok(None);
            }
            self.ensure_index(store.as_ref())?;
        }

        let _guard = store.lock(&self.index_root, LockMode::Read);
        store
            .get(&exposed)?
            .map(Some)
            .ok_or(AggregatorError::IndexMissing(exposed))
    }

    fn store(&self, repository_id: &str) -> Result<Arc<dyn ArtifactStore>, AggregatorError> {
        self.registry
            .repository(repository_id)
            .ok_or_else(|| AggregatorError::RepositoryUnavailable(repository_id.to_string()))
    }

    fn apply(&self, kind: DescriptorKind, operation: IndexOperation, fragment: &Fragment) -> Outcome {
        let name = operation_name(kind, operation);
        let started = Instant::now();
        if !self.is_enabled(&fragment.repository_id) {
            trace!(
                repository = %fragment.repository_id,
                fragment = %fragment.path,
                operation = name,
                "aggregation disabled, ignoring fragment"
            );
            self.metrics.record_operation(
                &fragment.repository_id,
                name,
                Outcome::Disabled.as_str(),
                started.elapsed(),
            );
            return Outcome::Disabled;
        }

        let result = self.try_apply(kind, operation, fragment);
        let outcome = self.finish(&fragment.repository_id, name, &fragment.path, result, started);
        if outcome == Outcome::Disabled {
            trace!(
                repository = %fragment.repository_id,
                fragment = %fragment.path,
                operation = name,
                "aggregation disabled while waiting for the index lock"
            );
        }
        if outcome == Outcome::Applied {
            debug!(
                repository = %fragment.repository_id,
                fragment = %fragment.path,
                operation = name,
                "aggregate index updated"
            );
        }
        outcome
    }

    #[instrument(
        level = "debug",
        skip(self, fragment),
        fields(repository = %fragment.repository_id, fragment = %fragment.path)
    )]
    fn try_apply(
        &self,
        kind: DescriptorKind,
        operation: IndexOperation,
        fragment: &Fragment,
    ) -> Result<Outcome, AggregatorError> {
        let store = self.store(&fragment.repository_id)?;
        let store = store.as_ref();

        let _guard = store.lock(&self.index_root, LockMode::Update);
        // the enabled check in `apply` ran unlocked; a disable may have deleted the
        // index since then and must not be undone by `ensure_index`
        if !self.is_enabled(&fragment.repository_id) {
            return Ok(Outcome::Disabled);
        }
        let content = match fragment.content.as_ref() {
            Some(content) => content.clone(),
            None => store
                .get(&fragment.path)?
                .ok_or_else(|| AggregatorError::FragmentNotFound(fragment.path.clone()))?,
        };

        self.ensure_index(store)?;
        let staging = StagingArea::create(self.staging_dir.as_deref())?;
        staging.stage(store, &self.index_root, kind)?;
        self.process_fragment(store, &staging, kind, operation, fragment, &content)?;
        staging.swap_back(store, &self.index_root, kind)?;
        Ok(Outcome::Applied)
    }

    /// Repairs, applies and links one fragment against the staged index.
    fn process_fragment(
        &self,
        store: &dyn ArtifactStore,
        staging: &StagingArea,
        kind: DescriptorKind,
        operation: IndexOperation,
        fragment: &Fragment,
        content: &[u8],
    ) -> Result<usize, AggregatorError> {
        let physical = match (kind, operation) {
            (DescriptorKind::Artifacts, IndexOperation::Merge) => {
                Some(self.resolve_physical_artifact(store, fragment)?)
            }
            _ => None,
        };

        let fragment_dir = staging.fragment_dir()?;
        let prepared = prepare_fragment(kind, content, fragment_dir.path())?;
        if prepared.repaired {
            debug!(fragment = %fragment.path, "fragment header repaired");
        }

        self.toolkit
            .apply(operation, fragment_dir.path(), staging.index_dir())?;

        if kind != DescriptorKind::Artifacts {
            return Ok(0);
        }
        let artifacts = self.toolkit.installable_artifacts(fragment_dir.path())?;
        links::maintain(
            store,
            &self.index_root,
            operation,
            &artifacts,
            physical.as_ref(),
        )
    }

    fn resolve_physical_artifact(
        &self,
        store: &dyn ArtifactStore,
        fragment: &Fragment,
    ) -> Result<StoreItem, AggregatorError> {
        let path = fragment.physical_artifact_path()?;
        store
            .lookup(&path)?
            .ok_or_else(|| AggregatorError::Store(StoreError::NotFound(path)))
    }

    /// Writes an empty index file for each kind that is missing. Caller holds the
    /// index lock. Returns whether anything was created.
    fn ensure_index(&self, store: &dyn ArtifactStore) -> Result<bool, AggregatorError> {
        let mut missing = Vec::new();
        for kind in DescriptorKind::ALL {
            let exposed = self.index_root.join(kind.file_name())?;
            if store.lookup(&exposed)?.is_none() {
                missing.push((kind, exposed));
            }
        }
        if missing.is_empty() {
            return Ok(false);
        }

        let scratch = StagingArea::create(self.staging_dir.as_deref())?;
        self.toolkit.write_empty(scratch.index_dir(), store.id())?;
        for (kind, exposed) in &missing {
            let bytes = std::fs::read(scratch.index_dir().join(kind.file_name()))
                .map_err(AggregatorError::Staging)?;
            store.put(exposed, &bytes, guess_content_type(exposed))?;
        }
        info!(
            repository = %store.id(),
            index = %self.index_root,
            files = missing.len(),
            "materialized empty aggregate index"
        );
        Ok(true)
    }

    fn finish(
        &self,
        repository_id: &str,
        operation: &str,
        trigger: &RepoPath,
        result: Result<Outcome, AggregatorError>,
        started: Instant,
    ) -> Outcome {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.report_failure(repository_id, operation, trigger, &err);
                Outcome::Failed
            }
        };
        self.metrics
            .record_operation(repository_id, operation, outcome.as_str(), started.elapsed());
        outcome
    }

    fn report_failure(
        &self,
        repository_id: &str,
        operation: &str,
        trigger: &RepoPath,
        err: &AggregatorError,
    ) {
        warn!(
            repository = %repository_id,
            index = %self.index_root,
            fragment = %trigger,
            operation,
            error = %err,
            "could not maintain aggregate index"
        );
        if err.is_malformed_input() {
            debug!(repository = %repository_id, fragment = %trigger, error = ?err, "fragment rejected");
        }
        self.metrics.record_failure(repository_id, err.category());
    }
}

fn operation_name(kind: DescriptorKind, operation: IndexOperation) -> &'static str {
    match (kind, operation) {
        (DescriptorKind::Artifacts, IndexOperation::Merge) => "update_artifacts",
        (DescriptorKind::Artifacts, IndexOperation::Remove) => "remove_artifacts",
        (DescriptorKind::Metadata, IndexOperation::Merge) => "update_metadata",
        (DescriptorKind::Metadata, IndexOperation::Remove) => "remove_metadata",
    }
}
