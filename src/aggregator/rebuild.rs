//! Scan-and-rebuild: folds every fragment found in storage into the aggregate index.

use std::time::Instant;
use tracing::{debug, info, warn};

use super::{Aggregator, Outcome};
use crate::error::AggregatorError;
use crate::model::{DescriptorKind, Fragment, IndexOperation, RepoPath};
use crate::staging::StagingArea;
use crate::store::{ArtifactStore, LockMode};

const OPERATION: &str = "rebuild";

/// Counters of a completed rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    pub artifact_fragments: usize,
    pub metadata_fragments: usize,
    pub failed: usize,
    pub links: usize,
}

impl RebuildSummary {
    pub fn applied(&self) -> usize {
        self.artifact_fragments + self.metadata_fragments
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildOutcome {
    Disabled,
    /// Nothing was swapped; the exposed index is unchanged.
    Aborted,
    Completed(RebuildSummary),
}

impl RebuildOutcome {
    fn label(&self) -> &'static str {
        match self {
            RebuildOutcome::Disabled => Outcome::Disabled.as_str(),
            RebuildOutcome::Aborted => "aborted",
            RebuildOutcome::Completed(_) => "completed",
        }
    }
}

impl Aggregator {
    /// Rebuilds one repository's index under a single lock and staging area.
    pub fn scan_and_rebuild(&self, repository_id: &str) -> RebuildOutcome {
        let started = Instant::now();
        let outcome = if self.is_enabled(repository_id) {
            match self.try_rebuild(repository_id) {
                Ok(None) => {
                    debug!(repository = %repository_id, "aggregation disabled while waiting for the index lock");
                    RebuildOutcome::Disabled
                }
                Ok(Some(summary)) => {
                    info!(
                        repository = %repository_id,
                        applied = summary.applied(),
                        failed = summary.failed,
                        links = summary.links,
                        "aggregate index rebuilt"
                    );
                    self.metrics
                        .record_rebuild_fragments(repository_id, summary.applied(), summary.failed);
                    RebuildOutcome::Completed(summary)
                }
                Err(err) => {
                    self.report_failure(repository_id, OPERATION, &self.index_root, &err);
                    RebuildOutcome::Aborted
                }
            }
        } else {
            debug!(repository = %repository_id, "aggregation disabled, skipping rebuild");
            RebuildOutcome::Disabled
        };
        self.metrics
            .record_operation(repository_id, OPERATION, outcome.label(), started.elapsed());
        outcome
    }

    /// Rebuilds every enabled repository in lexicographic order.
    pub fn scan_and_rebuild_all(&self) -> Vec<(String, RebuildOutcome)> {
        self.configurations
            .repository_ids()
            .into_iter()
            .map(|id| {
                let outcome = self.scan_and_rebuild(&id);
                (id, outcome)
            })
            .collect()
    }

    /// `Ok(None)` when aggregation was disabled before the lock was granted.
    fn try_rebuild(&self, repository_id: &str) -> Result<Option<RebuildSummary>, AggregatorError> {
        let store = self.store(repository_id)?;
        let store = store.as_ref();

        let _guard = store.lock(&self.index_root, LockMode::Update);
        if !self.is_enabled(repository_id) {
            return Ok(None);
        }
        let paths = store.list_tree()?;

        self.ensure_index(store)?;
        let staging = StagingArea::create(self.staging_dir.as_deref())?;
        for kind in DescriptorKind::ALL {
            staging.stage(store, &self.index_root, kind)?;
        }

        let mut summary = RebuildSummary::default();
        for path in paths.iter().filter(|path| !path.is_hidden()) {
            let Some(kind) = DescriptorKind::classify(path) else {
                continue;
            };
            match self.rebuild_fragment(store, &staging, kind, path) {
                Ok(links) => {
                    summary.links += links;
                    match kind {
                        DescriptorKind::Artifacts => summary.artifact_fragments += 1,
                        DescriptorKind::Metadata => summary.metadata_fragments += 1,
                    }
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        repository = %repository_id,
                        index = %self.index_root,
                        fragment = %path,
                        error = %err,
                        "skipping fragment during rebuild"
                    );
                }
            }
        }

        for kind in DescriptorKind::ALL {
            staging.swap_back(store, &self.index_root, kind)?;
        }
        Ok(Some(summary))
    }

    fn rebuild_fragment(
        &self,
        store: &dyn ArtifactStore,
        staging: &StagingArea,
        kind: DescriptorKind,
        path: &RepoPath,
    ) -> Result<usize, AggregatorError> {
        let content = store
            .get(path)?
            .ok_or_else(|| AggregatorError::FragmentNotFound(path.clone()))?;
        let fragment = Fragment::stored(store.id(), path.clone());
        self.process_fragment(
            store,
            staging,
            kind,
            IndexOperation::Merge,
            &fragment,
            &content,
        )
    }
}
