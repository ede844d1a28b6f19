//! Links from the published index layout (`plugins/`, `features/`) to the
//! physical artifact files.

use tracing::{debug, trace};

use crate::error::AggregatorError;
use crate::model::{IndexOperation, InstallableArtifact, RepoPath};
use crate::store::{ArtifactStore, StoreItem};

/// Points `link` at `target`, replacing any existing link or file.
pub fn create_link(
    store: &dyn ArtifactStore,
    target: &StoreItem,
    link: &RepoPath,
) -> Result<(), AggregatorError> {
    store.create_link(link, target)?;
    trace!(link = %link, target = %target.path, "created link");
    Ok(())
}

/// Removes `link`. Returns whether it existed.
pub fn delete_link(store: &dyn ArtifactStore, link: &RepoPath) -> Result<bool, AggregatorError> {
    let existed = store.delete(link)?;
    if existed {
        trace!(link = %link, "deleted link");
    } else {
        trace!(link = %link, "link already absent");
    }
    Ok(existed)
}

/// Applies link maintenance for every artifact of a fragment.
///
/// Merges need the resolved physical artifact; removes only drop the link. Artifacts
/// whose classifier is not linked are skipped. Returns the number of links touched.
pub fn maintain(
    store: &dyn ArtifactStore,
    index_root: &RepoPath,
    operation: IndexOperation,
    artifacts: &[InstallableArtifact],
    physical: Option<&StoreItem>,
) -> Result<usize, AggregatorError> {
    let mut touched = 0;
    for artifact in artifacts {
        let Some(link) = artifact.link_path(index_root) else {
            debug!(
                id = %artifact.id,
                classifier = artifact.classifier.as_str(),
                "classifier is not linked"
            );
            continue;
        };
        let link = link?;
        match (operation, physical) {
            (IndexOperation::Merge, Some(target)) => create_link(store, target, &link)?,
            (IndexOperation::Merge, None) => continue,
            (IndexOperation::Remove, _) => {
                delete_link(store, &link)?;
            }
        }
        touched += 1;
    }
    Ok(touched)
}
