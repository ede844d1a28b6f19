//! Process-local scratch space for one aggregation transaction.
//!
//! The exposed index is copied into `index/`, rewritten there by the toolkit and only
//! then put back over the exposed files. Dropping the area removes the whole tree,
//! whichever way the transaction ended.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::trace;

use crate::error::AggregatorError;
use crate::model::{DescriptorKind, RepoPath};
use crate::store::{ArtifactStore, guess_content_type};

const STAGING_PREFIX: &str = "p2-aggregate-";
const FRAGMENT_PREFIX: &str = "fragment-";
const INDEX_DIR: &str = "index";

#[derive(Debug)]
pub struct StagingArea {
    root: TempDir,
    index_dir: PathBuf,
}

impl StagingArea {
    /// Creates the area under `parent`, or the system temp directory when `None`.
    pub fn create(parent: Option<&Path>) -> Result<Self, AggregatorError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGING_PREFIX);
        let root = match parent {
            Some(parent) => {
                fs::create_dir_all(parent).map_err(AggregatorError::Staging)?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        }
        .map_err(AggregatorError::Staging)?;

        let index_dir = root.path().join(INDEX_DIR);
        fs::create_dir(&index_dir).map_err(AggregatorError::Staging)?;
        trace!(staging = %root.path().display(), "created staging area");
        Ok(Self { root, index_dir })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Working copy of the aggregate index.
    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// Fresh directory for a single fragment, removed when the returned guard drops.
    pub fn fragment_dir(&self) -> Result<TempDir, AggregatorError> {
        tempfile::Builder::new()
            .prefix(FRAGMENT_PREFIX)
            .tempdir_in(self.root.path())
            .map_err(AggregatorError::Staging)
    }

    /// Copies the exposed `kind` file under `index_root` into the working copy.
    pub fn stage(
        &self,
        store: &dyn ArtifactStore,
        index_root: &RepoPath,
        kind: DescriptorKind,
    ) -> Result<(), AggregatorError> {
        let exposed = index_root.join(kind.file_name())?;
        let bytes = store
            .get(&exposed)?
            .ok_or_else(|| AggregatorError::IndexMissing(exposed.clone()))?;
        fs::write(self.index_dir.join(kind.file_name()), bytes).map_err(AggregatorError::Staging)?;
        trace!(index = %exposed, "staged index file");
        Ok(())
    }

    /// Replaces the exposed `kind` file with the working copy.
    pub fn swap_back(
        &self,
        store: &dyn ArtifactStore,
        index_root: &RepoPath,
        kind: DescriptorKind,
    ) -> Result<(), AggregatorError> {
        let exposed = index_root.join(kind.file_name())?;
        let bytes =
            fs::read(self.index_dir.join(kind.file_name())).map_err(AggregatorError::Staging)?;
        store.put(&exposed, &bytes, guess_content_type(&exposed))?;
        trace!(index = %exposed, bytes = bytes.len(), "swapped index file");
        Ok(())
    }
}
