//! Descriptor toolkit: merges, subtracts and inspects repository descriptor pairs
//! stored in a plain directory layout (`artifacts.xml` + `content.xml`).

mod simple;
pub mod xml;

pub use simple::SimpleDescriptorToolkit;

use std::path::Path;

use crate::error::ToolkitError;
use crate::model::{IndexOperation, InstallableArtifact};

pub trait DescriptorToolkit: Send + Sync {
    /// Writes an empty descriptor pair owned by `owner_id` into `dir`.
    fn write_empty(&self, dir: &Path, owner_id: &str) -> Result<(), ToolkitError>;

    /// Folds every descriptor found in `fragment_dir` into the matching descriptor
    /// in `dest_dir`, in place.
    fn merge(&self, fragment_dir: &Path, dest_dir: &Path) -> Result<(), ToolkitError>;

    /// Drops the entries described in `fragment_dir` from `dest_dir`, in place.
    fn remove(&self, fragment_dir: &Path, dest_dir: &Path) -> Result<(), ToolkitError>;

    /// Artifacts described by the artifacts descriptor in `fragment_dir`.
    fn installable_artifacts(
        &self,
        fragment_dir: &Path,
    ) -> Result<Vec<InstallableArtifact>, ToolkitError>;

    fn apply(
        &self,
        operation: IndexOperation,
        fragment_dir: &Path,
        dest_dir: &Path,
    ) -> Result<(), ToolkitError> {
        match operation {
            IndexOperation::Merge => self.merge(fragment_dir, dest_dir),
            IndexOperation::Remove => self.remove(fragment_dir, dest_dir),
        }
    }
}
