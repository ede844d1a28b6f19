//! Artifact store abstraction the aggregator reads fragments from and writes the
//! aggregate index into.

mod fs;
pub mod lock;

pub use fs::FsStore;
pub use lock::{ItemLockGuard, LockMode, LockTable};

use crate::error::StoreError;
use crate::model::RepoPath;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Collection,
    Link { target: RepoPath },
}

/// Metadata for an item resolved in a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreItem {
    pub repository_id: String,
    pub path: RepoPath,
    pub kind: ItemKind,
}

impl StoreItem {
    pub fn is_link(&self) -> bool {
        matches!(self.kind, ItemKind::Link { .. })
    }
}

/// Named byte blobs of a single repository.
///
/// Absent items are reported as `Ok(None)` rather than as errors.
pub trait ArtifactStore: Send + Sync {
    /// Identifier of the repository this store belongs to.
    fn id(&self) -> &str;

    /// Reads an item, following links to their target.
    fn get(&self, path: &RepoPath) -> Result<Option<Vec<u8>>, StoreError>;

    /// Resolves an item without reading its content or following links.
    fn lookup(&self, path: &RepoPath) -> Result<Option<StoreItem>, StoreError>;

    /// Replaces the item at `path`. Concurrent readers see either the old or
    /// the new content, never a partial write.
    fn put(&self, path: &RepoPath, bytes: &[u8], content_type: &str) -> Result<(), StoreError>;

    /// Deletes a file, link or whole collection. Returns whether anything existed.
    fn delete(&self, path: &RepoPath) -> Result<bool, StoreError>;

    /// Records `link` as an alias of `target`, replacing whatever was at `link`.
    fn create_link(&self, link: &RepoPath, target: &StoreItem) -> Result<(), StoreError>;

    /// Blocks until the advisory lock for `path` is held.
    fn lock(&self, path: &RepoPath, mode: LockMode) -> ItemLockGuard;

    /// Every file in the repository in lexicographic depth-first order.
    fn list_tree(&self) -> Result<Vec<RepoPath>, StoreError>;
}

/// Content type recorded for an item, guessed from its file name.
pub fn guess_content_type(path: &RepoPath) -> &'static str {
    let extension = path
        .file_name()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("xml") => "application/xml",
        Some("jar") => "application/java-archive",
        Some("pom") => "application/xml",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
