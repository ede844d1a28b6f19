use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, trace};
use walkdir::WalkDir;

use super::{ArtifactStore, ItemKind, ItemLockGuard, LockMode, LockTable, StoreItem};
use crate::error::StoreError;
use crate::model::RepoPath;

const LINK_PREFIX: &[u8] = b"LINK to ";
const ATTRIBUTES_DIR: &str = ".nexus/attributes";
const MAX_LINK_DEPTH: usize = 8;
const LINK_SIDECAR_MAX_BYTES: u64 = 4096;

#[derive(Debug, Serialize, Deserialize)]
struct ItemAttributes {
    content_type: String,
    stored_at_millis: i64,
}

/// Store backed by a directory on the local filesystem.
///
/// Links are small marker files (`LINK to <path>`); item attributes live in a hidden
/// sidecar tree so they never show up as repository content.
#[derive(Debug)]
pub struct FsStore {
    id: String,
    base_dir: PathBuf,
    locks: LockTable,
}

impl FsStore {
    pub fn new(id: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            base_dir: base_dir.into(),
            locks: LockTable::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Physical file backing `path`.
    pub fn file_path(&self, path: &RepoPath) -> PathBuf {
        if path.is_root() {
            self.base_dir.clone()
        } else {
            self.base_dir.join(path.relative())
        }
    }

    fn attributes_path(&self, path: &RepoPath) -> PathBuf {
        self.base_dir
            .join(ATTRIBUTES_DIR)
            .join(format!("{}.json", path.relative()))
    }

    /// Content type recorded when the item was stored.
    pub fn content_type(&self, path: &RepoPath) -> Result<Option<String>, StoreError> {
        let raw = match fs::read(self.attributes_path(path)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(path, err)),
        };
        let attributes: ItemAttributes = serde_json::from_slice(&raw)
            .map_err(|err| StoreError::io(path, io::Error::new(ErrorKind::InvalidData, err)))?;
        Ok(Some(attributes.content_type))
    }

    fn write_attributes(&self, path: &RepoPath, content_type: &str) -> Result<(), StoreError> {
        let attributes = ItemAttributes {
            content_type: content_type.to_string(),
            stored_at_millis: chrono::Utc::now().timestamp_millis(),
        };
        let json = serde_json::to_vec(&attributes)
            .map_err(|err| StoreError::io(path, io::Error::new(ErrorKind::InvalidData, err)))?;
        write_replacing(&self.attributes_path(path), &json).map_err(|err| StoreError::io(path, err))
    }

    fn link_target(&self, path: &RepoPath, bytes: &[u8]) -> Result<Option<RepoPath>, StoreError> {
        let Some(rest) = bytes.strip_prefix(LINK_PREFIX) else {
            return Ok(None);
        };
        let target = std::str::from_utf8(rest).map_err(|err| StoreError::InvalidPath {
            path: path.to_string(),
            reason: format!("link target is not utf-8: {err}"),
        })?;
        RepoPath::parse(target.trim()).map(Some)
    }
}

/// Writes a sibling temp file and renames it over `dest`.
fn write_replacing(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "destination has no parent"))?;
    fs::create_dir_all(parent)?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(dest).map_err(|err| err.error)?;
    Ok(())
}

fn remove_any(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

impl ArtifactStore for FsStore {
    fn id(&self) -> &str {
        &self.id
    }

    fn get(&self, path: &RepoPath) -> Result<Option<Vec<u8>>, StoreError> {
        let mut current = path.clone();
        for _ in 0..MAX_LINK_DEPTH {
            let file = self.file_path(&current);
            if file.is_dir() {
                return Ok(None);
            }
            let bytes = match fs::read(&file) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(StoreError::io(&current, err)),
            };
            match self.link_target(&current, &bytes)? {
                Some(target) => {
                    trace!(link = %current, target = %target, "following link");
                    current = target;
                }
                None => return Ok(Some(bytes)),
            }
        }
        Err(StoreError::LinkLoop(path.clone()))
    }

    fn lookup(&self, path: &RepoPath) -> Result<Option<StoreItem>, StoreError> {
        let file = self.file_path(path);
        let metadata = match fs::metadata(&file) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(path, err)),
        };

        let kind = if metadata.is_dir() {
            ItemKind::Collection
        } else if metadata.len() <= LINK_SIDECAR_MAX_BYTES {
            let mut raw = Vec::with_capacity(metadata.len() as usize);
            File::open(&file)
                .and_then(|mut handle| handle.read_to_end(&mut raw))
                .map_err(|err| StoreError::io(path, err))?;
            match self.link_target(path, &raw)? {
                Some(target) => ItemKind::Link { target },
                None => ItemKind::File,
            }
        } else {
            ItemKind::File
        };

        Ok(Some(StoreItem {
            repository_id: self.id.clone(),
            path: path.clone(),
            kind,
        }))
    }

    fn put(&self, path: &RepoPath, bytes: &[u8], content_type: &str) -> Result<(), StoreError> {
        if path.is_root() {
            return Err(StoreError::InvalidPath {
                path: path.to_string(),
                reason: "cannot store content at the repository root".to_string(),
            });
        }
        write_replacing(&self.file_path(path), bytes).map_err(|err| StoreError::io(path, err))?;
        self.write_attributes(path, content_type)?;
        trace!(repository = %self.id, path = %path, bytes = bytes.len(), content_type, "stored item");
        Ok(())
    }

    fn delete(&self, path: &RepoPath) -> Result<bool, StoreError> {
        let existed = remove_any(&self.file_path(path)).map_err(|err| StoreError::io(path, err))?;
        let attributes = if path.is_root() {
            self.base_dir.join(ATTRIBUTES_DIR)
        } else {
            self.base_dir.join(ATTRIBUTES_DIR).join(path.relative())
        };
        remove_any(&attributes).map_err(|err| StoreError::io(path, err))?;
        remove_any(&self.attributes_path(path)).map_err(|err| StoreError::io(path, err))?;
        if existed {
            debug!(repository = %self.id, path = %path, "deleted item");
        }
        Ok(existed)
    }

    fn create_link(&self, link: &RepoPath, target: &StoreItem) -> Result<(), StoreError> {
        if target.repository_id != self.id {
            return Err(StoreError::InvalidPath {
                path: target.path.to_string(),
                reason: format!(
                    "link target belongs to repository [{}], not [{}]",
                    target.repository_id, self.id
                ),
            });
        }
        let marker = format!("LINK to {}", target.path);
        self.put(link, marker.as_bytes(), super::guess_content_type(link))
    }

    fn lock(&self, path: &RepoPath, mode: LockMode) -> ItemLockGuard {
        self.locks.lock(path, mode)
    }

    fn list_tree(&self) -> Result<Vec<RepoPath>, StoreError> {
        if !self.base_dir.is_dir() {
            return Err(StoreError::Unavailable {
                repository: self.id.clone(),
                reason: format!("{} is not a directory", self.base_dir.display()),
            });
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.base_dir).sort_by_file_name() {
            let entry = entry.map_err(|err| StoreError::io(&RepoPath::root(), err.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.base_dir) else {
                continue;
            };
            let joined = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            paths.push(RepoPath::parse(&joined)?);
        }
        Ok(paths)
    }
}
