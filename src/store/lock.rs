//! Advisory item locks keyed by repository path.
//!
//! Every store owns a [`LockTable`]. A lock is taken for a whole logical resource
//! (the aggregate index root) and released when its guard drops, so the release
//! happens on every exit path of the holder.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::model::RepoPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared with other readers.
    Read,
    /// Exclusive; used when first materializing an item.
    Create,
    /// Exclusive; used for read-modify-write of an existing item.
    Update,
    /// Exclusive; used when removing an item subtree.
    Delete,
}

impl LockMode {
    pub fn is_exclusive(self) -> bool {
        !matches!(self, LockMode::Read)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LockMode::Read => "read",
            LockMode::Create => "create",
            LockMode::Update => "update",
            LockMode::Delete => "delete",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
}

/// Reader/writer lock for a single path. Waiting writers block new readers.
#[derive(Debug, Default)]
pub struct ItemLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl ItemLock {
    fn acquire(&self, mode: LockMode) {
        let mut state = self.state.lock();
        if mode.is_exclusive() {
            state.waiting_writers += 1;
            while state.writer || state.readers > 0 {
                self.released.wait(&mut state);
            }
            state.waiting_writers -= 1;
            state.writer = true;
        } else {
            while state.writer || state.waiting_writers > 0 {
                self.released.wait(&mut state);
            }
            state.readers += 1;
        }
    }

    fn release(&self, mode: LockMode) {
        let mut state = self.state.lock();
        if mode.is_exclusive() {
            state.writer = false;
        } else {
            state.readers = state.readers.saturating_sub(1);
        }
        drop(state);
        self.released.notify_all();
    }

    /// True when nobody holds or waits for this lock.
    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        !state.writer && state.readers == 0 && state.waiting_writers == 0
    }
}

/// Held lock; unlocks on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ItemLockGuard {
    lock: Arc<ItemLock>,
    path: RepoPath,
    mode: LockMode,
}

impl ItemLockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &RepoPath {
        &self.path
    }
}

impl fmt::Debug for ItemLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemLockGuard")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for ItemLockGuard {
    fn drop(&mut self) {
        self.lock.release(self.mode);
        trace!(path = %self.path, mode = %self.mode, "released item lock");
    }
}

/// Per-store table of item locks.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<RepoPath, Arc<ItemLock>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock for `path` is held in `mode`.
    pub fn lock(&self, path: &RepoPath, mode: LockMode) -> ItemLockGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|key, lock| key == path || Arc::strong_count(lock) > 1 || !lock.is_idle());
            locks.entry(path.clone()).or_default().clone()
        };
        trace!(path = %path, mode = %mode, "acquiring item lock");
        lock.acquire(mode);
        ItemLockGuard {
            lock,
            path: path.clone(),
            mode,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
