//! Branches stacked into the union
//!
//! Each branch wraps one backing filesystem, tracks outstanding mount-write
//! tokens, and owns the locks pins take on its backing directories. Branch
//! indices shift when branches are inserted or removed; branch ids do not.

mod backing;
mod local;
mod memory;

pub use backing::{BackingFs, BackingIdentity, BackingInode, FileKind};
pub use local::LocalFs;
pub use memory::MemoryFs;

use crate::error::{Error, Result};
use crate::lock::{LockFamily, RankedRwLock};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Stable branch identifier, independent of the branch's current index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(pub u32);

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Branch permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchPerm {
    /// Readable and writable
    Rw,
    /// Read-only from the union's point of view
    Ro,
    /// Really read-only: the host refuses writes too
    Rr,
}

impl BranchPerm {
    /// Whether the union may write through this branch
    pub fn is_writable(&self) -> bool {
        matches!(self, BranchPerm::Rw)
    }

    /// Parse `rw`, `ro` or `rr`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "rw" => Some(BranchPerm::Rw),
            "ro" => Some(BranchPerm::Ro),
            "rr" => Some(BranchPerm::Rr),
            _ => None,
        }
    }
}

/// Key of a backing directory lock
type DirKey = (u64, u64);

/// One backing tree layered into the union
pub struct Branch {
    id: BranchId,
    perm: BranchPerm,
    label: String,
    fs: Arc<dyn BackingFs>,
    /// Outstanding mount-write tokens
    writers: AtomicUsize,
    /// Pins resolved to this branch and not yet released
    pins: AtomicUsize,
    dir_locks: DashMap<DirKey, RankedRwLock<()>>,
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("perm", &self.perm)
            .field("label", &self.label)
            .field("writers", &self.writers())
            .field("pins", &self.pins())
            .finish()
    }
}

impl Branch {
    /// Wrap `fs` as a branch; no tokens or pins outstanding
    pub fn new(id: BranchId, perm: BranchPerm, label: impl Into<String>, fs: Arc<dyn BackingFs>) -> Self {
        Self {
            id,
            perm,
            label: label.into(),
            fs,
            writers: AtomicUsize::new(0),
            pins: AtomicUsize::new(0),
            dir_locks: DashMap::new(),
        }
    }

    /// Stable identifier, unchanged when the branch's index shifts
    pub fn id(&self) -> BranchId {
        self.id
    }

    /// Permission the branch was stacked with
    pub fn perm(&self) -> BranchPerm {
        self.perm
    }

    /// Human-readable name for logs and diagnostics
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Backing filesystem
    pub fn fs(&self) -> &Arc<dyn BackingFs> {
        &self.fs
    }

    /// Outstanding mount-write tokens
    pub fn writers(&self) -> usize {
        self.writers.load(Ordering::SeqCst)
    }

    /// Live pins on this branch, locked or temporarily unlocked
    pub fn pins(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }

    /// Keep the branch in place until the returned hold is dropped
    pub(crate) fn hold(self: &Arc<Self>) -> BranchHold {
        self.pins.fetch_add(1, Ordering::SeqCst);
        BranchHold {
            branch: Arc::clone(self),
        }
    }

    /// Take a mount-write token on this branch
    pub fn want_write(self: &Arc<Self>, bindex: usize) -> Result<MountWriteToken> {
        if !self.perm.is_writable() || self.fs.is_read_only() {
            debug!("branch {} ({}) rejects write", bindex, self.id);
            return Err(Error::ReadOnlyBranch { bindex });
        }
        self.writers.fetch_add(1, Ordering::SeqCst);
        Ok(MountWriteToken {
            branch: Arc::clone(self),
        })
    }

    /// Lock guarding the backing directory `dir`, shared by every pin on it
    pub fn dir_lock(&self, dir: &BackingInode) -> RankedRwLock<()> {
        self.dir_locks
            .entry((dir.dev, dir.ino))
            .or_insert_with(|| RankedRwLock::new(LockFamily::BackingDir, ()))
            .clone()
    }

    /// Forget locks nobody holds a handle to
    pub(crate) fn prune_dir_locks(&self) {
        self.dir_locks
            .retain(|_, lock| lock.handle_count() > 1 || lock.is_locked());
    }

    /// Backing directories currently locked by a pin
    pub fn pinned_dirs(&self) -> Vec<(u64, u64)> {
        let mut dirs: Vec<_> = self
            .dir_locks
            .iter()
            .filter(|entry| entry.value().is_locked())
            .map(|entry| *entry.key())
            .collect();
        dirs.sort_unstable();
        dirs
    }
}

/// Outstanding write reservation on a branch; released on drop
pub struct MountWriteToken {
    branch: Arc<Branch>,
}

impl MountWriteToken {
    /// Branch the token was taken on
    pub fn branch(&self) -> &Arc<Branch> {
        &self.branch
    }
}

impl Drop for MountWriteToken {
    fn drop(&mut self) {
        self.branch.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MountWriteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountWriteToken")
            .field("branch", &self.branch.id)
            .finish()
    }
}

/// A pin's claim on its branch; removal is refused while one exists
pub struct BranchHold {
    branch: Arc<Branch>,
}

impl BranchHold {
    /// Branch the hold keeps in place
    pub fn branch(&self) -> &Arc<Branch> {
        &self.branch
    }
}

impl Drop for BranchHold {
    fn drop(&mut self) {
        self.branch.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for BranchHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchHold")
            .field("branch", &self.branch.id)
            .finish()
    }
}

/// Ordered branch list; index 0 has the highest lookup priority
#[derive(Debug, Clone, Default)]
pub struct BranchSet {
    branches: Vec<Arc<Branch>>,
    next_id: u32,
}

impl BranchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Branch at `bindex`
    pub fn get(&self, bindex: usize) -> Result<Arc<Branch>> {
        self.branches
            .get(bindex)
            .cloned()
            .ok_or(Error::BranchNotFound(bindex))
    }

    /// Current index of the branch with `id`
    pub fn index_of(&self, id: BranchId) -> Option<usize> {
        self.branches.iter().position(|b| b.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Branch>> {
        self.branches.iter()
    }

    /// Insert a branch at `bindex`, shifting lower branches down
    pub fn insert(
        &mut self,
        bindex: usize,
        perm: BranchPerm,
        label: impl Into<String>,
        fs: Arc<dyn BackingFs>,
    ) -> Result<Arc<Branch>> {
        if bindex > self.branches.len() {
            return Err(Error::BranchNotFound(bindex));
        }
        let branch = Arc::new(Branch::new(BranchId(self.next_id), perm, label, fs));
        self.next_id += 1;
        self.branches.insert(bindex, Arc::clone(&branch));
        Ok(branch)
    }

    /// Remove the branch at `bindex`, shifting lower branches up
    pub fn remove(&mut self, bindex: usize) -> Result<Arc<Branch>> {
        if bindex >= self.branches.len() {
            return Err(Error::BranchNotFound(bindex));
        }
        Ok(self.branches.remove(bindex))
    }

    /// Index of the highest-priority writable branch
    pub fn top_writable(&self) -> Option<usize> {
        self.branches
            .iter()
            .position(|b| b.perm.is_writable() && !b.fs.is_read_only())
    }
}
