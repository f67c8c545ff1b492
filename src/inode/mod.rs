//! Virtual inodes
//!
//! A [`VirtualInode`] is the union-visible object for one logical path. It
//! directly contains its shadow table behind a ranked lock, and its
//! generation behind a separate small lock.

mod generation;
mod shadow;
mod table;
mod xino;

pub use generation::{Freshness, GenerationCounter, GenerationStamp, IiGen, Stamped};
pub use shadow::{BranchHit, BranchRange, BranchShadow, InodeInfo, ShadowFlags, VdirCache};
pub use table::{BackingEntryMeta, InodeTable, Resolved};
pub use xino::{XinoKey, XinoMap, FIRST_INO};

use crate::branch::{BackingInode, BranchSet, FileKind};
use crate::error::{Error, Result};
use crate::lock::{LockClass, LockFamily, RankedReadGuard, RankedRwLock, RankedWriteGuard};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Inode number of the union root
pub const ROOT_INO: u64 = 2;

pub struct VirtualInode {
    ino: u64,
    kind: FileKind,
    generation: GenerationCounter,
    info: RankedRwLock<InodeInfo>,
}

impl fmt::Debug for VirtualInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualInode")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .field("generation", &self.generation.snapshot())
            .finish()
    }
}

impl VirtualInode {
    /// Inode `ino` with shadow table `info`, consistent with `sigen`
    pub fn new(ino: u64, kind: FileKind, info: InodeInfo, sigen: u32) -> Self {
        Self {
            ino,
            kind,
            generation: GenerationCounter::new(sigen),
            info: RankedRwLock::new(LockFamily::InodeInfo, info),
        }
    }

    /// Union inode number
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Generation counter guarding cached shadows
    pub fn generation(&self) -> &GenerationCounter {
        &self.generation
    }

    /// Shared lock on the shadow table at rank `class`
    pub fn read_lock(&self, class: LockClass) -> RankedReadGuard<InodeInfo> {
        self.info.read_nested(class)
    }

    /// Exclusive lock on the shadow table at rank `class`
    pub fn write_lock(&self, class: LockClass) -> RankedWriteGuard<InodeInfo> {
        self.info.write_nested(class)
    }

    /// Whether anyone holds the shadow table lock
    pub fn is_locked(&self) -> bool {
        self.info.is_locked()
    }

    /// Reference tagged with the current generation
    pub fn stamp(self: &Arc<Self>) -> Stamped<Arc<VirtualInode>> {
        Stamped::new(Arc::clone(self), &self.generation)
    }

    /// Whether `h_inode` is no longer the object our top shadow was built from
    pub fn test_stale(&self, info: &InodeInfo, h_inode: &BackingInode) -> bool {
        info.test_stale(h_inode)
    }

    /// Re-home the shadow table after a branch reconfiguration
    ///
    /// `info` must be this inode's write-locked table. Concurrent
    /// generation readers see [`Freshness::Refreshing`] until the table is
    /// consistent again.
    pub fn refresh_self(&self, info: &mut InodeInfo, branches: &BranchSet, sigen: u32) -> Result<()> {
        let saved = self.generation.begin_refresh();
        if let Err(e) = info.rehome(branches) {
            self.generation.restore(saved);
            return Err(e);
        }
        self.generation.update(sigen, false);
        debug!(ino = self.ino, range = ?info.range(), sigen, "refreshed inode");
        Ok(())
    }

    /// Re-home and then fill empty slots from a fresh lookup
    pub fn refresh(
        &self,
        info: &mut InodeInfo,
        branches: &BranchSet,
        hits: &[BranchHit],
        sigen: u32,
    ) -> Result<()> {
        if let Some(bad) = hits.iter().find(|h| h.bindex >= branches.len()) {
            return Err(Error::BranchNotFound(bad.bindex));
        }
        let saved = self.generation.begin_refresh();
        let result = info
            .rehome(branches)
            .and_then(|_| info.merge_hits(branches, hits));
        if let Err(e) = result {
            self.generation.restore(saved);
            return Err(e);
        }
        self.generation.update(sigen, false);
        debug!(ino = self.ino, range = ?info.range(), sigen, "refreshed inode from lookup");
        Ok(())
    }
}

impl Stamped<Arc<VirtualInode>> {
    /// The cached inode, or `StaleGeneration` if it was poisoned or refreshed since
    pub fn revalidate(&self) -> Result<&Arc<VirtualInode>> {
        self.verify(self.value_unchecked().generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BackingFs, BranchPerm, MemoryFs};

    fn branches(n: usize) -> BranchSet {
        let mut set = BranchSet::new();
        for i in 0..n {
            set.insert(i, BranchPerm::Rw, format!("m{}", i), Arc::new(MemoryFs::new(i as u64)))
                .unwrap();
        }
        set
    }

    #[test]
    fn test_stamp_revalidate() {
        let inode = Arc::new(VirtualInode::new(20, FileKind::RegularFile, InodeInfo::new(1).unwrap(), 1));
        let cached = inode.stamp();
        assert_eq!(cached.revalidate().unwrap().ino(), 20);

        inode.generation().decrement();
        assert!(matches!(cached.revalidate(), Err(Error::StaleGeneration { .. })));
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let set = branches(2);
        let root0 = set.get(0).unwrap().fs().root().unwrap();
        let inode = VirtualInode::new(ROOT_INO, FileKind::Directory, InodeInfo::new(2).unwrap(), 0);

        let hits = [BranchHit::new(0, root0)];
        {
            let mut info = inode.write_lock(LockClass::Child);
            inode.refresh(&mut info, &set, &hits, 3).unwrap();
            inode.refresh(&mut info, &set, &hits, 3).unwrap();
            assert_eq!((info.bstart(), info.bend()), (Some(0), Some(0)));
        }
        assert_eq!(inode.generation().state(3), Freshness::Consistent);
    }

    #[test]
    fn test_refresh_rejects_unknown_branch() {
        let set = branches(1);
        let root0 = set.get(0).unwrap().fs().root().unwrap();
        let inode = VirtualInode::new(30, FileKind::Directory, InodeInfo::new(1).unwrap(), 4);

        let mut info = inode.write_lock(LockClass::Child);
        let err = inode
            .refresh(&mut info, &set, &[BranchHit::new(5, root0)], 5)
            .unwrap_err();
        assert!(matches!(err, Error::BranchNotFound(5)));
        assert_eq!(inode.generation().snapshot(), IiGen { generation: 4, half_refreshed: false });
    }
}
