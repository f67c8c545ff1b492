//! Live virtual inodes, indexed by union inode number
//!
//! The table only holds weak references: an inode lives as long as somebody
//! outside the table uses it, and its backing references go with it. Dead
//! slots are dropped when a lookup finds them and swept whenever the table
//! has grown to twice its size after the previous sweep.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::shadow::BranchHit;
use super::VirtualInode;
use crate::error::Result;

/// Backing objects found for one name, topmost branch first
#[derive(Debug, Clone)]
pub struct BackingEntryMeta {
    pub name: OsString,
    pub hits: Vec<BranchHit>,
}

impl BackingEntryMeta {
    pub fn new(name: impl Into<OsString>, mut hits: Vec<BranchHit>) -> Self {
        hits.sort_by_key(|h| h.bindex);
        hits.dedup_by_key(|h| h.bindex);
        Self {
            name: name.into(),
            hits,
        }
    }

    pub fn top(&self) -> Option<&BranchHit> {
        self.hits.first()
    }
}

/// Outcome of resolving a backing entry to a virtual inode
#[derive(Debug, Clone)]
pub struct Resolved {
    pub inode: Arc<VirtualInode>,
    /// False when an existing live inode was reused
    pub created: bool,
}

/// Fewest slots that trigger a sweep
const MIN_SWEEP: usize = 64;

#[derive(Debug)]
pub struct InodeTable {
    inodes: DashMap<u64, Weak<VirtualInode>>,
    /// Slot count at which the next insert sweeps dead slots
    sweep_at: AtomicUsize,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self {
            inodes: DashMap::new(),
            sweep_at: AtomicUsize::new(MIN_SWEEP),
        }
    }
}

impl InodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live inode `ino`; a dead slot found here is dropped
    pub fn get(&self, ino: u64) -> Option<Arc<VirtualInode>> {
        let inode = self.inodes.get(&ino).and_then(|w| w.upgrade());
        if inode.is_none() {
            self.inodes.remove_if(&ino, |_, w| w.strong_count() == 0);
        }
        inode
    }

    /// Track `inode` without keeping it alive
    pub fn insert(&self, inode: &Arc<VirtualInode>) {
        self.inodes.insert(inode.ino(), Arc::downgrade(inode));
    }

    /// Live inode `ino`, or a new one from `make` if there is none
    ///
    /// `make` runs with the slot locked, so two racing callers cannot both
    /// create an inode for the same number.
    pub fn get_or_insert_with<F>(&self, ino: u64, make: F) -> Result<Resolved>
    where
        F: FnOnce() -> Result<VirtualInode>,
    {
        let resolved = self.insert_with(ino, make)?;
        if resolved.created {
            self.maybe_sweep();
        }
        Ok(resolved)
    }

    fn insert_with<F>(&self, ino: u64, make: F) -> Result<Resolved>
    where
        F: FnOnce() -> Result<VirtualInode>,
    {
        match self.inodes.entry(ino) {
            Entry::Occupied(mut slot) => {
                if let Some(inode) = slot.get().upgrade() {
                    return Ok(Resolved {
                        inode,
                        created: false,
                    });
                }
                let inode = Arc::new(make()?);
                slot.insert(Arc::downgrade(&inode));
                Ok(Resolved {
                    inode,
                    created: true,
                })
            }
            Entry::Vacant(slot) => {
                let inode = Arc::new(make()?);
                slot.insert(Arc::downgrade(&inode));
                Ok(Resolved {
                    inode,
                    created: true,
                })
            }
        }
    }

    /// Sweep once the table doubled since the last sweep; never called with a
    /// slot held
    fn maybe_sweep(&self) {
        if self.inodes.len() < self.sweep_at.load(Ordering::Relaxed) {
            return;
        }
        self.prune();
        let next = (self.inodes.len() * 2).max(MIN_SWEEP);
        self.sweep_at.store(next, Ordering::Relaxed);
    }

    /// Every live inode, lowest number first
    pub fn live(&self) -> Vec<Arc<VirtualInode>> {
        let mut live: Vec<_> = self.inodes.iter().filter_map(|e| e.value().upgrade()).collect();
        live.sort_by_key(|i| i.ino());
        live
    }

    /// Forget slots whose inode has been destroyed
    pub fn prune(&self) -> usize {
        let before = self.inodes.len();
        self.inodes.retain(|_, w| w.strong_count() > 0);
        before - self.inodes.len()
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::FileKind;
    use crate::inode::InodeInfo;

    fn make(ino: u64) -> Result<VirtualInode> {
        Ok(VirtualInode::new(ino, FileKind::RegularFile, InodeInfo::new(1)?, 0))
    }

    #[test]
    fn test_reuses_live_inode() {
        let table = InodeTable::new();
        let first = table.get_or_insert_with(40, || make(40)).unwrap();
        assert!(first.created);

        let second = table.get_or_insert_with(40, || make(40)).unwrap();
        assert!(!second.created);
        assert!(Arc::ptr_eq(&first.inode, &second.inode));
    }

    #[test]
    fn test_dead_inode_is_recreated() {
        let table = InodeTable::new();
        let first = table.get_or_insert_with(41, || make(41)).unwrap();
        drop(first);
        assert!(table.get(41).is_none());

        let again = table.get_or_insert_with(41, || make(41)).unwrap();
        assert!(again.created);
    }

    #[test]
    fn test_dead_slot_dropped_on_get() {
        let table = InodeTable::new();
        drop(table.get_or_insert_with(42, || make(42)).unwrap());
        assert_eq!(table.len(), 1);
        assert!(table.get(42).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_dead_slots_swept_on_insert() {
        let table = InodeTable::new();
        let keep = table.get_or_insert_with(1000, || make(1000)).unwrap();
        for ino in 0..1000 {
            drop(table.get_or_insert_with(ino, || make(ino)).unwrap());
        }
        assert!(table.len() <= MIN_SWEEP, "{} slots left", table.len());
        assert_eq!(table.live().len(), 1);
        assert!(Arc::ptr_eq(&table.get(1000).unwrap(), &keep.inode));
    }

    #[test]
    fn test_prune_and_live() {
        let table = InodeTable::new();
        let keep = table.get_or_insert_with(50, || make(50)).unwrap();
        let gone = table.get_or_insert_with(51, || make(51)).unwrap();
        drop(gone);

        assert_eq!(table.prune(), 1);
        let live = table.live();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].ino(), keep.inode.ino());
    }

    #[test]
    fn test_meta_sorts_hits() {
        use crate::branch::BackingInode;
        use std::path::PathBuf;
        let h = |ino| {
            Arc::new(BackingInode {
                dev: 1,
                ino,
                generation: 0,
                kind: FileKind::RegularFile,
                nlink: 1,
                path: PathBuf::new(),
            })
        };
        let meta = BackingEntryMeta::new("f", vec![BranchHit::new(2, h(1)), BranchHit::new(0, h(2))]);
        assert_eq!(meta.top().unwrap().bindex, 0);
    }
}
