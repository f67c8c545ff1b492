//! Branch-remapped inode numbers
//!
//! Backing inode numbers collide across branches, so the union hands out its
//! own numbers and remembers which backing object each one came from. Only
//! the in-memory mapping lives here; persisting it is someone else's job.

use crate::branch::{BackingInode, BranchId};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// First number handed to a non-root inode
pub const FIRST_INO: u64 = 11;

/// Identity of a backing object for remapping purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XinoKey {
    pub branch: BranchId,
    pub dev: u64,
    pub h_ino: u64,
    pub generation: u32,
    pub is_dir: bool,
}

impl XinoKey {
    pub fn new(branch: BranchId, h_inode: &BackingInode) -> Self {
        Self {
            branch,
            dev: h_inode.dev,
            h_ino: h_inode.ino,
            generation: h_inode.generation,
            is_dir: h_inode.is_dir(),
        }
    }
}

#[derive(Debug)]
pub struct XinoMap {
    map: DashMap<XinoKey, u64>,
    next: AtomicU64,
    max: u64,
}

impl XinoMap {
    /// Allocator handing out numbers in `first..=max`
    pub fn new(first: u64, max: u64) -> Self {
        Self {
            map: DashMap::new(),
            next: AtomicU64::new(first),
            max,
        }
    }

    /// Number previously recorded for `key`
    pub fn read(&self, key: &XinoKey) -> Option<u64> {
        self.map.get(key).map(|ino| *ino)
    }

    /// Record `ino` for `key`, replacing any earlier number
    pub fn write(&self, key: XinoKey, ino: u64) {
        self.map.insert(key, ino);
    }

    /// Allocate a fresh union inode number
    pub fn new_ino(&self) -> Result<u64> {
        let max = self.max;
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                if next <= max {
                    next.checked_add(1)
                } else {
                    None
                }
            })
            .map_err(|_| Error::IdentityOverflow { max })
    }

    /// Number for `key`, allocating and recording one if needed
    pub fn read_or_alloc(&self, key: XinoKey) -> Result<u64> {
        if let Some(ino) = self.read(&key) {
            return Ok(ino);
        }
        let fresh = self.new_ino()?;
        Ok(*self.map.entry(key).or_insert(fresh))
    }

    /// Drop every mapping that came from `branch`
    pub fn forget_branch(&self, branch: BranchId) -> usize {
        let before = self.map.len();
        self.map.retain(|key, _| key.branch != branch);
        before - self.map.len()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::FileKind;
    use std::path::PathBuf;

    fn h(ino: u64, kind: FileKind) -> BackingInode {
        BackingInode {
            dev: 3,
            ino,
            generation: 0,
            kind,
            nlink: 1,
            path: PathBuf::new(),
        }
    }

    #[test]
    fn test_same_backing_ino_differs_per_branch() {
        let xino = XinoMap::new(FIRST_INO, u64::MAX);
        let a = xino.read_or_alloc(XinoKey::new(BranchId(0), &h(5, FileKind::RegularFile))).unwrap();
        let b = xino.read_or_alloc(XinoKey::new(BranchId(1), &h(5, FileKind::RegularFile))).unwrap();
        let again = xino.read_or_alloc(XinoKey::new(BranchId(0), &h(5, FileKind::RegularFile))).unwrap();

        assert_ne!(a, b);
        assert_eq!(a, again);
        assert_eq!(a, FIRST_INO);
    }

    #[test]
    fn test_overflow() {
        let xino = XinoMap::new(20, 21);
        assert_eq!(xino.new_ino().unwrap(), 20);
        assert_eq!(xino.new_ino().unwrap(), 21);
        assert!(matches!(xino.new_ino(), Err(Error::IdentityOverflow { max: 21 })));
    }

    #[test]
    fn test_forget_branch() {
        let xino = XinoMap::new(FIRST_INO, u64::MAX);
        xino.read_or_alloc(XinoKey::new(BranchId(0), &h(1, FileKind::Directory))).unwrap();
        xino.read_or_alloc(XinoKey::new(BranchId(1), &h(1, FileKind::Directory))).unwrap();
        assert_eq!(xino.forget_branch(BranchId(0)), 1);
        assert_eq!(xino.len(), 1);
    }
}
