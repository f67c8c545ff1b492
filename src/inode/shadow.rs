//! Per-inode branch shadow table
//!
//! [`InodeInfo`] is the state guarded by a virtual inode's ranked lock: the
//! occupied branch range and one [`BranchShadow`] per branch. Shared access
//! goes through a read guard, mutation through a write guard, so callers
//! cannot touch the table without holding the lock.

use crate::branch::{BackingInode, BranchId, BranchSet};
use crate::error::{Error, Result};
use std::any::Any;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Flags passed when installing a shadow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShadowFlags(u8);

impl ShadowFlags {
    pub const NONE: ShadowFlags = ShadowFlags(0);
    /// The union inode number was recorded in the xino map
    pub const XINO: ShadowFlags = ShadowFlags(1);

    pub fn contains(self, other: ShadowFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ShadowFlags {
    type Output = ShadowFlags;

    fn bitor(self, rhs: ShadowFlags) -> ShadowFlags {
        ShadowFlags(self.0 | rhs.0)
    }
}

/// Backing state of one virtual inode in one branch
#[derive(Debug, Clone, Default)]
pub struct BranchShadow {
    inode: Option<Arc<BackingInode>>,
    /// Copied-up whiteout hiding a lower entry
    whiteout: Option<Arc<BackingInode>>,
    id: Option<BranchId>,
    flags: ShadowFlags,
}

impl BranchShadow {
    pub fn inode(&self) -> Option<&Arc<BackingInode>> {
        self.inode.as_ref()
    }

    pub fn whiteout(&self) -> Option<&Arc<BackingInode>> {
        self.whiteout.as_ref()
    }

    pub fn branch_id(&self) -> Option<BranchId> {
        self.id
    }

    pub fn flags(&self) -> ShadowFlags {
        self.flags
    }

    pub fn is_empty(&self) -> bool {
        self.inode.is_none() && self.whiteout.is_none()
    }
}

/// Inclusive range of branch indices holding a shadow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchRange {
    start: usize,
    end: usize,
}

impl BranchRange {
    pub fn new(start: usize, end: usize) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn contains(&self, bindex: usize) -> bool {
        (self.start..=self.end).contains(&bindex)
    }
}

/// Opaque directory-listing cache owned by the inode
pub type VdirCache = Box<dyn Any + Send + Sync>;

/// Branch range and shadow sequence of one virtual inode
#[derive(Default)]
pub struct InodeInfo {
    range: Option<BranchRange>,
    shadows: Vec<BranchShadow>,
    /// Device of the top shadow, cached for staleness tests
    hsb1: Option<u64>,
    /// Host generation of the top shadow
    higen: u32,
    vdir: Option<VdirCache>,
}

impl fmt::Debug for InodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeInfo")
            .field("range", &self.range)
            .field("shadows", &self.shadows)
            .field("hsb1", &self.hsb1)
            .field("higen", &self.higen)
            .field("vdir", &self.vdir.is_some())
            .finish()
    }
}

fn alloc_shadows(nbr: usize) -> Result<Vec<BranchShadow>> {
    let mut shadows = Vec::new();
    shadows
        .try_reserve_exact(nbr)
        .map_err(|_| Error::AllocationFailure { requested: nbr })?;
    Ok(shadows)
}

impl InodeInfo {
    /// Empty table sized for `nbr` branches
    pub fn new(nbr: usize) -> Result<Self> {
        let mut shadows = alloc_shadows(nbr)?;
        shadows.resize_with(nbr, BranchShadow::default);
        Ok(Self {
            shadows,
            ..Self::default()
        })
    }

    /// Occupied branch range; `None` when the inode has no shadows
    pub fn range(&self) -> Option<BranchRange> {
        self.range
    }

    pub fn bstart(&self) -> Option<usize> {
        self.range.map(|r| r.start)
    }

    pub fn bend(&self) -> Option<usize> {
        self.range.map(|r| r.end)
    }

    /// Number of branch slots
    pub fn capacity(&self) -> usize {
        self.shadows.len()
    }

    /// Set both ends of the range; both must be valid indices
    pub fn set_range(&mut self, bstart: usize, bend: usize) -> Result<()> {
        if bend >= self.shadows.len() {
            return Err(Error::BranchNotFound(bend));
        }
        self.range = Some(BranchRange::new(bstart, bend).ok_or(Error::BranchNotFound(bstart))?);
        Ok(())
    }

    /// Move the top of the range, keeping the bottom
    pub fn set_bstart(&mut self, bstart: usize) -> Result<()> {
        let bend = self.bend().unwrap_or(bstart);
        self.set_range(bstart, bend)
    }

    /// Move the bottom of the range, keeping the top
    pub fn set_bend(&mut self, bend: usize) -> Result<()> {
        let bstart = self.bstart().unwrap_or(bend);
        self.set_range(bstart, bend)
    }

    pub fn clear_range(&mut self) {
        self.range = None;
    }

    pub fn shadow(&self, bindex: usize) -> Option<&BranchShadow> {
        self.shadows.get(bindex)
    }

    pub fn shadows(&self) -> &[BranchShadow] {
        &self.shadows
    }

    /// Backing inode at `bindex`, if any
    pub fn get(&self, bindex: usize) -> Option<&Arc<BackingInode>> {
        self.shadows.get(bindex).and_then(|s| s.inode.as_ref())
    }

    /// Top backing inode
    pub fn top(&self) -> Option<&Arc<BackingInode>> {
        self.bstart().and_then(|b| self.get(b))
    }

    /// Branch the shadow at `bindex` was recorded against
    pub fn br_id(&self, bindex: usize) -> Option<BranchId> {
        self.shadows.get(bindex).and_then(|s| s.id)
    }

    pub fn whiteout(&self, bindex: usize) -> Option<&Arc<BackingInode>> {
        self.shadows.get(bindex).and_then(|s| s.whiteout.as_ref())
    }

    /// Install (or clear, with `None`) the backing inode for `bindex`
    pub fn set(
        &mut self,
        bindex: usize,
        inode: Option<Arc<BackingInode>>,
        id: BranchId,
        flags: ShadowFlags,
    ) -> Result<()> {
        let is_top = self.range.map_or(true, |r| bindex <= r.start);
        let shadow = self
            .shadows
            .get_mut(bindex)
            .ok_or(Error::BranchNotFound(bindex))?;
        if let Some(ref h_inode) = inode {
            if is_top {
                self.hsb1 = Some(h_inode.dev);
                self.higen = h_inode.generation;
            }
        }
        shadow.inode = inode;
        shadow.id = Some(id);
        shadow.flags = flags;
        Ok(())
    }

    /// Attach or drop the whiteout entry at `bindex`
    pub fn set_whiteout(&mut self, bindex: usize, whiteout: Option<Arc<BackingInode>>) -> Result<()> {
        let shadow = self
            .shadows
            .get_mut(bindex)
            .ok_or(Error::BranchNotFound(bindex))?;
        shadow.whiteout = whiteout;
        Ok(())
    }

    pub fn vdir(&self) -> Option<&VdirCache> {
        self.vdir.as_ref()
    }

    pub fn set_vdir(&mut self, vdir: Option<VdirCache>) {
        self.vdir = vdir;
    }

    /// Whether the host replaced the object behind our cached top shadow
    pub fn test_stale(&self, h_inode: &BackingInode) -> bool {
        !(self.hsb1 == Some(h_inode.dev) && self.higen == h_inode.generation)
    }

    /// Recompute the range from the occupied slots
    ///
    /// With `put_zero`, non-directory shadows whose link count dropped to
    /// zero are released first.
    pub fn update_range(&mut self, put_zero: bool) {
        if put_zero {
            for shadow in &mut self.shadows {
                if shadow
                    .inode
                    .as_ref()
                    .is_some_and(|i| i.nlink == 0 && !i.is_dir())
                {
                    shadow.inode = None;
                }
            }
        }

        let first = self.shadows.iter().position(|s| s.inode.is_some());
        let last = self.shadows.iter().rposition(|s| s.inode.is_some());
        self.range = match (first, last) {
            (Some(start), Some(end)) => BranchRange::new(start, end),
            _ => None,
        };
        self.cache_top();
    }

    fn cache_top(&mut self) {
        let top = self.top().map(|i| (i.dev, i.generation));
        if let Some((dev, gen)) = top {
            self.hsb1 = Some(dev);
            self.higen = gen;
        } else {
            self.hsb1 = None;
            self.higen = 0;
        }
    }

    /// Grow or shrink to `nbr` slots; unchanged on failure
    pub fn resize(&mut self, nbr: usize) -> Result<()> {
        let mut shadows = alloc_shadows(nbr)?;
        shadows.extend(self.shadows.iter().take(nbr).cloned());
        shadows.resize_with(nbr, BranchShadow::default);

        let shrunk = nbr < self.shadows.len();
        self.shadows = shadows;
        if shrunk {
            self.update_range(false);
        }
        Ok(())
    }

    /// Move every shadow to the current index of its branch id
    ///
    /// Shadows of branches no longer in `branches` are released.
    pub(crate) fn rehome(&mut self, branches: &BranchSet) -> Result<()> {
        let mut shadows = alloc_shadows(branches.len())?;
        shadows.resize_with(branches.len(), BranchShadow::default);

        for shadow in self.shadows.iter().filter(|s| !s.is_empty()) {
            if let Some(bindex) = shadow.id.and_then(|id| branches.index_of(id)) {
                shadows[bindex] = shadow.clone();
            }
        }
        self.shadows = shadows;
        self.update_range(false);
        Ok(())
    }

    /// Fill empty slots from a fresh lookup
    pub(crate) fn merge_hits(&mut self, branches: &BranchSet, hits: &[BranchHit]) -> Result<()> {
        for hit in hits {
            let id = branches.get(hit.bindex)?.id();
            if self.get(hit.bindex).is_none() {
                self.set(hit.bindex, Some(Arc::clone(&hit.inode)), id, ShadowFlags::NONE)?;
            }
        }
        self.update_range(false);
        Ok(())
    }
}

/// A backing object found for a name in one branch
#[derive(Debug, Clone)]
pub struct BranchHit {
    pub bindex: usize,
    pub inode: Arc<BackingInode>,
}

impl BranchHit {
    pub fn new(bindex: usize, inode: Arc<BackingInode>) -> Self {
        Self { bindex, inode }
    }
}
