//! Union superblock
//!
//! [`UnionFs`] owns the branch set, the live inode table, the inode number
//! remap, the pseudo-link registry, and the superblock generation. Branch
//! reconfiguration bumps the generation and then re-homes every live inode.

use crate::branch::{BackingFs, BackingInode, Branch, BranchHold, BranchId, BranchPerm, BranchSet, FileKind, LocalFs};
use crate::config::UnionConfig;
use crate::error::{Error, Result};
use crate::inode::{
    BackingEntryMeta, BranchHit, Freshness, InodeInfo, InodeTable, Resolved, ShadowFlags,
    VirtualInode, XinoKey, XinoMap, ROOT_INO,
};
use crate::lock::LockClass;
use crate::plink::PlinkRegistry;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix of the entry that marks a name deleted in every lower branch
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Whiteout entry name for `name`
pub fn whiteout_name(name: &OsStr) -> OsString {
    let mut wh = OsString::from(WHITEOUT_PREFIX);
    wh.push(name);
    wh
}

/// Backing filesystem plus how to stack it
pub struct BranchSource {
    pub fs: Arc<dyn BackingFs>,
    pub perm: BranchPerm,
    pub label: String,
}

impl BranchSource {
    pub fn new(fs: Arc<dyn BackingFs>, perm: BranchPerm, label: impl Into<String>) -> Self {
        Self {
            fs,
            perm,
            label: label.into(),
        }
    }
}

/// Counters for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct UnionStats {
    pub branches: usize,
    pub sigen: u32,
    pub live_inodes: usize,
    pub xino_entries: usize,
    pub plinks: usize,
    pub pinned_dirs: usize,
    pub writers: usize,
}

/// Backing directories held by pins in one branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinnedDirs {
    pub branch: BranchId,
    pub dirs: Vec<(u64, u64)>,
}

pub struct UnionFs {
    config: UnionConfig,
    branches: RwLock<BranchSet>,
    /// Superblock generation; bumped on every branch reconfiguration
    sigen: AtomicU32,
    inodes: InodeTable,
    xino: XinoMap,
    plink: PlinkRegistry,
    root: Arc<VirtualInode>,
    /// Serializes branch reconfiguration
    reconfig: Mutex<()>,
}

impl std::fmt::Debug for UnionFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnionFs")
            .field("branches", &self.branch_count())
            .field("sigen", &self.sigen())
            .field("live_inodes", &self.inodes.len())
            .finish()
    }
}

impl UnionFs {
    /// Mount the host directories named in `config`
    pub fn new(config: UnionConfig) -> Result<Self> {
        config.validate()?;
        let mut sources = Vec::with_capacity(config.branches.len());
        for branch in &config.branches {
            let fs = LocalFs::new(branch.path.clone(), branch.perm == BranchPerm::Rr)?;
            sources.push(BranchSource::new(
                Arc::new(fs),
                branch.perm,
                branch.path.to_string_lossy(),
            ));
        }
        Self::with_branches(config, sources)
    }

    /// Stack arbitrary backing filesystems; `config.branches` is ignored
    pub fn with_branches(config: UnionConfig, sources: Vec<BranchSource>) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one branch is required".to_string(),
            ));
        }
        if config.xino.first_ino >= config.xino.max_ino {
            return Err(Error::InvalidConfig(format!(
                "xino.first_ino ({}) must be below xino.max_ino ({})",
                config.xino.first_ino, config.xino.max_ino
            )));
        }

        let mut set = BranchSet::new();
        for (bindex, source) in sources.into_iter().enumerate() {
            set.insert(bindex, source.perm, source.label, source.fs)?;
        }

        let sigen = 1;
        let mut info = InodeInfo::new(set.len())?;
        for (bindex, branch) in set.iter().enumerate() {
            let root = branch.fs().root()?;
            if !root.is_dir() {
                return Err(Error::NotADirectory(branch.label().to_string()));
            }
            info.set(bindex, Some(root), branch.id(), ShadowFlags::NONE)?;
        }
        info.update_range(false);
        let root = Arc::new(VirtualInode::new(ROOT_INO, FileKind::Directory, info, sigen));

        let inodes = InodeTable::new();
        inodes.insert(&root);

        info!(branches = set.len(), "union mounted");
        Ok(Self {
            xino: XinoMap::new(config.xino.first_ino, config.xino.max_ino),
            plink: PlinkRegistry::new(config.plink.enabled),
            config,
            branches: RwLock::new(set),
            sigen: AtomicU32::new(sigen),
            inodes,
            root,
            reconfig: Mutex::new(()),
        })
    }

    /// Configuration the union was mounted with
    pub fn config(&self) -> &UnionConfig {
        &self.config
    }

    /// Root directory inode
    pub fn root(&self) -> &Arc<VirtualInode> {
        &self.root
    }

    /// Current superblock generation
    pub fn sigen(&self) -> u32 {
        self.sigen.load(Ordering::SeqCst)
    }

    /// Number of stacked branches
    pub fn branch_count(&self) -> usize {
        self.branches.read().len()
    }

    /// Branch at `bindex`
    pub fn branch(&self, bindex: usize) -> Result<Arc<Branch>> {
        self.branches.read().get(bindex)
    }

    /// Branch at `bindex` together with the generation it belongs to
    pub fn branch_with_sigen(&self, bindex: usize) -> Result<(Arc<Branch>, u32)> {
        let set = self.branches.read();
        Ok((set.get(bindex)?, self.sigen()))
    }

    /// Claim the branch at `bindex` for a pin, with the generation it
    /// belongs to; removal waits until the hold is dropped
    pub(crate) fn hold_branch(&self, bindex: usize) -> Result<(BranchHold, u32)> {
        let set = self.branches.read();
        Ok((set.get(bindex)?.hold(), self.sigen()))
    }

    /// Branch set and generation, read together
    pub fn snapshot(&self) -> (BranchSet, u32) {
        let set = self.branches.read();
        (set.clone(), self.sigen())
    }

    /// Live inode table
    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    /// Backing to union inode number remap
    pub fn xino(&self) -> &XinoMap {
        &self.xino
    }

    /// Pseudo-link registry
    pub fn plink(&self) -> &PlinkRegistry {
        &self.plink
    }

    /// Bring a stale inode back in line with the current branch set
    pub fn refresh_inode(&self, inode: &VirtualInode) -> Result<()> {
        if inode.generation().state(self.sigen()) == Freshness::Consistent {
            return Ok(());
        }
        let mut info = inode.write_lock(LockClass::Child);
        // Snapshot under the lock so a finished reconfiguration is never undone
        let (branches, sigen) = self.snapshot();
        if inode.generation().state(sigen) == Freshness::Consistent {
            return Ok(());
        }
        inode.refresh_self(&mut info, &branches, sigen)
    }

    /// Look `name` up in every branch of `parent` and resolve it
    ///
    /// Lower branches are only consulted while the hits are directories. A
    /// whiteout for `name` in a branch hides the name there and in every
    /// branch below it. The caller must not hold `parent`'s lock.
    pub fn lookup(&self, parent: &Arc<VirtualInode>, name: &OsStr) -> Result<Option<Resolved>> {
        if !parent.is_dir() {
            return Err(Error::NotADirectory(format!("inode {}", parent.ino())));
        }
        self.refresh_inode(parent)?;

        let info = parent.read_lock(LockClass::Parent);
        // Parent indices are only meaningful against the set it was refreshed for
        let (branches, sigen) = self.snapshot();
        parent.generation().test(sigen)?;
        let Some(range) = info.range() else {
            return Ok(None);
        };

        let wh_name = whiteout_name(name);
        let mut hits = Vec::new();
        for bindex in range.start()..=range.end() {
            let Some(h_dir) = info.get(bindex) else {
                continue;
            };
            if !h_dir.is_dir() {
                continue;
            }
            let branch = branches.get(bindex)?;
            let fs = branch.fs();
            if fs.lookup(h_dir, &wh_name)?.is_some() {
                debug!(bindex, name = ?name, "whited out");
                break;
            }
            let Some(h_inode) = fs.lookup(h_dir, name)? else {
                continue;
            };
            let is_dir = h_inode.is_dir();
            if !hits.is_empty() && !is_dir {
                break;
            }
            hits.push(BranchHit::new(bindex, h_inode));
            if !is_dir {
                break;
            }
        }
        let parent_bstart = info.bstart();
        drop(info);

        if hits.is_empty() {
            return Ok(None);
        }
        let meta = BackingEntryMeta::new(name, hits);
        self.resolve_in(&branches, sigen, parent_bstart, &meta, false)
            .map(Some)
    }

    /// Map a backing entry to its virtual inode, creating one if needed
    ///
    /// The caller must not hold `parent`'s lock.
    pub fn resolve_or_create(
        &self,
        parent: &VirtualInode,
        meta: &BackingEntryMeta,
        must_new: bool,
    ) -> Result<Resolved> {
        let (branches, sigen) = self.snapshot();
        let parent_bstart = parent.read_lock(LockClass::Parent).bstart();
        self.resolve_in(&branches, sigen, parent_bstart, meta, must_new)
    }

    fn resolve_in(
        &self,
        branches: &BranchSet,
        sigen: u32,
        parent_bstart: Option<usize>,
        meta: &BackingEntryMeta,
        must_new: bool,
    ) -> Result<Resolved> {
        // A child cannot live in a branch above its parent
        let hits: Vec<BranchHit> = meta
            .hits
            .iter()
            .filter(|h| parent_bstart.is_some_and(|b| h.bindex >= b))
            .cloned()
            .collect();
        let top = hits
            .first()
            .ok_or_else(|| Error::PathNotFound(meta.name.to_string_lossy().to_string()))?;
        let key = XinoKey::new(branches.get(top.bindex)?.id(), &top.inode);

        let mut ino = self.xino.read_or_alloc(key)?;
        if let Some(existing) = self.inodes.get(ino) {
            if !must_new && shadow_matches(&existing, top) {
                self.adopt(&existing, branches, &hits, top, sigen)?;
                debug!(ino, name = ?meta.name, "resolved to live inode");
                return Ok(Resolved {
                    inode: existing,
                    created: false,
                });
            }
            ino = self.xino.new_ino()?;
            self.xino.write(key, ino);
            debug!(ino, name = ?meta.name, must_new, "remapped to a fresh inode number");
        }

        let kind = top.inode.kind;
        let resolved = self.inodes.get_or_insert_with(ino, || {
            let mut info = InodeInfo::new(branches.len())?;
            for (i, hit) in hits.iter().enumerate() {
                let flags = if i == 0 { ShadowFlags::XINO } else { ShadowFlags::NONE };
                let id = branches.get(hit.bindex)?.id();
                info.set(hit.bindex, Some(Arc::clone(&hit.inode)), id, flags)?;
            }
            info.update_range(false);
            Ok(VirtualInode::new(ino, kind, info, sigen))
        })?;
        if resolved.created {
            debug!(ino, name = ?meta.name, "created inode");
        }
        Ok(resolved)
    }

    /// Bring a reused inode up to date and note hardlink aliases
    fn adopt(
        &self,
        inode: &Arc<VirtualInode>,
        branches: &BranchSet,
        hits: &[BranchHit],
        top: &BranchHit,
        sigen: u32,
    ) -> Result<()> {
        if inode.generation().state(sigen) != Freshness::Consistent {
            let mut info = inode.write_lock(LockClass::Child);
            inode.refresh(&mut info, branches, hits, sigen)?;
        }

        // Reached through a lower branch while the inode already lives
        // higher up: another name of a copied-up hardlinked file
        let alias = {
            let info = inode.read_lock(LockClass::Child);
            match (info.bstart(), info.top()) {
                (Some(bstart), Some(h_top))
                    if !inode.is_dir() && top.inode.nlink > 1 && bstart < top.bindex =>
                {
                    Some((bstart, Arc::clone(h_top)))
                }
                _ => None,
            }
        };
        if let Some((bindex, h_top)) = alias {
            self.plink.append(inode, bindex, h_top);
        }
        Ok(())
    }

    /// Install a shadow on a write-locked inode, recording its number in the
    /// remap when `flags` has [`ShadowFlags::XINO`]
    pub fn set_shadow(
        &self,
        inode: &VirtualInode,
        info: &mut InodeInfo,
        bindex: usize,
        h_inode: Option<Arc<BackingInode>>,
        flags: ShadowFlags,
    ) -> Result<()> {
        let id = self.branch(bindex)?.id();
        if flags.contains(ShadowFlags::XINO) {
            if let Some(ref h) = h_inode {
                self.xino.write(XinoKey::new(id, h), inode.ino());
            }
        }
        info.set(bindex, h_inode, id, flags)
    }

    /// Insert a branch at `bindex`; existing branches at and below it shift down
    pub fn add_branch(&self, bindex: usize, source: BranchSource) -> Result<BranchId> {
        let new_root = source.fs.root()?;
        if !new_root.is_dir() {
            return Err(Error::NotADirectory(source.label));
        }

        let _reconfig = self.reconfig.lock();
        let (branches, sigen, id) = {
            let maint = self.plink.enter_maintenance();
            let mut set = self.branches.write();
            let branch = set.insert(bindex, source.perm, source.label, source.fs)?;
            let sigen = self.bump_sigen();
            maint.insert_branch(bindex);
            (set.clone(), sigen, branch.id())
        };
        info!(bindex, branch = %id, sigen, "branch added");

        let root_hit = [BranchHit::new(bindex, new_root)];
        self.refresh_all(&branches, sigen, &root_hit)?;
        Ok(id)
    }

    /// Remove the branch at `bindex`
    ///
    /// Fails with `ConcurrentModification` while the branch has outstanding
    /// write tokens or live pins.
    pub fn remove_branch(&self, bindex: usize) -> Result<BranchId> {
        let _reconfig = self.reconfig.lock();
        let (branches, sigen, id) = {
            let maint = self.plink.enter_maintenance();
            let mut set = self.branches.write();
            if set.len() == 1 {
                return Err(Error::InvalidConfig(
                    "Cannot remove the last branch".to_string(),
                ));
            }
            let branch = set.get(bindex)?;
            if branch.writers() > 0 || branch.pins() > 0 || !branch.pinned_dirs().is_empty() {
                warn!(bindex, branch = %branch.id(), "branch busy, not removed");
                return Err(Error::busy(bindex, "branch in use"));
            }
            set.remove(bindex)?;
            let sigen = self.bump_sigen();
            maint.remove_branch(bindex);
            (set.clone(), sigen, branch.id())
        };
        info!(bindex, branch = %id, sigen, "branch removed");

        self.refresh_all(&branches, sigen, &[])?;
        let forgotten = self.xino.forget_branch(id);
        debug!(branch = %id, forgotten, "dropped remapped numbers");
        Ok(id)
    }

    fn bump_sigen(&self) -> u32 {
        self.sigen.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    fn refresh_all(&self, branches: &BranchSet, sigen: u32, root_hits: &[BranchHit]) -> Result<()> {
        {
            let mut info = self.root.write_lock(LockClass::Child);
            self.root.refresh(&mut info, branches, root_hits, sigen)?;
        }
        let mut refreshed = 0;
        for inode in self.inodes.live() {
            if inode.ino() == ROOT_INO {
                continue;
            }
            let mut info = inode.write_lock(LockClass::Child);
            inode.refresh_self(&mut info, branches, sigen)?;
            refreshed += 1;
        }
        self.inodes.prune();
        debug!(refreshed, sigen, "refreshed live inodes");
        Ok(())
    }

    /// Backing directories currently held by pins, per branch
    pub fn pinned_dirs(&self) -> Vec<PinnedDirs> {
        self.branches
            .read()
            .iter()
            .map(|b| PinnedDirs {
                branch: b.id(),
                dirs: b.pinned_dirs(),
            })
            .filter(|p| !p.dirs.is_empty())
            .collect()
    }

    /// Snapshot of counters for diagnostics
    pub fn stats(&self) -> UnionStats {
        let set = self.branches.read();
        UnionStats {
            branches: set.len(),
            sigen: self.sigen(),
            live_inodes: self.inodes.live().len(),
            xino_entries: self.xino.len(),
            plinks: self.plink.len(),
            pinned_dirs: set.iter().map(|b| b.pinned_dirs().len()).sum(),
            writers: set.iter().map(|b| b.writers()).sum(),
        }
    }

    /// Unmount: release pseudo-links and verify nothing leaked
    pub fn teardown(&self) -> Result<()> {
        let released = self.plink.clean(self.config.plink.verbose_teardown);
        if released > 0 {
            debug!(released, "released pseudo-links at teardown");
        }
        self.plink.check_empty()?;
        info!("union torn down");
        Ok(())
    }
}

fn shadow_matches(inode: &VirtualInode, hit: &BranchHit) -> bool {
    let info = inode.read_lock(LockClass::Child);
    info.get(hit.bindex)
        .is_some_and(|h| h.same_object(&hit.inode))
}
