//! Branch pins
//!
//! Every mutating directory operation pins the backing parent directory of
//! its target in one branch before touching the backing filesystem:
//!
//! 1. read-lock the union parent's inode info (unless the caller holds it),
//! 2. resolve the parent's backing directory in the branch,
//! 3. take a mount-write token if asked,
//! 4. lock the backing directory,
//! 5. re-validate that the name still leads where the caller's cache says.
//!
//! Nothing is mutated until all five steps succeed, so a failed pin needs no
//! rollback beyond releasing what it took. Copy-up must not run with the
//! backing directory locked; [`BranchPin::temporarily_unlock`] and
//! [`BranchPin::relock`] open that window.

use crate::branch::{BackingInode, Branch, BranchHold, MountWriteToken};
use crate::config::Udba;
use crate::error::{Error, Result};
use crate::inode::{InodeInfo, VirtualInode};
use crate::lock::{LockClass, RankedReadGuard, RankedRwLock, RankedWriteGuard};
use crate::union::UnionFs;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinFlags(u8);

impl PinFlags {
    pub const NONE: PinFlags = PinFlags(0);
    /// Caller already holds the parent's inode-info lock
    pub const PARENT_LOCKED: PinFlags = PinFlags(1);
    /// Take a mount-write token on the branch
    pub const MNT_WRITE: PinFlags = PinFlags(1 << 1);

    pub fn contains(self, other: PinFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PinFlags {
    type Output = PinFlags;

    fn bitor(self, rhs: PinFlags) -> PinFlags {
        PinFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    Uninitialized,
    Initialized,
    Acquired,
    TemporarilyUnlocked,
    Released,
}

/// The entry an operation is about to change
#[derive(Debug, Clone)]
pub struct PinTarget {
    /// Union parent directory; `None` for the root
    parent: Option<Arc<VirtualInode>>,
    name: OsString,
    /// The caller's cached backing object for `name` in the pinned branch;
    /// `None` when the caller expects the name to be absent there
    cached: Option<Arc<BackingInode>>,
}

impl PinTarget {
    /// Target the union root; only a mount-write token is taken
    pub fn root() -> Self {
        Self {
            parent: None,
            name: OsString::new(),
            cached: None,
        }
    }

    /// Target `name` under `parent`
    pub fn child(
        parent: Arc<VirtualInode>,
        name: impl Into<OsString>,
        cached: Option<Arc<BackingInode>>,
    ) -> Self {
        Self {
            parent: Some(parent),
            name: name.into(),
            cached,
        }
    }

    pub fn parent(&self) -> Option<&Arc<VirtualInode>> {
        self.parent.as_ref()
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn cached(&self) -> Option<&Arc<BackingInode>> {
        self.cached.as_ref()
    }
}

pub struct BranchPin {
    state: PinState,

    // input
    target: Option<PinTarget>,
    bindex: usize,
    lsc_di: LockClass,
    lsc_hi: LockClass,
    flags: PinFlags,
    udba: Udba,

    // output
    parent_guard: Option<RankedReadGuard<InodeInfo>>,
    h_dir: Option<Arc<BackingInode>>,
    branch: Option<Arc<Branch>>,
    hold: Option<BranchHold>,
    write_token: Option<MountWriteToken>,
    dir_lock: Option<RankedRwLock<()>>,
    dir_guard: Option<RankedWriteGuard<()>>,
}

impl Default for BranchPin {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BranchPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchPin")
            .field("state", &self.state)
            .field("bindex", &self.bindex)
            .field("lsc_di", &self.lsc_di)
            .field("lsc_hi", &self.lsc_hi)
            .field("flags", &self.flags)
            .field("h_dir", &self.h_dir.as_ref().map(|d| d.ino))
            .field("dir_locked", &self.dir_guard.is_some())
            .finish()
    }
}

impl BranchPin {
    pub fn new() -> Self {
        Self {
            state: PinState::Uninitialized,
            target: None,
            bindex: 0,
            lsc_di: LockClass::Parent,
            lsc_hi: LockClass::Parent,
            flags: PinFlags::NONE,
            udba: Udba::Reval,
            parent_guard: None,
            h_dir: None,
            branch: None,
            hold: None,
            write_token: None,
            dir_lock: None,
            dir_guard: None,
        }
    }

    /// Populate the inputs; takes no locks
    pub fn init(
        &mut self,
        target: PinTarget,
        bindex: usize,
        lsc_di: LockClass,
        lsc_hi: LockClass,
        flags: PinFlags,
    ) {
        self.release();
        self.target = Some(target);
        self.bindex = bindex;
        self.lsc_di = lsc_di;
        self.lsc_hi = lsc_hi;
        self.flags = flags;
        self.state = PinState::Initialized;
    }

    /// Current lifecycle state
    pub fn state(&self) -> PinState {
        self.state
    }

    /// Branch index the pin was initialized for
    pub fn bindex(&self) -> usize {
        self.bindex
    }

    pub fn target(&self) -> Option<&PinTarget> {
        self.target.as_ref()
    }

    /// Resolved union parent
    pub fn parent(&self) -> Option<&Arc<VirtualInode>> {
        match self.state {
            PinState::Acquired | PinState::TemporarilyUnlocked => {
                self.target.as_ref().and_then(|t| t.parent.as_ref())
            }
            _ => None,
        }
    }

    /// Parent's shadow table, when this pin holds its lock
    pub fn parent_info(&self) -> Option<&InodeInfo> {
        self.parent_guard.as_deref()
    }

    /// Resolved backing parent directory
    pub fn h_dir(&self) -> Option<&Arc<BackingInode>> {
        self.h_dir.as_ref()
    }

    /// Branch (mount) the pin resolved to
    pub fn branch(&self) -> Option<&Arc<Branch>> {
        self.branch.as_ref()
    }

    /// Whether a mount-write token is held
    pub fn holds_write_token(&self) -> bool {
        self.write_token.is_some()
    }

    /// Whether the backing directory lock is held right now
    pub fn is_dir_locked(&self) -> bool {
        self.dir_guard.is_some()
    }

    /// Acquire the pin; the parent's inode-info lock is taken here
    pub fn acquire(&mut self, sb: &UnionFs) -> Result<()> {
        if self.flags.contains(PinFlags::PARENT_LOCKED) {
            return Err(Error::InvalidPinState(
                "parent-locked pin needs acquire_locked".to_string(),
            ));
        }
        self.do_acquire(sb, None)
    }

    /// Acquire the pin when the caller already holds the parent's lock
    pub fn acquire_locked(&mut self, sb: &UnionFs, parent_info: &InodeInfo) -> Result<()> {
        self.flags = self.flags | PinFlags::PARENT_LOCKED;
        self.do_acquire(sb, Some(parent_info))
    }

    fn do_acquire(&mut self, sb: &UnionFs, parent_info: Option<&InodeInfo>) -> Result<()> {
        if self.state != PinState::Initialized {
            return Err(Error::InvalidPinState(format!(
                "acquire in state {:?}",
                self.state
            )));
        }
        let result = self.try_acquire(sb, parent_info);
        match result {
            Ok(()) => {
                self.state = PinState::Acquired;
                debug!(bindex = self.bindex, h_dir = ?self.h_dir.as_ref().map(|d| d.ino), "pin acquired");
                Ok(())
            }
            Err(e) => {
                debug!(bindex = self.bindex, error = %e, "pin acquire failed");
                self.release();
                Err(e)
            }
        }
    }

    fn try_acquire(&mut self, sb: &UnionFs, parent_info: Option<&InodeInfo>) -> Result<()> {
        let bindex = self.bindex;
        let (hold, sigen) = sb.hold_branch(bindex)?;
        let branch = Arc::clone(hold.branch());
        self.hold = Some(hold);
        self.udba = sb.config().udba;
        self.branch = Some(Arc::clone(&branch));

        let parent = match self.target.as_ref().and_then(|t| t.parent.clone()) {
            Some(parent) => parent,
            None => {
                // The root has no parent directory to lock
                if self.flags.contains(PinFlags::MNT_WRITE) {
                    self.write_token = Some(branch.want_write(bindex)?);
                }
                return Ok(());
            }
        };

        let h_dir = match parent_info {
            Some(info) => info.get(bindex).cloned(),
            None => {
                let guard = parent.read_lock(self.lsc_di);
                let h_dir = guard.get(bindex).cloned();
                self.parent_guard = Some(guard);
                h_dir
            }
        };
        parent.generation().test(sigen)?;

        let h_dir = match h_dir {
            Some(dir) if dir.is_dir() => dir,
            _ => return Err(Error::busy(bindex, "parent has no directory in branch")),
        };
        self.h_dir = Some(Arc::clone(&h_dir));

        if self.flags.contains(PinFlags::MNT_WRITE) {
            self.write_token = Some(branch.want_write(bindex)?);
        }

        let lock = branch.dir_lock(&h_dir);
        self.dir_guard = Some(lock.write_nested(self.lsc_hi));
        self.dir_lock = Some(lock);

        self.revalidate()
    }

    /// Check, under the directory lock, that the target is still where the
    /// caller's cache says
    fn revalidate(&self) -> Result<()> {
        let (Some(target), Some(h_dir), Some(branch)) =
            (self.target.as_ref(), self.h_dir.as_ref(), self.branch.as_ref())
        else {
            return Ok(());
        };
        self.check_entry(branch, h_dir, target.name(), target.cached())
            .map_err(|e| {
                warn!(bindex = self.bindex, name = ?target.name(), error = %e, "pin revalidation failed");
                e
            })
    }

    fn check_entry(
        &self,
        branch: &Branch,
        h_dir: &BackingInode,
        name: &OsStr,
        cached: Option<&Arc<BackingInode>>,
    ) -> Result<()> {
        if self.udba == Udba::None {
            return Ok(());
        }
        let bindex = self.bindex;
        match branch.fs().revalidate(h_dir)? {
            Some(live) if live.same_object(h_dir) => {}
            _ => return Err(Error::busy(bindex, "backing directory moved or replaced")),
        }
        let live = branch.fs().lookup(h_dir, name)?;
        match (cached, live) {
            (None, None) => Ok(()),
            (Some(cached), Some(live)) if cached.same_object(&live) => Ok(()),
            (None, Some(_)) => Err(Error::busy(bindex, "entry appeared")),
            (Some(_), _) => Err(Error::busy(bindex, "entry moved or replaced")),
        }
    }

    /// Re-validate another name in the directory this pin holds
    pub fn check_sibling(&self, name: &OsStr, cached: Option<&Arc<BackingInode>>) -> Result<()> {
        if self.state != PinState::Acquired {
            return Err(Error::InvalidPinState(format!(
                "sibling check in state {:?}",
                self.state
            )));
        }
        match (self.branch.as_ref(), self.h_dir.as_ref()) {
            (Some(branch), Some(h_dir)) => self.check_entry(branch, h_dir, name, cached),
            _ => Ok(()),
        }
    }

    /// Drop only the backing directory lock, keeping the mount-write token
    pub fn temporarily_unlock(&mut self) {
        if self.state != PinState::Acquired {
            return;
        }
        self.dir_guard = None;
        self.state = PinState::TemporarilyUnlocked;
        debug!(bindex = self.bindex, "pin temporarily unlocked");
    }

    /// Re-take the directory lock and re-validate as `acquire` does
    ///
    /// The branch at the pin's index must still be the one it was acquired
    /// on and the union parent must match the current generation. On failure
    /// the whole pin is released; the caller must restart its operation from
    /// the lookup.
    pub fn relock(&mut self, sb: &UnionFs) -> Result<()> {
        if self.state != PinState::TemporarilyUnlocked {
            return Err(Error::InvalidPinState(format!(
                "relock in state {:?}",
                self.state
            )));
        }
        if let Some(lock) = self.dir_lock.as_ref() {
            self.dir_guard = Some(lock.write_nested(self.lsc_hi));
        }
        match self.check_branch(sb).and_then(|()| self.revalidate()) {
            Ok(()) => {
                self.state = PinState::Acquired;
                debug!(bindex = self.bindex, "pin relocked");
                Ok(())
            }
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    fn check_branch(&self, sb: &UnionFs) -> Result<()> {
        let bindex = self.bindex;
        let (current, sigen) = sb.branch_with_sigen(bindex)?;
        match self.branch.as_ref() {
            Some(branch) if branch.id() == current.id() => {}
            _ => return Err(Error::busy(bindex, "branch replaced while unlocked")),
        }
        if let Some(parent) = self.target.as_ref().and_then(|t| t.parent.as_ref()) {
            parent.generation().test(sigen)?;
        }
        Ok(())
    }

    /// Tear down in reverse order; safe in any state
    pub fn release(&mut self) {
        let was = self.state;
        self.dir_guard = None;
        self.write_token = None;
        self.parent_guard = None;
        self.dir_lock = None;
        self.h_dir = None;
        self.hold = None;
        if let Some(branch) = self.branch.take() {
            branch.prune_dir_locks();
        }
        if matches!(was, PinState::Acquired | PinState::TemporarilyUnlocked) {
            debug!(bindex = self.bindex, "pin released");
        }
        if was != PinState::Uninitialized {
            self.state = PinState::Released;
        }
    }
}

impl Drop for BranchPin {
    fn drop(&mut self) {
        self.release();
    }
}

/// One side of a two-directory operation
#[derive(Debug, Clone)]
pub struct PinRequest {
    pub target: PinTarget,
    pub bindex: usize,
    pub flags: PinFlags,
}

impl PinRequest {
    pub fn new(target: PinTarget, bindex: usize, flags: PinFlags) -> Self {
        Self {
            target,
            bindex,
            flags,
        }
    }

    fn order_key(&self) -> (usize, u64) {
        (
            self.bindex,
            self.target.parent.as_ref().map_or(0, |p| p.ino()),
        )
    }
}

/// Pins for both sides of a rename-like operation
///
/// The two pins are always taken in one canonical order, by branch index and
/// then by parent inode number. When both sides share a (branch, directory)
/// pair a single lock covers both.
#[derive(Debug)]
pub struct PinPair {
    first: BranchPin,
    second: Option<BranchPin>,
    /// Whether `a` of the request is `second`
    swapped: bool,
}

impl PinPair {
    /// Pin both sides in canonical order; nothing is held on failure
    pub fn acquire(sb: &UnionFs, a: PinRequest, b: PinRequest) -> Result<Self> {
        let swapped = b.order_key() < a.order_key();
        let shared = a.order_key() == b.order_key();
        let (lo, hi) = if swapped { (b, a) } else { (a, b) };

        // A shared pin must satisfy both sides
        let flags = if shared { lo.flags | hi.flags } else { lo.flags };
        let mut first = BranchPin::new();
        first.init(lo.target, lo.bindex, LockClass::Parent, LockClass::Parent, flags);
        first.acquire(sb)?;

        if shared {
            first.check_sibling(hi.target.name(), hi.target.cached())?;
            return Ok(Self {
                first,
                second: None,
                swapped,
            });
        }

        let same_parent = match (first.target().and_then(|t| t.parent()), hi.target.parent()) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            _ => false,
        };
        let mut second = BranchPin::new();
        second.init(hi.target, hi.bindex, LockClass::Parent2, LockClass::Parent2, hi.flags);
        match first.parent_info() {
            // One union parent in two branches: reuse the lock already held
            Some(info) if same_parent => second.acquire_locked(sb, info)?,
            _ => second.acquire(sb)?,
        }
        Ok(Self {
            first,
            second: Some(second),
            swapped,
        })
    }

    /// Pin covering the first request
    pub fn a(&self) -> &BranchPin {
        if self.swapped {
            self.second.as_ref().unwrap_or(&self.first)
        } else {
            &self.first
        }
    }

    /// Pin covering the second request
    pub fn b(&self) -> &BranchPin {
        if self.swapped {
            &self.first
        } else {
            self.second.as_ref().unwrap_or(&self.first)
        }
    }

    /// Whether one pin covers both sides
    pub fn is_shared(&self) -> bool {
        self.second.is_none()
    }

    /// Release both pins, second first
    pub fn release(&mut self) {
        if let Some(second) = self.second.as_mut() {
            second.release();
        }
        self.first.release();
    }
}

impl Drop for PinPair {
    fn drop(&mut self) {
        self.release();
    }
}
