//! Pseudo-link registry
//!
//! When a hardlinked file has been copied up, the other names of that file
//! still point into the lower branch. The registry keeps the copied-up alias
//! reachable by inode so those names keep resolving to it.
//!
//! Lookups hold a short stake on the registry. Maintenance (remount, branch
//! reconfiguration, cleanup) waits for outstanding stakes to drain and then
//! excludes new ones until it ends. Lookups issued during maintenance block.

use crate::branch::BackingInode;
use crate::error::{Error, Result};
use crate::inode::VirtualInode;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One (inode, branch) alias kept resolvable
#[derive(Debug, Clone)]
pub struct PlinkEntry {
    inode: Arc<VirtualInode>,
    bindex: usize,
    alias: Arc<BackingInode>,
}

impl PlinkEntry {
    pub fn inode(&self) -> &Arc<VirtualInode> {
        &self.inode
    }

    pub fn bindex(&self) -> usize {
        self.bindex
    }

    pub fn alias(&self) -> &Arc<BackingInode> {
        &self.alias
    }

    /// File name of the alias in the branch's pseudo-link directory
    pub fn name(&self) -> String {
        format!("{}+{}", self.inode.ino(), self.alias.ino)
    }
}

/// Read-only view for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlinkInfo {
    pub ino: u64,
    pub bindex: usize,
    pub h_ino: u64,
    pub name: String,
}

#[derive(Debug, Default)]
struct MaintState {
    active: bool,
    /// Maintainers waiting to enter
    waiting: usize,
    /// Outstanding lookup stakes
    lookups: usize,
}

#[derive(Debug)]
pub struct PlinkRegistry {
    enabled: bool,
    entries: DashMap<(u64, usize), PlinkEntry>,
    state: Mutex<MaintState>,
    cond: Condvar,
}

impl PlinkRegistry {
    /// Empty registry; a disabled one records nothing
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: DashMap::new(),
            state: Mutex::new(MaintState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Wait out maintenance and register an in-flight lookup
    pub fn stake(&self) -> LookupStake<'_> {
        let mut state = self.state.lock();
        while state.active || state.waiting > 0 {
            self.cond.wait(&mut state);
        }
        state.lookups += 1;
        LookupStake { registry: self }
    }

    /// Block until lookups drain, then hold maintenance until the guard drops
    pub fn enter_maintenance(&self) -> MaintenanceGuard<'_> {
        let mut state = self.state.lock();
        state.waiting += 1;
        while state.active || state.lookups > 0 {
            self.cond.wait(&mut state);
        }
        state.waiting -= 1;
        state.active = true;
        info!("pseudo-link maintenance entered");
        MaintenanceGuard {
            registry: self,
            left: false,
        }
    }

    /// Enter maintenance only if nothing is in the way
    pub fn try_enter_maintenance(&self) -> Option<MaintenanceGuard<'_>> {
        let mut state = self.state.lock();
        if state.active || state.lookups > 0 {
            return None;
        }
        state.active = true;
        Some(MaintenanceGuard {
            registry: self,
            left: false,
        })
    }

    /// Whether a maintainer holds the registry
    pub fn is_maintaining(&self) -> bool {
        self.state.lock().active
    }

    fn leave_maintenance(&self) {
        let mut state = self.state.lock();
        state.active = false;
        self.cond.notify_all();
        info!("pseudo-link maintenance left");
    }

    /// Register that `inode`'s alias in `bindex` must stay resolvable
    pub fn append(&self, inode: &Arc<VirtualInode>, bindex: usize, alias: Arc<BackingInode>) {
        if !self.enabled {
            return;
        }
        let _stake = self.stake();
        let key = (inode.ino(), bindex);
        if self.entries.contains_key(&key) {
            return;
        }
        self.entries.entry(key).or_insert_with(|| {
            debug!(ino = inode.ino(), bindex, h_ino = alias.ino, "pseudo-link appended");
            PlinkEntry {
                inode: Arc::clone(inode),
                bindex,
                alias,
            }
        });
    }

    /// Whether `inode` has any pseudo-link
    pub fn test(&self, inode: &VirtualInode) -> bool {
        let _stake = self.stake();
        self.entries.iter().any(|e| e.key().0 == inode.ino())
    }

    /// Preserved alias; performs no backing lookup
    pub fn lookup(&self, inode: &VirtualInode, bindex: usize) -> Option<Arc<BackingInode>> {
        let _stake = self.stake();
        self.entries
            .get(&(inode.ino(), bindex))
            .map(|e| Arc::clone(&e.alias))
    }

    /// Drop every alias of `inode`
    pub fn remove(&self, inode: &VirtualInode) -> usize {
        let _stake = self.stake();
        let before = self.entries.len();
        self.entries.retain(|key, _| key.0 != inode.ino());
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every pseudo-link, for diagnostics
    pub fn list(&self) -> Vec<PlinkInfo> {
        let mut list: Vec<_> = self
            .entries
            .iter()
            .map(|e| PlinkInfo {
                ino: e.inode.ino(),
                bindex: e.bindex,
                h_ino: e.alias.ino,
                name: e.name(),
            })
            .collect();
        list.sort_by_key(|p| (p.ino, p.bindex));
        list
    }

    /// Release every held reference
    pub fn put(&self, verbose: bool) -> usize {
        self.enter_maintenance().put(verbose)
    }

    /// Release every held reference, reporting leftovers when `verbose`
    pub fn clean(&self, verbose: bool) -> usize {
        let maint = self.enter_maintenance();
        if verbose {
            for entry in self.list() {
                warn!(ino = entry.ino, bindex = entry.bindex, name = %entry.name, "pseudo-link still registered");
            }
        }
        maint.put(false)
    }

    /// Fail if anything is still registered
    pub fn check_empty(&self) -> Result<()> {
        let count = self.entries.len();
        if count > 0 {
            error!(count, "pseudo-links left at teardown");
            return Err(Error::PseudoLinkLeak { count });
        }
        Ok(())
    }
}

impl Drop for PlinkRegistry {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            error!(count = self.entries.len(), "pseudo-link registry dropped while non-empty");
        }
    }
}

/// An in-flight lookup; maintenance waits for it
pub struct LookupStake<'a> {
    registry: &'a PlinkRegistry,
}

impl Drop for LookupStake<'_> {
    fn drop(&mut self) {
        let mut state = self.registry.state.lock();
        state.lookups -= 1;
        if state.lookups == 0 {
            self.registry.cond.notify_all();
        }
    }
}

/// Exclusive maintenance of the registry; ends on drop or [`leave`](Self::leave)
pub struct MaintenanceGuard<'a> {
    registry: &'a PlinkRegistry,
    left: bool,
}

impl MaintenanceGuard<'_> {
    /// Drop all entries, logging each when `verbose`
    pub fn put(&self, verbose: bool) -> usize {
        let entries = &self.registry.entries;
        if verbose {
            for entry in self.registry.list() {
                info!(ino = entry.ino, bindex = entry.bindex, name = %entry.name, "releasing pseudo-link");
            }
        }
        let count = entries.len();
        entries.clear();
        count
    }

    /// Periodic maintenance: drop entries nobody but the registry refers to
    pub fn prune(&self) -> usize {
        let entries = &self.registry.entries;
        let before = entries.len();
        entries.retain(|_, e| Arc::strong_count(&e.inode) > 1);
        let pruned = before - entries.len();
        if pruned > 0 {
            debug!(pruned, "pruned idle pseudo-links");
        }
        pruned
    }

    /// A branch was inserted at `bindex`; shift the entries below it
    pub fn insert_branch(&self, bindex: usize) {
        self.reindex(|b| Some(if b >= bindex { b + 1 } else { b }));
    }

    /// The branch at `bindex` was removed; its aliases go with it
    pub fn remove_branch(&self, bindex: usize) {
        self.reindex(|b| match b.cmp(&bindex) {
            std::cmp::Ordering::Less => Some(b),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(b - 1),
        });
    }

    fn reindex(&self, map: impl Fn(usize) -> Option<usize>) {
        let entries = &self.registry.entries;
        let keys: Vec<_> = entries.iter().map(|e| *e.key()).collect();
        let moved: Vec<_> = keys
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect();
        for ((ino, bindex), mut entry) in moved {
            if let Some(new) = map(bindex) {
                entry.bindex = new;
                entries.insert((ino, new), entry);
            }
        }
    }

    /// End maintenance and wake waiting lookups
    pub fn leave(mut self) {
        self.left = true;
        self.registry.leave_maintenance();
    }
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        if !self.left {
            self.registry.leave_maintenance();
        }
    }
}
