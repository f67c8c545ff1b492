//! Ranked nested read/write locks
//!
//! Every acquisition names a [`LockClass`]. Within one [`LockFamily`] a thread
//! must take ranks in strictly increasing order: child before parent, with
//! numbered variants for independent ancestor chains (rename's two parents,
//! directory copy-up). Debug builds keep a per-thread stack of held ranks and
//! panic on a violation; release builds carry no bookkeeping.

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Lock subclass, in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockClass {
    /// Child first
    Child,
    /// rename(2), link(2)
    Child2,
    /// Copy-up of directories
    Child3,
    Parent,
    Parent2,
    Parent3,
    NewChild,
}

impl LockClass {
    /// All ranks, lowest first
    pub const ALL: [LockClass; 7] = [
        LockClass::Child,
        LockClass::Child2,
        LockClass::Child3,
        LockClass::Parent,
        LockClass::Parent2,
        LockClass::Parent3,
        LockClass::NewChild,
    ];

    /// Position in the acquisition order
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// Independent lock hierarchies; ranks are only compared within a family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockFamily {
    /// Union-side inode info (range and shadow table)
    InodeInfo,
    /// Backing directory locks taken by pins
    BackingDir,
}

#[cfg(debug_assertions)]
mod order {
    use super::{LockClass, LockFamily};
    use std::cell::{Cell, RefCell};

    thread_local! {
        static HELD: RefCell<Vec<(LockFamily, LockClass, u64)>> = const { RefCell::new(Vec::new()) };
        static NEXT_ID: Cell<u64> = const { Cell::new(0) };
    }

    pub(super) fn check(family: LockFamily, class: LockClass) {
        HELD.with(|held| {
            if let Some((_, higher, _)) = held
                .borrow()
                .iter()
                .find(|(f, c, _)| *f == family && *c >= class)
            {
                panic!(
                    "lock order violation: acquiring {:?}/{:?} while holding {:?}",
                    family, class, higher
                );
            }
        });
    }

    pub(super) fn push(family: LockFamily, class: LockClass) -> u64 {
        let id = NEXT_ID.with(|n| {
            let id = n.get();
            n.set(id + 1);
            id
        });
        HELD.with(|held| held.borrow_mut().push((family, class, id)));
        id
    }

    pub(super) fn pop(id: u64) {
        HELD.with(|held| held.borrow_mut().retain(|(_, _, i)| *i != id));
    }

    pub(super) fn held(family: LockFamily) -> Vec<LockClass> {
        HELD.with(|held| {
            held.borrow()
                .iter()
                .filter(|(f, _, _)| *f == family)
                .map(|(_, c, _)| *c)
                .collect()
        })
    }
}

/// Record of one held rank; removed from the thread's stack on drop
struct RankToken {
    #[cfg(debug_assertions)]
    id: u64,
}

impl RankToken {
    #[allow(unused_variables)]
    fn check(family: LockFamily, class: LockClass) {
        #[cfg(debug_assertions)]
        order::check(family, class);
    }

    #[allow(unused_variables)]
    fn push(family: LockFamily, class: LockClass) -> Self {
        RankToken {
            #[cfg(debug_assertions)]
            id: order::push(family, class),
        }
    }
}

impl Drop for RankToken {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        order::pop(self.id);
    }
}

/// Ranks of `family` currently held by this thread (always empty in release builds)
#[allow(unused_variables)]
pub fn held_ranks(family: LockFamily) -> Vec<LockClass> {
    #[cfg(debug_assertions)]
    {
        order::held(family)
    }
    #[cfg(not(debug_assertions))]
    {
        Vec::new()
    }
}

/// A read/write lock whose every acquisition is ranked
///
/// Cloning shares the underlying lock. Guards own a reference to it, so they
/// can be stored in long-lived per-operation state such as a pin.
pub struct RankedRwLock<T> {
    family: LockFamily,
    inner: Arc<RwLock<T>>,
}

impl<T> RankedRwLock<T> {
    /// New unlocked lock in `family`
    pub fn new(family: LockFamily, value: T) -> Self {
        Self {
            family,
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Hierarchy whose ranks this lock is checked against
    pub fn family(&self) -> LockFamily {
        self.family
    }

    /// Shared acquisition at rank `class`; blocks while a writer holds it
    pub fn read_nested(&self, class: LockClass) -> RankedReadGuard<T> {
        RankToken::check(self.family, class);
        let guard = self.inner.read_arc();
        RankedReadGuard {
            guard,
            class,
            _rank: RankToken::push(self.family, class),
        }
    }

    /// Exclusive acquisition at rank `class`
    pub fn write_nested(&self, class: LockClass) -> RankedWriteGuard<T> {
        RankToken::check(self.family, class);
        let guard = self.inner.write_arc();
        RankedWriteGuard {
            guard,
            class,
            _rank: RankToken::push(self.family, class),
        }
    }

    /// Exclusive acquisition without blocking; `None` if already held
    pub fn try_write_nested(&self, class: LockClass) -> Option<RankedWriteGuard<T>> {
        RankToken::check(self.family, class);
        let guard = self.inner.try_write_arc()?;
        Some(RankedWriteGuard {
            guard,
            class,
            _rank: RankToken::push(self.family, class),
        })
    }

    /// Held by anyone, shared or exclusive
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Held by a writer
    pub fn is_locked_exclusive(&self) -> bool {
        self.inner.is_locked_exclusive()
    }

    /// Whether both handles refer to the same lock
    pub fn same_lock(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T> Clone for RankedRwLock<T> {
    fn clone(&self) -> Self {
        Self {
            family: self.family,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for RankedRwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankedRwLock")
            .field("family", &self.family)
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}

/// Shared guard; pops its rank when dropped
pub struct RankedReadGuard<T> {
    guard: ArcRwLockReadGuard<RawRwLock, T>,
    class: LockClass,
    _rank: RankToken,
}

impl<T> RankedReadGuard<T> {
    /// Rank the guard was taken at
    pub fn class(&self) -> LockClass {
        self.class
    }
}

impl<T> Deref for RankedReadGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Exclusive guard; pops its rank when dropped
pub struct RankedWriteGuard<T> {
    guard: ArcRwLockWriteGuard<RawRwLock, T>,
    class: LockClass,
    _rank: RankToken,
}

impl<T> RankedWriteGuard<T> {
    /// Rank the guard was taken at
    pub fn class(&self) -> LockClass {
        self.class
    }

    /// Atomically trade the write lock for a read lock at the same rank
    pub fn downgrade(self) -> RankedReadGuard<T> {
        let RankedWriteGuard { guard, class, _rank } = self;
        RankedReadGuard {
            guard: ArcRwLockWriteGuard::downgrade(guard),
            class,
            _rank,
        }
    }
}

impl<T> Deref for RankedWriteGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedWriteGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increasing_ranks() {
        let child = RankedRwLock::new(LockFamily::InodeInfo, 1u32);
        let parent = RankedRwLock::new(LockFamily::InodeInfo, 2u32);

        let c = child.write_nested(LockClass::Child);
        let p = parent.read_nested(LockClass::Parent);
        assert_eq!(*c + *p, 3);
        assert_eq!(
            held_ranks(LockFamily::InodeInfo).len(),
            if cfg!(debug_assertions) { 2 } else { 0 }
        );
        drop(p);
        drop(c);
        assert!(held_ranks(LockFamily::InodeInfo).is_empty());
    }

    #[test]
    fn test_families_are_independent() {
        let info = RankedRwLock::new(LockFamily::InodeInfo, ());
        let dir = RankedRwLock::new(LockFamily::BackingDir, ());

        let _i = info.read_nested(LockClass::Parent);
        let _d = dir.write_nested(LockClass::Child);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_descending_rank_panics() {
        let a = RankedRwLock::new(LockFamily::InodeInfo, ());
        let b = RankedRwLock::new(LockFamily::InodeInfo, ());

        let _p = a.write_nested(LockClass::Parent);
        let _c = b.write_nested(LockClass::Child);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn test_equal_rank_panics() {
        let a = RankedRwLock::new(LockFamily::BackingDir, ());
        let b = RankedRwLock::new(LockFamily::BackingDir, ());

        let _a = a.read_nested(LockClass::Parent);
        let _b = b.read_nested(LockClass::Parent);
    }

    #[test]
    fn test_out_of_order_release() {
        let a = RankedRwLock::new(LockFamily::InodeInfo, ());
        let b = RankedRwLock::new(LockFamily::InodeInfo, ());

        let ga = a.read_nested(LockClass::Child);
        let gb = b.read_nested(LockClass::Parent2);
        drop(ga);
        drop(gb);
        // Stack is empty again, so a low rank may be taken
        let _again = a.write_nested(LockClass::Child);
    }

    #[test]
    fn test_downgrade_keeps_rank() {
        let lock = RankedRwLock::new(LockFamily::InodeInfo, 5u32);
        let mut w = lock.write_nested(LockClass::Child2);
        *w = 6;
        let r = w.downgrade();
        assert_eq!(*r, 6);
        assert_eq!(r.class(), LockClass::Child2);
        assert!(lock.is_locked());
        assert!(!lock.is_locked_exclusive());
    }

    #[test]
    fn test_try_write_contended() {
        let lock = RankedRwLock::new(LockFamily::BackingDir, ());
        let shared = lock.clone();
        let _r = lock.read_nested(LockClass::Parent);

        let handle = std::thread::spawn(move || shared.try_write_nested(LockClass::Parent).is_none());
        assert!(handle.join().unwrap());
    }
}
