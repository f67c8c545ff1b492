//! Concurrency tests for pins, generations and pseudo-link maintenance
//!
//! Pins on different backing directories must run side by side, pins on the
//! same directory must take turns, and registry maintenance must wait for
//! lookups and for other maintainers.

use stackfs::branch::{BackingFs, BranchPerm, FileKind, MemoryFs};
use stackfs::config::UnionConfig;
use stackfs::inode::{InodeInfo, VirtualInode};
use stackfs::lock::LockClass;
use stackfs::pin::{BranchPin, PinFlags, PinTarget};
use stackfs::union::{BranchSource, UnionFs};
use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

const DIRS: usize = 8;

fn union_with_dirs() -> (Arc<UnionFs>, Arc<MemoryFs>) {
    let upper = Arc::new(MemoryFs::new(1));
    for i in 0..DIRS {
        upper.mkdir(format!("d{}", i)).unwrap();
    }
    let sb = UnionFs::with_branches(
        UnionConfig::default(),
        vec![BranchSource::new(
            Arc::clone(&upper) as Arc<dyn BackingFs>,
            BranchPerm::Rw,
            "upper",
        )],
    )
    .unwrap();
    (Arc::new(sb), upper)
}

fn dir(sb: &UnionFs, name: &str) -> Arc<VirtualInode> {
    sb.lookup(sb.root(), OsStr::new(name)).unwrap().unwrap().inode
}

fn pin_in(sb: &UnionFs, parent: Arc<VirtualInode>, name: &str) -> BranchPin {
    let mut pin = BranchPin::new();
    pin.init(
        PinTarget::child(parent, name, None),
        0,
        LockClass::Parent,
        LockClass::Parent,
        PinFlags::MNT_WRITE,
    );
    pin.acquire(sb).unwrap();
    pin
}

#[test]
fn test_disjoint_pins_do_not_block() {
    let (sb, _upper) = union_with_dirs();
    let barrier = Arc::new(Barrier::new(DIRS));
    let mut handles = vec![];

    for i in 0..DIRS {
        let sb = Arc::clone(&sb);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let parent = dir(&sb, &format!("d{}", i));
            let pin = pin_in(&sb, parent, "new");
            // Every thread holds its pin here at the same time
            barrier.wait();
            assert!(pin.is_dir_locked());
            barrier.wait();
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(sb.pinned_dirs().is_empty());
    assert_eq!(sb.branch(0).unwrap().writers(), 0);
}

#[test]
fn test_same_directory_pins_serialize() {
    let (sb, _upper) = union_with_dirs();
    let parent = dir(&sb, "d0");
    let first = pin_in(&sb, Arc::clone(&parent), "a");

    let acquired = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let handle = {
        let sb = Arc::clone(&sb);
        let parent = Arc::clone(&parent);
        let acquired = Arc::clone(&acquired);
        thread::spawn(move || {
            tx.send(()).unwrap();
            let pin = pin_in(&sb, parent, "b");
            acquired.store(true, Ordering::SeqCst);
            drop(pin);
        })
    };

    rx.recv().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(!acquired.load(Ordering::SeqCst), "second pin got in while the first held the directory");

    drop(first);
    handle.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
}

#[test]
fn test_relock_detects_concurrent_rename() {
    let (sb, upper) = union_with_dirs();
    upper.create("d1/victim", FileKind::RegularFile).unwrap();
    let parent = dir(&sb, "d1");
    let cached = upper.get("d1/victim");

    let mut pin = BranchPin::new();
    pin.init(
        PinTarget::child(parent, "victim", cached),
        0,
        LockClass::Parent,
        LockClass::Parent,
        PinFlags::MNT_WRITE,
    );
    pin.acquire(&sb).unwrap();
    pin.temporarily_unlock();

    let renamer = {
        let upper = Arc::clone(&upper);
        thread::spawn(move || upper.rename("d1/victim", "d2/victim").unwrap())
    };
    renamer.join().unwrap();

    let err = pin.relock(&sb).unwrap_err();
    assert!(err.is_retryable());
    assert!(!pin.holds_write_token());
    assert!(sb.pinned_dirs().is_empty());
}

#[test]
fn test_generation_updates_not_lost() {
    let inode = Arc::new(VirtualInode::new(
        100,
        FileKind::RegularFile,
        InodeInfo::new(1).unwrap(),
        0,
    ));
    let threads = 8;
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let inode = Arc::clone(&inode);
            thread::spawn(move || {
                for _ in 0..10_000 {
                    inode.generation().increment();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(inode.generation().read(), threads * 10_000);
}

#[test]
fn test_maintenance_waits_for_lookups() {
    let (sb, _upper) = union_with_dirs();
    let stake = sb.plink().stake();

    let entered = Arc::new(AtomicBool::new(false));
    let handle = {
        let sb = Arc::clone(&sb);
        let entered = Arc::clone(&entered);
        thread::spawn(move || {
            let guard = sb.plink().enter_maintenance();
            entered.store(true, Ordering::SeqCst);
            guard.leave();
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!entered.load(Ordering::SeqCst));
    drop(stake);
    handle.join().unwrap();
    assert!(entered.load(Ordering::SeqCst));
    assert!(!sb.plink().is_maintaining());
}

#[test]
fn test_maintainers_never_overlap() {
    let (sb, _upper) = union_with_dirs();
    let inside = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let sb = Arc::clone(&sb);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                for _ in 0..200 {
                    let _guard = sb.plink().enter_maintenance();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

fn lookup_f(sb: &UnionFs) -> bool {
    let parent = match sb.lookup(sb.root(), OsStr::new("d3")) {
        Ok(Some(resolved)) => resolved.inode,
        Ok(None) => panic!("d3 vanished"),
        Err(e) if e.is_retryable() => return false,
        Err(e) => panic!("unexpected error: {}", e),
    };
    match sb.lookup(&parent, OsStr::new("f")) {
        Ok(Some(_)) => true,
        Ok(None) => panic!("f vanished"),
        Err(e) if e.is_retryable() => false,
        Err(e) => panic!("unexpected error: {}", e),
    }
}

#[test]
fn test_lookups_during_reconfiguration() {
    const READERS: usize = 4;
    let (sb, upper) = union_with_dirs();
    upper.create("d3/f", FileKind::RegularFile).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(READERS + 1));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let sb = Arc::clone(&sb);
            let stop = Arc::clone(&stop);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                let mut ok = 0usize;
                while !lookup_f(&sb) {}
                ok += 1;
                ready.wait();
                while !stop.load(Ordering::SeqCst) {
                    if lookup_f(&sb) {
                        ok += 1;
                    }
                }
                ok
            })
        })
        .collect();

    // Every reader has resolved the name once before reconfiguration starts
    ready.wait();
    for i in 0..20 {
        let lower = Arc::new(MemoryFs::new(100 + i));
        sb.add_branch(1, BranchSource::new(lower, BranchPerm::Ro, format!("l{}", i)))
            .unwrap();
        sb.remove_branch(1).unwrap();
    }
    stop.store(true, Ordering::SeqCst);

    let total: usize = readers.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(total >= READERS);
    assert_eq!(sb.branch_count(), 1);
    assert_eq!(sb.sigen(), 41);
    assert!(lookup_f(&sb));
}
