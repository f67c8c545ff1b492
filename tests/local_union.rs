//! End-to-end tests over host directory branches

use stackfs::branch::{BackingFs, BranchPerm, FileKind, MemoryFs};
use stackfs::config::{BranchConfig, UnionConfig};
use stackfs::inode::Freshness;
use stackfs::lock::LockClass;
use stackfs::pin::{BranchPin, PinFlags, PinPair, PinRequest, PinTarget};
use stackfs::union::BranchSource;
use stackfs::{Error, UnionFs};
use std::ffi::OsStr;
use std::fs;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

struct Layers {
    upper: TempDir,
    lower: TempDir,
}

fn layers() -> Layers {
    let upper = tempdir().unwrap();
    let lower = tempdir().unwrap();
    fs::create_dir(upper.path().join("docs")).unwrap();
    fs::create_dir(lower.path().join("docs")).unwrap();
    fs::write(lower.path().join("docs/readme.txt"), b"lower").unwrap();
    fs::write(upper.path().join("notes.txt"), b"upper").unwrap();
    Layers { upper, lower }
}

fn config(l: &Layers) -> UnionConfig {
    UnionConfig {
        branches: vec![
            BranchConfig::new(l.upper.path(), BranchPerm::Rw),
            BranchConfig::new(l.lower.path(), BranchPerm::Ro),
        ],
        ..UnionConfig::default()
    }
}

#[test]
fn test_mount_from_config_file() {
    let l = layers();
    let dir = tempdir().unwrap();
    let path = dir.path().join("stackfs.json");
    config(&l).save(&path).unwrap();

    let sb = UnionFs::new(UnionConfig::load(&path).unwrap()).unwrap();
    assert_eq!(sb.branch_count(), 2);
    assert_eq!(sb.branch(1).unwrap().perm(), BranchPerm::Ro);
}

#[test]
fn test_missing_branch_root() {
    let l = layers();
    let mut config = config(&l);
    config.branches.push(BranchConfig::new("/definitely/not/here", BranchPerm::Ro));
    assert!(matches!(UnionFs::new(config), Err(Error::PathNotFound(_))));
}

#[test]
fn test_lookup_across_branches() {
    let l = layers();
    let sb = UnionFs::new(config(&l)).unwrap();

    let docs = sb.lookup(sb.root(), OsStr::new("docs")).unwrap().unwrap().inode;
    assert!(docs.is_dir());
    {
        let info = docs.read_lock(LockClass::Child);
        assert_eq!((info.bstart(), info.bend()), (Some(0), Some(1)));
    }

    let readme = sb.lookup(&docs, OsStr::new("readme.txt")).unwrap().unwrap().inode;
    assert_eq!(readme.kind(), FileKind::RegularFile);
    assert_eq!(readme.read_lock(LockClass::Child).bstart(), Some(1));

    let notes = sb.lookup(sb.root(), OsStr::new("notes.txt")).unwrap().unwrap();
    let again = sb.lookup(sb.root(), OsStr::new("notes.txt")).unwrap().unwrap();
    assert!(Arc::ptr_eq(&notes.inode, &again.inode));
    assert_ne!(notes.inode.ino(), readme.ino());
}

#[test]
fn test_create_under_pin() {
    let l = layers();
    let sb = UnionFs::new(config(&l)).unwrap();
    let docs = sb.lookup(sb.root(), OsStr::new("docs")).unwrap().unwrap().inode;

    // Copy-up target: the upper branch, where the name does not exist yet
    let mut pin = BranchPin::new();
    pin.init(
        PinTarget::child(Arc::clone(&docs), "readme.txt", None),
        0,
        LockClass::Parent,
        LockClass::Parent,
        PinFlags::MNT_WRITE,
    );
    pin.acquire(&sb).unwrap();
    let h_dir = pin.h_dir().unwrap().clone();
    let branch = pin.branch().unwrap().clone();

    fs::write(l.upper.path().join("docs/readme.txt"), b"copied").unwrap();
    let created = branch
        .fs()
        .lookup(&h_dir, OsStr::new("readme.txt"))
        .unwrap()
        .unwrap();
    pin.release();

    let readme = sb.lookup(&docs, OsStr::new("readme.txt")).unwrap().unwrap().inode;
    let info = readme.read_lock(LockClass::Child);
    assert_eq!(info.bstart(), Some(0));
    assert!(info.get(0).unwrap().same_object(&created));
}

#[test]
fn test_read_only_branch_refuses_write_pin() {
    let l = layers();
    let sb = UnionFs::new(config(&l)).unwrap();
    let docs = sb.lookup(sb.root(), OsStr::new("docs")).unwrap().unwrap().inode;

    let mut pin = BranchPin::new();
    pin.init(
        PinTarget::child(docs, "x", None),
        1,
        LockClass::Parent,
        LockClass::Parent,
        PinFlags::MNT_WRITE,
    );
    assert!(matches!(pin.acquire(&sb), Err(Error::ReadOnlyBranch { bindex: 1 })));
}

#[test]
fn test_rename_pair_across_directories() {
    let l = layers();
    fs::create_dir(l.upper.path().join("archive")).unwrap();
    let sb = UnionFs::new(config(&l)).unwrap();
    let docs = sb.lookup(sb.root(), OsStr::new("docs")).unwrap().unwrap().inode;
    let archive = sb.lookup(sb.root(), OsStr::new("archive")).unwrap().unwrap().inode;

    let pair = PinPair::acquire(
        &sb,
        PinRequest::new(PinTarget::child(Arc::clone(&archive), "a", None), 0, PinFlags::MNT_WRITE),
        PinRequest::new(PinTarget::child(Arc::clone(&docs), "b", None), 0, PinFlags::MNT_WRITE),
    )
    .unwrap();
    assert!(!pair.is_shared());
    assert!(pair.a().h_dir().unwrap().same_object(
        &sb.branch(0)
            .unwrap()
            .fs()
            .lookup(&sb.branch(0).unwrap().fs().root().unwrap(), OsStr::new("archive"))
            .unwrap()
            .unwrap()
    ));
    assert_eq!(sb.stats().pinned_dirs, 2);
    assert_eq!(sb.stats().writers, 2);
    drop(pair);
    assert_eq!(sb.stats().pinned_dirs, 0);
}

#[test]
fn test_branch_reconfiguration_with_memory_layer() {
    let l = layers();
    let sb = UnionFs::new(config(&l)).unwrap();
    let docs = sb.lookup(sb.root(), OsStr::new("docs")).unwrap().unwrap().inode;
    let cached = docs.stamp();

    let scratch = Arc::new(MemoryFs::new(77));
    scratch.mkdir("docs").unwrap();
    let id = sb
        .add_branch(0, BranchSource::new(scratch as Arc<dyn BackingFs>, BranchPerm::Rw, "scratch"))
        .unwrap();
    assert_eq!(sb.branch(0).unwrap().id(), id);

    // Existing shadows moved down one slot
    {
        let info = docs.read_lock(LockClass::Child);
        assert_eq!((info.bstart(), info.bend()), (Some(1), Some(2)));
    }
    assert_eq!(docs.generation().state(sb.sigen()), Freshness::Consistent);
    assert!(matches!(cached.revalidate(), Err(Error::StaleGeneration { .. })));

    sb.remove_branch(2).unwrap();
    let info = docs.read_lock(LockClass::Child);
    assert_eq!((info.bstart(), info.bend()), (Some(1), Some(1)));
    drop(info);

    sb.teardown().unwrap();
}
