//! Backing filesystem seam
//!
//! A branch is served by some host filesystem driver. The union core only
//! needs to look names up and to re-read an object it already knows, so that
//! is all the trait asks for.

use crate::error::Result;
use std::ffi::OsStr;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Kind of a backing object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for FileKind {
    fn from(ft: std::fs::FileType) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if ft.is_block_device() {
                return FileKind::BlockDevice;
            } else if ft.is_char_device() {
                return FileKind::CharDevice;
            } else if ft.is_fifo() {
                return FileKind::Fifo;
            } else if ft.is_socket() {
                return FileKind::Socket;
            }
        }
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::RegularFile
        }
    }
}

impl FileKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, FileKind::Directory)
    }
}

/// Host-assigned identity of a backing object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackingIdentity {
    pub dev: u64,
    pub ino: u64,
    pub generation: u32,
}

/// Snapshot of a backing inode as the host filesystem reported it
#[derive(Debug, Clone)]
pub struct BackingInode {
    /// Device (backing superblock) id
    pub dev: u64,
    /// Backing inode number
    pub ino: u64,
    /// Host generation; changes when an inode number is reused
    pub generation: u32,
    pub kind: FileKind,
    pub nlink: u32,
    /// Branch-relative path this object was found at
    pub path: PathBuf,
}

impl BackingInode {
    pub fn identity(&self) -> BackingIdentity {
        BackingIdentity {
            dev: self.dev,
            ino: self.ino,
            generation: self.generation,
        }
    }

    /// Same host object, regardless of which lookup produced the snapshot
    pub fn same_object(&self, other: &BackingInode) -> bool {
        self.identity() == other.identity()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Host filesystem serving one branch
pub trait BackingFs: Send + Sync + fmt::Debug {
    /// Root directory of the branch
    fn root(&self) -> Result<Arc<BackingInode>>;

    /// Look `name` up in `dir`; `Ok(None)` for a negative entry
    fn lookup(&self, dir: &BackingInode, name: &OsStr) -> Result<Option<Arc<BackingInode>>>;

    /// Re-read an object; `Ok(None)` if it no longer exists
    fn revalidate(&self, inode: &BackingInode) -> Result<Option<Arc<BackingInode>>>;

    /// Whether the host itself refuses writes
    fn is_read_only(&self) -> bool {
        false
    }
}
