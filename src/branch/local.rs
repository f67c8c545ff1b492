//! Pass-through branch over a local directory tree

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use super::backing::{BackingFs, BackingInode, FileKind};

/// Branch backed by a directory on the host
#[derive(Debug)]
pub struct LocalFs {
    /// Root path of the branch
    root: PathBuf,
    read_only: bool,
}

impl LocalFs {
    /// Branch over the host directory `root`
    pub fn new(root: PathBuf, read_only: bool) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::PathNotFound(root.to_string_lossy().to_string()));
        }
        Ok(Self { root, read_only })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Resolve a branch-relative path to an absolute host path
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.root.join(relative)
    }

    fn stat(&self, path: &Path) -> Result<Option<Arc<BackingInode>>> {
        match fs::symlink_metadata(self.resolve(path)) {
            Ok(meta) => Ok(Some(Arc::new(Self::to_backing(path.to_path_buf(), &meta)))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    #[cfg(unix)]
    fn to_backing(path: PathBuf, meta: &Metadata) -> BackingInode {
        use std::os::unix::fs::MetadataExt;
        BackingInode {
            dev: meta.dev(),
            ino: meta.ino(),
            generation: birth_generation(meta),
            kind: FileKind::from(meta.file_type()),
            nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
            path,
        }
    }

    #[cfg(not(unix))]
    fn to_backing(path: PathBuf, meta: &Metadata) -> BackingInode {
        BackingInode {
            dev: 0,
            ino: 0,
            generation: birth_generation(meta),
            kind: FileKind::from(meta.file_type()),
            nlink: 1,
            path,
        }
    }
}

/// std does not expose i_generation; birth time is the closest stand-in
fn birth_generation(meta: &Metadata) -> u32 {
    meta.created()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| (d.as_secs() as u32) ^ d.subsec_nanos())
        .unwrap_or(0)
}

impl BackingFs for LocalFs {
    fn root(&self) -> Result<Arc<BackingInode>> {
        self.stat(Path::new(""))?
            .ok_or_else(|| Error::PathNotFound(self.root.to_string_lossy().to_string()))
    }

    fn lookup(&self, dir: &BackingInode, name: &OsStr) -> Result<Option<Arc<BackingInode>>> {
        if !dir.is_dir() {
            return Err(Error::NotADirectory(dir.path.to_string_lossy().to_string()));
        }
        self.stat(&dir.path.join(name))
    }

    fn revalidate(&self, inode: &BackingInode) -> Result<Option<Arc<BackingInode>>> {
        Ok(self.stat(&inode.path)?.filter(|live| live.same_object(inode)))
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
