//! In-memory branch
//!
//! A scratch tree for tests and embedders. Mutations mimic what a host
//! filesystem can do behind the union's back: rename, unlink, hardlink, and
//! replacing an object in place with a reused inode number.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::backing::{BackingFs, BackingInode, FileKind};

const ROOT_INO: u64 = 1;

struct MemNode {
    inode: Arc<BackingInode>,
    children: BTreeMap<OsString, u64>,
}

struct MemTree {
    nodes: HashMap<u64, MemNode>,
    next_ino: u64,
}

impl MemTree {
    fn node(&self, ino: u64) -> Result<&MemNode> {
        self.nodes
            .get(&ino)
            .ok_or_else(|| Error::PathNotFound(format!("inode {}", ino)))
    }

    fn resolve(&self, path: &Path) -> Result<u64> {
        let mut ino = ROOT_INO;
        for component in path.components() {
            match component {
                Component::Normal(name) => {
                    ino = *self
                        .node(ino)?
                        .children
                        .get(name)
                        .ok_or_else(|| Error::PathNotFound(path.to_string_lossy().to_string()))?;
                }
                Component::RootDir | Component::CurDir => {}
                _ => return Err(Error::PathNotFound(path.to_string_lossy().to_string())),
            }
        }
        Ok(ino)
    }

    fn split(path: &Path) -> Result<(&Path, &OsStr)> {
        let name = path
            .file_name()
            .ok_or_else(|| Error::PathNotFound(path.to_string_lossy().to_string()))?;
        Ok((path.parent().unwrap_or(Path::new("")), name))
    }

    fn dir_of(&self, path: &Path) -> Result<u64> {
        let ino = self.resolve(path)?;
        if !self.node(ino)?.inode.is_dir() {
            return Err(Error::NotADirectory(path.to_string_lossy().to_string()));
        }
        Ok(ino)
    }

    fn set_nlink(&mut self, ino: u64, delta: i64) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            let mut inode = (*node.inode).clone();
            inode.nlink = (inode.nlink as i64 + delta).max(0) as u32;
            node.inode = Arc::new(inode);
        }
    }
}

/// Branch held entirely in memory
pub struct MemoryFs {
    dev: u64,
    read_only: bool,
    tree: RwLock<MemTree>,
}

impl std::fmt::Debug for MemoryFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFs")
            .field("dev", &self.dev)
            .field("read_only", &self.read_only)
            .field("nodes", &self.tree.read().nodes.len())
            .finish()
    }
}

impl MemoryFs {
    /// Empty writable tree on device `dev`
    pub fn new(dev: u64) -> Self {
        let root = BackingInode {
            dev,
            ino: ROOT_INO,
            generation: 0,
            kind: FileKind::Directory,
            nlink: 2,
            path: PathBuf::new(),
        };
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INO,
            MemNode {
                inode: Arc::new(root),
                children: BTreeMap::new(),
            },
        );
        Self {
            dev,
            read_only: false,
            tree: RwLock::new(MemTree {
                nodes,
                next_ino: ROOT_INO + 1,
            }),
        }
    }

    /// A branch whose host refuses writes
    pub fn read_only(dev: u64) -> Self {
        Self {
            read_only: true,
            ..Self::new(dev)
        }
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Create an object at `path`; the parent must exist
    pub fn create(&self, path: impl AsRef<Path>, kind: FileKind) -> Result<Arc<BackingInode>> {
        let path = path.as_ref();
        let mut tree = self.tree.write();
        let (parent, name) = MemTree::split(path)?;
        let dir = tree.dir_of(parent)?;
        if tree.node(dir)?.children.contains_key(name) {
            return Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::AlreadyExists,
            )));
        }

        let ino = tree.next_ino;
        tree.next_ino += 1;
        let inode = Arc::new(BackingInode {
            dev: self.dev,
            ino,
            generation: 0,
            kind,
            nlink: if kind.is_dir() { 2 } else { 1 },
            path: path.to_path_buf(),
        });
        tree.nodes.insert(
            ino,
            MemNode {
                inode: Arc::clone(&inode),
                children: BTreeMap::new(),
            },
        );
        if let Some(node) = tree.nodes.get_mut(&dir) {
            node.children.insert(name.to_os_string(), ino);
        }
        Ok(inode)
    }

    /// Create a directory; the parent must exist
    pub fn mkdir(&self, path: impl AsRef<Path>) -> Result<Arc<BackingInode>> {
        self.create(path, FileKind::Directory)
    }

    /// Create every missing directory along `path`
    pub fn mkdir_all(&self, path: impl AsRef<Path>) -> Result<Arc<BackingInode>> {
        let mut current = PathBuf::new();
        let mut last = self.root()?;
        for component in path.as_ref().components() {
            if let Component::Normal(name) = component {
                current.push(name);
                last = match self.get(&current) {
                    Some(existing) => existing,
                    None => self.mkdir(&current)?,
                };
            }
        }
        Ok(last)
    }

    /// Current object at `path`, if any
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<BackingInode>> {
        let tree = self.tree.read();
        let ino = tree.resolve(path.as_ref()).ok()?;
        tree.nodes.get(&ino).map(|n| Arc::clone(&n.inode))
    }

    /// Move an entry, keeping its identity
    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let mut tree = self.tree.write();
        let (from_parent, from_name) = MemTree::split(from.as_ref())?;
        let (to_parent, to_name) = MemTree::split(to.as_ref())?;
        let src_dir = tree.dir_of(from_parent)?;
        let dst_dir = tree.dir_of(to_parent)?;

        let ino = tree
            .nodes
            .get_mut(&src_dir)
            .and_then(|n| n.children.remove(from_name))
            .ok_or_else(|| Error::PathNotFound(from.as_ref().to_string_lossy().to_string()))?;
        let replaced = tree
            .nodes
            .get_mut(&dst_dir)
            .and_then(|n| n.children.insert(to_name.to_os_string(), ino));
        if let Some(old) = replaced {
            tree.set_nlink(old, -1);
        }
        Ok(())
    }

    /// Remove an entry
    pub fn unlink(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut tree = self.tree.write();
        let (parent, name) = MemTree::split(path.as_ref())?;
        let dir = tree.dir_of(parent)?;
        let ino = tree
            .nodes
            .get_mut(&dir)
            .and_then(|n| n.children.remove(name))
            .ok_or_else(|| Error::PathNotFound(path.as_ref().to_string_lossy().to_string()))?;
        tree.set_nlink(ino, -1);
        Ok(())
    }

    /// Hardlink `existing` at `new`
    pub fn link(&self, existing: impl AsRef<Path>, new: impl AsRef<Path>) -> Result<Arc<BackingInode>> {
        let mut tree = self.tree.write();
        let ino = tree.resolve(existing.as_ref())?;
        let (parent, name) = MemTree::split(new.as_ref())?;
        let dir = tree.dir_of(parent)?;
        if let Some(node) = tree.nodes.get_mut(&dir) {
            node.children.insert(name.to_os_string(), ino);
        }
        tree.set_nlink(ino, 1);
        Ok(Arc::clone(&tree.node(ino)?.inode))
    }

    /// Replace the object at `path` with a new one reusing its inode number
    pub fn replace(&self, path: impl AsRef<Path>) -> Result<Arc<BackingInode>> {
        let mut tree = self.tree.write();
        let ino = tree.resolve(path.as_ref())?;
        let node = tree
            .nodes
            .get_mut(&ino)
            .ok_or_else(|| Error::PathNotFound(path.as_ref().to_string_lossy().to_string()))?;
        let mut inode = (*node.inode).clone();
        inode.generation = inode.generation.wrapping_add(1);
        node.inode = Arc::new(inode);
        node.children.clear();
        Ok(Arc::clone(&node.inode))
    }
}

impl BackingFs for MemoryFs {
    fn root(&self) -> Result<Arc<BackingInode>> {
        let tree = self.tree.read();
        Ok(Arc::clone(&tree.node(ROOT_INO)?.inode))
    }

    fn lookup(&self, dir: &BackingInode, name: &OsStr) -> Result<Option<Arc<BackingInode>>> {
        let tree = self.tree.read();
        let node = match tree.nodes.get(&dir.ino) {
            Some(node) if node.inode.same_object(dir) => node,
            _ => return Ok(None),
        };
        if !node.inode.is_dir() {
            return Err(Error::NotADirectory(dir.path.to_string_lossy().to_string()));
        }
        Ok(node
            .children
            .get(name)
            .and_then(|ino| tree.nodes.get(ino))
            .map(|child| Arc::clone(&child.inode)))
    }

    fn revalidate(&self, inode: &BackingInode) -> Result<Option<Arc<BackingInode>>> {
        let tree = self.tree.read();
        Ok(tree
            .nodes
            .get(&inode.ino)
            .filter(|n| n.inode.same_object(inode) && (n.inode.nlink > 0 || n.inode.ino == ROOT_INO))
            .map(|n| Arc::clone(&n.inode)))
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_lookup() {
        let fs = MemoryFs::new(7);
        fs.mkdir_all("a/b").unwrap();
        let file = fs.create("a/b/f", FileKind::RegularFile).unwrap();

        let b = fs.get("a/b").unwrap();
        let found = fs.lookup(&b, OsStr::new("f")).unwrap().unwrap();
        assert!(found.same_object(&file));
        assert_eq!(found.dev, 7);
        assert!(fs.lookup(&b, OsStr::new("g")).unwrap().is_none());
    }

    #[test]
    fn test_rename_moves_entry() {
        let fs = MemoryFs::new(1);
        fs.mkdir("d").unwrap();
        let f = fs.create("d/x", FileKind::RegularFile).unwrap();
        fs.rename("d/x", "y").unwrap();

        let d = fs.get("d").unwrap();
        assert!(fs.lookup(&d, OsStr::new("x")).unwrap().is_none());
        assert!(fs.get("y").unwrap().same_object(&f));
    }

    #[test]
    fn test_link_counts() {
        let fs = MemoryFs::new(1);
        fs.create("f1", FileKind::RegularFile).unwrap();
        let linked = fs.link("f1", "f2").unwrap();
        assert_eq!(linked.nlink, 2);

        fs.unlink("f1").unwrap();
        assert_eq!(fs.get("f2").unwrap().nlink, 1);
    }

    #[test]
    fn test_replace_bumps_generation() {
        let fs = MemoryFs::new(1);
        let old = fs.create("f", FileKind::RegularFile).unwrap();
        let new = fs.replace("f").unwrap();

        assert_eq!(old.ino, new.ino);
        assert!(!old.same_object(&new));
        assert!(fs.revalidate(&old).unwrap().is_none());
        assert!(fs.revalidate(&new).unwrap().is_some());
    }

    #[test]
    fn test_create_requires_parent() {
        let fs = MemoryFs::new(1);
        assert!(fs.create("missing/f", FileKind::RegularFile).is_err());
        fs.create("f", FileKind::RegularFile).unwrap();
        assert!(fs.create("f", FileKind::RegularFile).is_err());
    }
}
