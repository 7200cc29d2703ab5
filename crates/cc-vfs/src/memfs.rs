// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Writable in-memory tree.
//!
//! Used as the mutable upper layer of a running instance: guest writes land
//! here, deletions become whiteout tombstones, and a snapshot serializes
//! the whole tree into a new archive layer. Files carry their own lock;
//! directory maps carry theirs. Tombstones are visible through
//! [`MemFs::lookup_raw`] so an overlay union can mask lower layers, but are
//! never surfaced by the [`DirOps`] listing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::{DirEntry, DirOps, FileOps, FsError, FsResult, Node, NodeKind, Owner, Stat, SymlinkOps};

#[derive(Clone, Copy, Debug)]
struct Meta {
    mode: u32,
    mod_time: i64,
    owner: Option<Owner>,
}

/// One node in the writable tree. `Whiteout` is a deletion tombstone.
#[derive(Clone)]
pub enum MemNode {
    Dir(Arc<MemDir>),
    File(Arc<MemFile>),
    Symlink(Arc<MemSymlink>),
    Whiteout,
}

impl MemNode {
    pub fn to_node(&self) -> Option<Node> {
        match self {
            MemNode::Dir(d) => Some(Node::Dir(d.clone() as Arc<dyn DirOps>)),
            MemNode::File(f) => Some(Node::File(f.clone() as Arc<dyn FileOps>)),
            MemNode::Symlink(s) => Some(Node::Symlink(s.clone() as Arc<dyn SymlinkOps>)),
            MemNode::Whiteout => None,
        }
    }
}

pub struct MemDir {
    meta: Mutex<Meta>,
    entries: RwLock<BTreeMap<String, MemNode>>,
}

impl MemDir {
    fn new(mode: u32, mod_time: i64) -> Arc<Self> {
        Arc::new(MemDir {
            meta: Mutex::new(Meta {
                mode,
                mod_time,
                owner: None,
            }),
            entries: RwLock::new(BTreeMap::new()),
        })
    }

    fn get(&self, name: &str) -> Option<MemNode> {
        self.entries.read().unwrap().get(name).cloned()
    }

    fn insert(&self, name: &str, node: MemNode) {
        self.entries.write().unwrap().insert(name.to_string(), node);
    }

    /// Snapshot of the raw child map, tombstones included.
    pub fn entries_raw(&self) -> Vec<(String, MemNode)> {
        self.entries.read().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl DirOps for MemDir {
    fn stat(&self) -> FsResult<Stat> {
        let meta = self.meta.lock().unwrap();
        Ok(Stat {
            size: 0,
            mode: meta.mode,
            mod_time: meta.mod_time,
            owner: meta.owner,
        })
    }

    fn read_dir(&self) -> FsResult<Vec<DirEntry>> {
        let entries = self.entries.read().unwrap();
        let mut out = Vec::with_capacity(entries.len());
        for (name, node) in entries.iter() {
            let node = match node.to_node() {
                Some(n) => n,
                None => continue,
            };
            out.push(DirEntry {
                name: name.clone(),
                kind: node.kind(),
                stat: node.stat()?,
            });
        }
        Ok(out)
    }

    fn lookup(&self, name: &str) -> FsResult<Node> {
        match self.get(name) {
            Some(node) => node.to_node().ok_or(FsError::NotFound),
            None => Err(FsError::NotFound),
        }
    }
}

pub struct MemFile {
    meta: Mutex<Meta>,
    data: RwLock<Vec<u8>>,
}

impl MemFile {
    fn new(data: Vec<u8>, mode: u32, mod_time: i64) -> Arc<Self> {
        Arc::new(MemFile {
            meta: Mutex::new(Meta {
                mode,
                mod_time,
                owner: None,
            }),
            data: RwLock::new(data),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }
}

impl FileOps for MemFile {
    fn stat(&self) -> FsResult<Stat> {
        let meta = self.meta.lock().unwrap();
        Ok(Stat {
            size: self.data.read().unwrap().len() as u64,
            mode: meta.mode,
            mod_time: meta.mod_time,
            owner: meta.owner,
        })
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let data = self.data.read().unwrap();
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> FsResult<usize> {
        let mut held = self.data.write().unwrap();
        let end = offset as usize + data.len();
        if end > held.len() {
            held.resize(end, 0);
        }
        held[offset as usize..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn truncate(&self, len: u64) -> FsResult<()> {
        self.data.write().unwrap().resize(len as usize, 0);
        Ok(())
    }
}

pub struct MemSymlink {
    meta: Mutex<Meta>,
    target: String,
}

impl SymlinkOps for MemSymlink {
    fn stat(&self) -> FsResult<Stat> {
        let meta = self.meta.lock().unwrap();
        Ok(Stat {
            size: self.target.len() as u64,
            mode: meta.mode,
            mod_time: meta.mod_time,
            owner: meta.owner,
        })
    }

    fn target(&self) -> FsResult<String> {
        Ok(self.target.clone())
    }
}

/// The writable tree. Paths are `/`-separated and already normalized
/// (no leading slash, no `.` components).
pub struct MemFs {
    root: Arc<MemDir>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        MemFs {
            root: MemDir::new(0o755, 0),
        }
    }

    pub fn root(&self) -> Arc<MemDir> {
        self.root.clone()
    }

    /// Raw lookup that surfaces whiteout tombstones.
    pub fn lookup_raw(&self, path: &str) -> Option<MemNode> {
        if path.is_empty() || path == "." {
            return Some(MemNode::Dir(self.root.clone()));
        }
        let mut dir = self.root.clone();
        let mut components = path.split('/').peekable();
        while let Some(component) = components.next() {
            let node = dir.get(component)?;
            if components.peek().is_none() {
                return Some(node);
            }
            match node {
                MemNode::Dir(d) => dir = d,
                _ => return None,
            }
        }
        None
    }

    /// Create a file at `path`, creating intermediate directories. An
    /// existing node (including a tombstone) at the path is replaced.
    pub fn write_file(&self, path: &str, data: &[u8], mode: u32, mod_time: i64) -> FsResult<()> {
        let (dir, name) = self.parent_dir(path, mod_time)?;
        dir.insert(name, MemNode::File(MemFile::new(data.to_vec(), mode, mod_time)));
        Ok(())
    }

    pub fn symlink(&self, path: &str, target: &str, mod_time: i64) -> FsResult<()> {
        let (dir, name) = self.parent_dir(path, mod_time)?;
        dir.insert(
            name,
            MemNode::Symlink(Arc::new(MemSymlink {
                meta: Mutex::new(Meta {
                    mode: 0o777,
                    mod_time,
                    owner: None,
                }),
                target: target.to_string(),
            })),
        );
        Ok(())
    }

    pub fn make_dir_all(&self, path: &str, mode: u32, mod_time: i64) -> FsResult<Arc<MemDir>> {
        if path.is_empty() || path == "." {
            return Ok(self.root.clone());
        }
        let mut dir = self.root.clone();
        for component in path.split('/') {
            if component.is_empty() {
                return Err(FsError::InvalidName);
            }
            let existing = dir.get(component);
            dir = match existing {
                Some(MemNode::Dir(d)) => d,
                Some(MemNode::File(_)) | Some(MemNode::Symlink(_)) => {
                    return Err(FsError::NotADirectory);
                }
                Some(MemNode::Whiteout) | None => {
                    let child = MemDir::new(mode, mod_time);
                    dir.insert(component, MemNode::Dir(child.clone()));
                    child
                }
            };
        }
        Ok(dir)
    }

    /// Replace whatever is at `path` with a whiteout tombstone.
    pub fn remove(&self, path: &str, mod_time: i64) -> FsResult<()> {
        let (dir, name) = self.parent_dir(path, mod_time)?;
        dir.insert(name, MemNode::Whiteout);
        Ok(())
    }

    /// Pre-order walk over every node including tombstones, with
    /// `/`-separated paths relative to the root.
    pub fn walk(&self, f: &mut dyn FnMut(&str, &MemNode)) {
        fn visit(prefix: &str, dir: &MemDir, f: &mut dyn FnMut(&str, &MemNode)) {
            let entries = dir.entries.read().unwrap().clone();
            for (name, node) in entries.iter() {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", prefix, name)
                };
                f(&path, node);
                if let MemNode::Dir(d) = node {
                    visit(&path, d, f);
                }
            }
        }
        visit("", &self.root, f);
    }

    pub fn is_empty(&self) -> bool {
        self.root.entries.read().unwrap().is_empty()
    }

    fn parent_dir<'p>(&self, path: &'p str, mod_time: i64) -> FsResult<(Arc<MemDir>, &'p str)> {
        let (parent, name) = match path.rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", path),
        };
        if name.is_empty() {
            return Err(FsError::InvalidName);
        }
        let dir = self.make_dir_all(parent, 0o755, mod_time)?;
        Ok((dir, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_parents_and_reads_back() {
        let fs = MemFs::new();
        fs.write_file("etc/cc/config", b"hello", 0o644, 10).unwrap();

        let node = fs.lookup_raw("etc/cc/config").unwrap().to_node().unwrap();
        assert_eq!(node.read_all().unwrap(), b"hello");
        assert_eq!(node.stat().unwrap().mode, 0o644);

        let etc = fs.lookup_raw("etc").unwrap().to_node().unwrap();
        let listing = etc.as_dir().unwrap().read_dir().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "cc");
        assert_eq!(listing[0].kind, NodeKind::Dir);
    }

    #[test]
    fn remove_leaves_tombstone_hidden_from_listing() {
        let fs = MemFs::new();
        fs.write_file("a/b", b"x", 0o644, 0).unwrap();
        fs.remove("a/b", 1).unwrap();

        assert!(matches!(fs.lookup_raw("a/b"), Some(MemNode::Whiteout)));
        let a = fs.lookup_raw("a").unwrap().to_node().unwrap();
        assert!(a.as_dir().unwrap().read_dir().unwrap().is_empty());
    }

    #[test]
    fn write_at_extends_file() {
        let fs = MemFs::new();
        fs.write_file("f", b"abc", 0o600, 0).unwrap();
        let node = fs.lookup_raw("f").unwrap().to_node().unwrap();
        let file = node.as_file().unwrap();
        file.write_at(b"ZZ", 2).unwrap();
        assert_eq!(node.read_all().unwrap(), b"abZZ");
        file.truncate(1).unwrap();
        assert_eq!(node.read_all().unwrap(), b"a");
    }

    #[test]
    fn walk_visits_tombstones() {
        let fs = MemFs::new();
        fs.write_file("keep", b"1", 0o644, 0).unwrap();
        fs.remove("gone", 0).unwrap();
        let mut seen = Vec::new();
        fs.walk(&mut |path, node| {
            seen.push((path.to_string(), matches!(node, MemNode::Whiteout)));
        });
        assert!(seen.contains(&("keep".to_string(), false)));
        assert!(seen.contains(&("gone".to_string(), true)));
    }
}
