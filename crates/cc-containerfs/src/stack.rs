// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The layer union: top-down name resolution with whiteout and opaque
//! directory semantics.

use std::collections::HashSet;
use std::sync::Arc;

use cc_archive::{Archive, Entry, EntryKind, EntryReader};
use cc_vfs::{DirEntry, DirOps, FileOps, FsError, FsResult, Node, NodeKind, Owner, Stat, SymlinkOps};

use crate::{basename_of, join, normalize, parent_of, whiteout};

/// An ordered stack of archive layers, index 0 bottom-most.
pub struct LayerStack {
    layers: Vec<Arc<Archive>>,
}

impl LayerStack {
    pub fn new(layers: Vec<Arc<Archive>>) -> Arc<Self> {
        Arc::new(LayerStack { layers })
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Root directory node of the merged view.
    pub fn root(self: &Arc<Self>) -> Node {
        Node::Dir(Arc::new(StackDir {
            stack: self.clone(),
            path: ".".to_string(),
            stat: self.explicit_dir_stat("."),
        }))
    }

    /// Resolve a full path to a node, topmost layer first.
    pub fn lookup(self: &Arc<Self>, path: &str) -> FsResult<Node> {
        let path = normalize(path);
        if path == "." {
            return Ok(self.root());
        }
        // The opaque marker is never surfaced.
        if basename_of(&path) == whiteout::OPAQUE {
            return Err(FsError::NotFound);
        }

        let parent = parent_of(&path).to_string();
        for layer in self.layers.iter().rev() {
            if let Some(entry) = layer.lookup(&path) {
                if entry.kind == EntryKind::Deleted {
                    return Err(FsError::NotFound);
                }
                return self.materialize(layer, entry);
            }
            if self.has_descendants(layer, &path) {
                return Ok(Node::Dir(Arc::new(StackDir {
                    stack: self.clone(),
                    path,
                    stat: None,
                })));
            }
            // An opaque parent in this layer masks everything below.
            if LayerStack::is_opaque(layer, &parent) {
                return Err(FsError::NotFound);
            }
        }
        Err(FsError::NotFound)
    }

    /// Merged directory listing at `path`.
    pub fn list_dir(self: &Arc<Self>, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = normalize(path);
        if path != "." {
            // Existence and shape check: must resolve to a directory.
            match self.lookup(&path)? {
                Node::Dir(_) => {}
                _ => return Err(FsError::NotADirectory),
            }
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut deleted: HashSet<String> = HashSet::new();
        let mut out: Vec<DirEntry> = Vec::new();

        for layer in self.layers.iter().rev() {
            let opaque = Self::is_opaque(layer, &path);

            for entry in layer.entries() {
                if entry.name == path || parent_of(&entry.name) != path {
                    continue;
                }
                let base = basename_of(&entry.name);
                if base == whiteout::OPAQUE {
                    continue;
                }
                if entry.kind == EntryKind::Deleted {
                    deleted.insert(base.to_string());
                    continue;
                }
                if entry.kind == EntryKind::Invalid {
                    continue;
                }
                if seen.contains(base) || deleted.contains(base) {
                    continue;
                }
                seen.insert(base.to_string());
                out.push(DirEntry {
                    name: base.to_string(),
                    kind: entry_node_kind(entry.kind),
                    stat: entry_stat(entry),
                });
            }

            // Layers converted from tar may omit intermediate directory
            // records; a deeper name implies the directory.
            for entry in layer.entries() {
                if entry.kind == EntryKind::Deleted {
                    continue;
                }
                let rest = match strip_dir_prefix(&entry.name, &path) {
                    Some(rest) => rest,
                    None => continue,
                };
                if let Some((first, _)) = rest.split_once('/') {
                    if first == whiteout::OPAQUE
                        || seen.contains(first)
                        || deleted.contains(first)
                    {
                        continue;
                    }
                    seen.insert(first.to_string());
                    out.push(DirEntry {
                        name: first.to_string(),
                        kind: NodeKind::Dir,
                        stat: Stat::new(0, 0o755, 0),
                    });
                }
            }

            if opaque {
                break;
            }
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn materialize(self: &Arc<Self>, layer: &Arc<Archive>, entry: &Entry) -> FsResult<Node> {
        match entry.kind {
            EntryKind::Regular | EntryKind::Extended => {
                let reader = layer.open_entry(entry).map_err(archive_io)?;
                Ok(Node::File(Arc::new(LayerFile {
                    reader,
                    stat: entry_stat(entry),
                })))
            }
            EntryKind::Directory => Ok(Node::Dir(Arc::new(StackDir {
                stack: self.clone(),
                path: entry.name.clone(),
                stat: Some(entry_stat(entry)),
            }))),
            EntryKind::Symlink | EntryKind::Hardlink => Ok(Node::Symlink(Arc::new(LayerSymlink {
                target: entry.link_name.clone(),
                stat: entry_stat(entry),
            }))),
            EntryKind::Invalid | EntryKind::Deleted => Err(FsError::NotFound),
        }
    }

    fn has_descendants(&self, layer: &Arc<Archive>, path: &str) -> bool {
        layer
            .entries()
            .iter()
            .any(|e| e.kind != EntryKind::Deleted && strip_dir_prefix(&e.name, path).is_some())
    }

    fn is_opaque(layer: &Arc<Archive>, dir: &str) -> bool {
        match layer.lookup(&join(dir, whiteout::OPAQUE)) {
            Some(entry) => entry.kind != EntryKind::Deleted,
            None => false,
        }
    }

    fn explicit_dir_stat(&self, path: &str) -> Option<Stat> {
        for layer in self.layers.iter().rev() {
            if let Some(entry) = layer.lookup(path) {
                if entry.kind == EntryKind::Directory {
                    return Some(entry_stat(entry));
                }
            }
        }
        None
    }
}

impl crate::resolve::PathLookup for Arc<LayerStack> {
    fn lookup_path(&self, path: &str) -> FsResult<Node> {
        self.lookup(path)
    }

    fn link_at(&self, path: &str) -> FsResult<Option<crate::resolve::LinkTarget>> {
        let path = normalize(path);
        if path == "." {
            return Ok(None);
        }
        let parent = parent_of(&path).to_string();
        for layer in self.layers.iter().rev() {
            if let Some(entry) = layer.lookup(&path) {
                return match entry.kind {
                    EntryKind::Symlink => Ok(Some(crate::resolve::LinkTarget {
                        target: entry.link_name.clone(),
                        root_relative: false,
                    })),
                    EntryKind::Hardlink => Ok(Some(crate::resolve::LinkTarget {
                        target: entry.link_name.clone(),
                        root_relative: true,
                    })),
                    EntryKind::Deleted => Err(FsError::NotFound),
                    _ => Ok(None),
                };
            }
            if self.has_descendants(layer, &path) {
                return Ok(None);
            }
            if LayerStack::is_opaque(layer, &parent) {
                return Err(FsError::NotFound);
            }
        }
        Err(FsError::NotFound)
    }
}

fn strip_dir_prefix<'n>(name: &'n str, dir: &str) -> Option<&'n str> {
    if dir == "." {
        return Some(name);
    }
    name.strip_prefix(dir)?.strip_prefix('/')
}

fn entry_node_kind(kind: EntryKind) -> NodeKind {
    match kind {
        EntryKind::Directory => NodeKind::Dir,
        EntryKind::Symlink | EntryKind::Hardlink => NodeKind::Symlink,
        _ => NodeKind::File,
    }
}

fn entry_stat(entry: &Entry) -> Stat {
    Stat {
        size: entry.size,
        mode: entry.mode,
        mod_time: entry.mod_time,
        owner: Some(Owner {
            uid: entry.uid,
            gid: entry.gid,
        }),
    }
}

fn archive_io(err: cc_archive::ArchiveError) -> FsError {
    FsError::Io(std::io::Error::other(err))
}

/// Directory node over the merged view at a fixed path.
pub struct StackDir {
    stack: Arc<LayerStack>,
    path: String,
    /// Stat of the topmost explicit directory entry; implicit directories
    /// synthesize one.
    stat: Option<Stat>,
}

impl DirOps for StackDir {
    fn stat(&self) -> FsResult<Stat> {
        Ok(self.stat.unwrap_or_else(|| Stat::new(0, 0o755, 0)))
    }

    fn read_dir(&self) -> FsResult<Vec<DirEntry>> {
        self.stack.list_dir(&self.path)
    }

    fn lookup(&self, name: &str) -> FsResult<Node> {
        self.stack.lookup(&join(&self.path, name))
    }
}

struct LayerFile {
    reader: EntryReader,
    stat: Stat,
}

impl FileOps for LayerFile {
    fn stat(&self) -> FsResult<Stat> {
        Ok(self.stat)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        self.reader.read_at(buf, offset).map_err(archive_io)
    }
}

struct LayerSymlink {
    target: String,
    stat: Stat,
}

impl SymlinkOps for LayerSymlink {
    fn stat(&self) -> FsResult<Stat> {
        Ok(self.stat)
    }

    fn target(&self) -> FsResult<String> {
        Ok(self.target.clone())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use cc_archive::ArchiveWriter;
    use std::path::Path;

    pub enum Spec<'a> {
        File(&'a str, &'a [u8]),
        Dir(&'a str),
        Symlink(&'a str, &'a str),
        Hardlink(&'a str, &'a str),
        Deleted(&'a str),
        Opaque(&'a str),
    }

    pub fn layer(dir: &Path, name: &str, specs: &[Spec<'_>]) -> Arc<Archive> {
        let base = dir.join(name);
        let mut w = ArchiveWriter::create(&base).unwrap();
        for spec in specs {
            match spec {
                Spec::File(path, data) => {
                    let mut e = Entry::new(EntryKind::Regular, *path);
                    e.mode = 0o644;
                    w.append_data(e, *data).unwrap();
                }
                Spec::Dir(path) => {
                    let mut e = Entry::new(EntryKind::Directory, *path);
                    e.mode = 0o755;
                    w.append(e).unwrap();
                }
                Spec::Symlink(path, target) => {
                    let mut e = Entry::new(EntryKind::Symlink, *path);
                    e.link_name = target.to_string();
                    w.append(e).unwrap();
                }
                Spec::Hardlink(path, target) => {
                    let mut e = Entry::new(EntryKind::Hardlink, *path);
                    e.link_name = target.to_string();
                    w.append(e).unwrap();
                }
                Spec::Deleted(path) => {
                    w.append(Entry::new(EntryKind::Deleted, *path)).unwrap();
                }
                Spec::Opaque(dir) => {
                    let marker = join(&normalize(dir), whiteout::OPAQUE);
                    let mut e = Entry::new(EntryKind::Regular, marker.as_str());
                    e.mode = 0o644;
                    w.append_data(e, &b""[..]).unwrap();
                }
            }
        }
        w.finish().unwrap();
        Arc::new(Archive::open(&base).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{Spec, layer};
    use super::*;

    #[test]
    fn topmost_layer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base", &[Spec::File("etc/motd", b"old")]);
        let top = layer(dir.path(), "top", &[Spec::File("etc/motd", b"new")]);
        let stack = LayerStack::new(vec![base, top]);
        let node = stack.lookup("/etc/motd").unwrap();
        assert_eq!(node.read_all().unwrap(), b"new");
    }

    #[test]
    fn whiteout_masks_lower_layers() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(
            dir.path(),
            "base",
            &[Spec::Dir("a"), Spec::Dir("a/b"), Spec::File("a/b/c", b"x")],
        );
        let top = layer(dir.path(), "top", &[Spec::Deleted("a/b/c")]);
        let stack = LayerStack::new(vec![base, top]);

        assert!(matches!(stack.lookup("/a/b/c"), Err(FsError::NotFound)));
        let names: Vec<_> =
            stack.list_dir("/a/b").unwrap().into_iter().map(|e| e.name).collect();
        assert!(names.is_empty());
    }

    #[test]
    fn opaque_directory_hides_lower_entries() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(
            dir.path(),
            "base",
            &[Spec::Dir("d"), Spec::File("d/x", b"1"), Spec::File("d/y", b"2")],
        );
        let top = layer(
            dir.path(),
            "top",
            &[Spec::Dir("d"), Spec::Opaque("d"), Spec::File("d/z", b"3")],
        );
        let stack = LayerStack::new(vec![base, top]);

        let names: Vec<_> = stack.list_dir("/d").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["z"]);
        // Masked by the opaque marker even though only lower layers hold it.
        assert!(matches!(stack.lookup("/d/x"), Err(FsError::NotFound)));
        // The marker itself never surfaces.
        assert!(matches!(stack.lookup("d/.wh..wh..opq"), Err(FsError::NotFound)));
    }

    #[test]
    fn implicit_directories_materialize() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(dir.path(), "base", &[Spec::File("usr/lib/libc.so", b"elf")]);
        let stack = LayerStack::new(vec![base]);

        let usr = stack.lookup("usr").unwrap();
        assert_eq!(usr.kind(), NodeKind::Dir);
        let names: Vec<_> = stack.list_dir("usr").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["lib"]);
    }

    #[test]
    fn listing_merges_across_layers() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(
            dir.path(),
            "base",
            &[Spec::Dir("etc"), Spec::File("etc/a", b"1"), Spec::File("etc/b", b"2")],
        );
        let top = layer(
            dir.path(),
            "top",
            &[Spec::Dir("etc"), Spec::File("etc/b", b"2'"), Spec::File("etc/c", b"3")],
        );
        let stack = LayerStack::new(vec![base, top]);
        let names: Vec<_> = stack.list_dir("etc").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(stack.lookup("etc/b").unwrap().read_all().unwrap(), b"2'");
    }

    #[test]
    fn hardlinks_expose_target_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let base = layer(
            dir.path(),
            "base",
            &[Spec::File("bin/busybox", b"bb"), Spec::Hardlink("bin/sh", "bin/busybox")],
        );
        let stack = LayerStack::new(vec![base]);
        let node = stack.lookup("bin/sh").unwrap();
        assert_eq!(node.as_symlink().unwrap().target().unwrap(), "bin/busybox");
    }
}
