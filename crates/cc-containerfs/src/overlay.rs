// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Writable overlay: a mutable in-memory upper layer stacked over the
//! immutable archive layers. This is the live instance filesystem; its
//! accumulated changes serialize into a snapshot archive.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cc_archive::{ArchiveWriter, Entry, EntryKind};
use cc_vfs::{DirEntry, FsError, FsResult, MemFs, MemNode, Node, NodeKind, Stat};

use crate::resolve::{LinkTarget, PathLookup};
use crate::{LayerStack, normalize};

pub struct OverlayFs {
    stack: Arc<LayerStack>,
    upper: MemFs,
}

impl OverlayFs {
    pub fn new(stack: Arc<LayerStack>) -> Self {
        OverlayFs {
            stack,
            upper: MemFs::new(),
        }
    }

    pub fn stack(&self) -> &Arc<LayerStack> {
        &self.stack
    }

    pub fn upper(&self) -> &MemFs {
        &self.upper
    }

    /// Resolve `path` through the upper layer first, then the stack.
    pub fn lookup(&self, path: &str) -> FsResult<Node> {
        let path = normalize(path);
        match self.upper.lookup_raw(&path) {
            Some(MemNode::Whiteout) => Err(FsError::NotFound),
            Some(node) => node.to_node().ok_or(FsError::NotFound),
            None => self.stack.lookup(&path),
        }
    }

    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        self.lookup(path)?.read_all()
    }

    pub fn stat(&self, path: &str) -> FsResult<(NodeKind, Stat)> {
        let node = self.lookup(path)?;
        Ok((node.kind(), node.stat()?))
    }

    pub fn write_file(&self, path: &str, data: &[u8], mode: u32) -> FsResult<()> {
        let path = normalize(path);
        if path == "." {
            return Err(FsError::IsADirectory);
        }
        self.upper.write_file(&path, data, mode, unix_now())
    }

    /// Remove a path by recording a whiteout in the upper layer.
    pub fn remove(&self, path: &str) -> FsResult<()> {
        let path = normalize(path);
        // Only record a tombstone for something that currently resolves.
        self.lookup(&path)?;
        self.upper.remove(&path, unix_now())
    }

    /// Merged listing: upper entries shadow the stack; tombstones mask it.
    pub fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let path = normalize(path);

        let mut out: Vec<DirEntry> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut deleted: HashSet<String> = HashSet::new();
        let mut upper_is_dir = false;

        match self.upper.lookup_raw(&path) {
            Some(MemNode::Whiteout) => return Err(FsError::NotFound),
            Some(MemNode::File(_)) | Some(MemNode::Symlink(_)) => {
                return Err(FsError::NotADirectory);
            }
            Some(MemNode::Dir(dir)) => {
                upper_is_dir = true;
                for (name, node) in dir.entries_raw() {
                    match node.to_node() {
                        Some(n) => {
                            seen.insert(name.clone());
                            out.push(DirEntry {
                                name,
                                kind: n.kind(),
                                stat: n.stat()?,
                            });
                        }
                        None => {
                            deleted.insert(name);
                        }
                    }
                }
            }
            None => {}
        }

        match self.stack.list_dir(&path) {
            Ok(entries) => {
                for entry in entries {
                    if seen.contains(&entry.name) || deleted.contains(&entry.name) {
                        continue;
                    }
                    out.push(entry);
                }
            }
            // An upper-only directory has no counterpart below.
            Err(FsError::NotFound) | Err(FsError::NotADirectory) if upper_is_dir => {}
            Err(e) => return Err(e),
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

impl PathLookup for OverlayFs {
    fn lookup_path(&self, path: &str) -> FsResult<Node> {
        self.lookup(path)
    }

    fn link_at(&self, path: &str) -> FsResult<Option<LinkTarget>> {
        let path = normalize(path);
        match self.upper.lookup_raw(&path) {
            Some(MemNode::Whiteout) => Err(FsError::NotFound),
            Some(MemNode::Symlink(link)) => {
                use cc_vfs::SymlinkOps;
                Ok(Some(LinkTarget {
                    target: link.target()?,
                    root_relative: false,
                }))
            }
            Some(_) => Ok(None),
            None => self.stack.link_at(&path),
        }
    }
}

/// Serialize an upper layer into an archive, honoring exclude patterns.
/// Directory entries come first in walk order so the layer reimports
/// cleanly; tombstones become `deleted` entries.
pub fn write_upper_layer(
    upper: &MemFs,
    writer: &mut ArchiveWriter,
    excludes: &[String],
) -> cc_archive::Result<()> {
    let mut result = Ok(());
    let mut skipped: u64 = 0;
    upper.walk(&mut |path, node| {
        if result.is_err() {
            return;
        }
        if excluded(path, excludes) {
            skipped += 1;
            return;
        }
        result = append_node(writer, path, node);
    });
    if skipped > 0 {
        tracing::debug!(skipped, "snapshot excluded upper entries");
    }
    result
}

fn append_node(writer: &mut ArchiveWriter, path: &str, node: &MemNode) -> cc_archive::Result<()> {
    match node {
        MemNode::Whiteout => {
            writer.append(Entry::new(EntryKind::Deleted, path))?;
        }
        MemNode::Dir(dir) => {
            use cc_vfs::DirOps;
            let stat = dir.stat().map_err(fs_io)?;
            let mut entry = Entry::new(EntryKind::Directory, path);
            entry.mode = stat.mode;
            entry.mod_time = stat.mod_time;
            writer.append(entry)?;
        }
        MemNode::File(file) => {
            use cc_vfs::FileOps;
            let stat = file.stat().map_err(fs_io)?;
            let mut entry = Entry::new(EntryKind::Regular, path);
            entry.mode = stat.mode;
            entry.mod_time = stat.mod_time;
            writer.append_data(entry, &file.contents()[..])?;
        }
        MemNode::Symlink(link) => {
            use cc_vfs::SymlinkOps;
            let stat = link.stat().map_err(fs_io)?;
            let mut entry = Entry::new(EntryKind::Symlink, path);
            entry.mode = stat.mode;
            entry.mod_time = stat.mod_time;
            entry.link_name = link.target().map_err(fs_io)?;
            writer.append(entry)?;
        }
    }
    Ok(())
}

fn fs_io(err: FsError) -> cc_archive::ArchiveError {
    cc_archive::ArchiveError::Io(std::io::Error::other(err))
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// A path is excluded when it or any ancestor matches one of the glob
/// patterns (`*` within a segment, `?` single char, `**` any depth).
fn excluded(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        let pattern = normalize(pattern);
        let mut p = path;
        loop {
            if glob_match(&pattern, p) {
                return true;
            }
            match p.rsplit_once('/') {
                Some((parent, _)) => p = parent,
                None => return false,
            }
        }
    })
}

fn glob_match(pattern: &str, path: &str) -> bool {
    fn segments(s: &str) -> Vec<&str> {
        s.split('/').collect()
    }
    fn match_segments(pat: &[&str], path: &[&str]) -> bool {
        match (pat.first(), path.first()) {
            (None, None) => true,
            (Some(&"**"), _) => {
                match_segments(&pat[1..], path)
                    || (!path.is_empty() && match_segments(pat, &path[1..]))
            }
            (Some(p), Some(s)) => match_segment(p, s) && match_segments(&pat[1..], &path[1..]),
            _ => false,
        }
    }
    fn match_segment(pat: &str, seg: &str) -> bool {
        let (pat, seg) = (pat.as_bytes(), seg.as_bytes());
        fn rec(p: &[u8], s: &[u8]) -> bool {
            match (p.first(), s.first()) {
                (None, None) => true,
                (Some(b'*'), _) => rec(&p[1..], s) || (!s.is_empty() && rec(p, &s[1..])),
                (Some(b'?'), Some(_)) => rec(&p[1..], &s[1..]),
                (Some(a), Some(b)) if a == b => rec(&p[1..], &s[1..]),
                _ => false,
            }
        }
        rec(pat, seg)
    }
    match_segments(&segments(pattern), &segments(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::testutil::{Spec, layer};
    use cc_archive::Archive;

    fn overlay(dir: &std::path::Path) -> OverlayFs {
        let base = layer(
            dir,
            "base",
            &[
                Spec::Dir("etc"),
                Spec::File("etc/os-release", b"abcd\n"),
                Spec::File("etc/hostname", b"box\n"),
            ],
        );
        OverlayFs::new(LayerStack::new(vec![base]))
    }

    #[test]
    fn upper_writes_shadow_the_stack() {
        let dir = tempfile::tempdir().unwrap();
        let fs = overlay(dir.path());

        assert_eq!(fs.read_file("/etc/os-release").unwrap(), b"abcd\n");
        fs.write_file("/etc/os-release", b"patched", 0o644).unwrap();
        assert_eq!(fs.read_file("/etc/os-release").unwrap(), b"patched");

        let (kind, stat) = fs.stat("/etc/os-release").unwrap();
        assert_eq!(kind, NodeKind::File);
        assert_eq!(stat.size, 7);
    }

    #[test]
    fn removal_masks_lower_layers() {
        let dir = tempfile::tempdir().unwrap();
        let fs = overlay(dir.path());
        fs.remove("/etc/hostname").unwrap();
        assert!(matches!(fs.read_file("/etc/hostname"), Err(FsError::NotFound)));
        let names: Vec<_> =
            fs.read_dir("/etc").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["os-release"]);
    }

    #[test]
    fn read_dir_merges_upper_and_stack() {
        let dir = tempfile::tempdir().unwrap();
        let fs = overlay(dir.path());
        fs.write_file("/etc/new-file", b"1", 0o600).unwrap();
        let names: Vec<_> =
            fs.read_dir("/etc").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["hostname", "new-file", "os-release"]);
    }

    #[test]
    fn snapshot_round_trips_through_archive() {
        let dir = tempfile::tempdir().unwrap();
        let fs = overlay(dir.path());
        fs.write_file("/srv/data.txt", b"payload", 0o640).unwrap();
        fs.remove("/etc/hostname").unwrap();

        let snap_base = dir.path().join("snap");
        let mut writer = ArchiveWriter::create(&snap_base).unwrap();
        write_upper_layer(fs.upper(), &mut writer, &[]).unwrap();
        writer.finish().unwrap();

        let snap = Arc::new(Archive::open(&snap_base).unwrap());
        assert_eq!(
            snap.lookup("etc/hostname").unwrap().kind,
            EntryKind::Deleted
        );
        assert_eq!(snap.lookup("srv/data.txt").unwrap().mode, 0o640);

        // Restacking the snapshot reproduces the mutated view.
        let base = layer(dir.path(), "base2", &[Spec::File("etc/hostname", b"box\n")]);
        let stack = LayerStack::new(vec![base, snap]);
        assert!(matches!(stack.lookup("etc/hostname"), Err(FsError::NotFound)));
        assert_eq!(stack.lookup("srv/data.txt").unwrap().read_all().unwrap(), b"payload");
    }

    #[test]
    fn excludes_prune_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        let fs = overlay(dir.path());
        fs.write_file("/tmp/cache/junk", b"x", 0o600).unwrap();
        fs.write_file("/srv/keep", b"y", 0o600).unwrap();

        let snap_base = dir.path().join("snap");
        let mut writer = ArchiveWriter::create(&snap_base).unwrap();
        write_upper_layer(fs.upper(), &mut writer, &["tmp".to_string()]).unwrap();
        writer.finish().unwrap();

        let snap = Archive::open(&snap_base).unwrap();
        assert!(snap.lookup("tmp/cache/junk").is_none());
        assert!(snap.lookup("srv/keep").is_some());
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("**/*.log", "var/log/app.log"));
        assert!(glob_match("tmp/*", "tmp/x"));
        assert!(!glob_match("tmp/*", "tmp/x/y"));
        assert!(glob_match("tmp/**", "tmp/x/y"));
        assert!(!glob_match("*.log", "var/app.log"));
    }
}
