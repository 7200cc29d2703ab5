// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Read-only tree over a host directory, used for instance mounts.
//! Mutators fail with `ReadOnly`; writable mounts get a copy-up layer
//! stacked above this source by the consumer.

use std::fs::Metadata;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    DirEntry, DirOps, FileOps, FsError, FsResult, Node, NodeKind, Owner, Stat, SymlinkOps,
};

/// Directory node rooted at a host path.
pub struct HostDir {
    path: PathBuf,
}

impl HostDir {
    /// Open a host directory as a read-only tree root.
    pub fn new(path: impl Into<PathBuf>) -> FsResult<Arc<HostDir>> {
        let path = path.into();
        let meta = std::fs::metadata(&path)?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(Arc::new(HostDir { path }))
    }

    pub fn root_node(self: Arc<Self>) -> Node {
        Node::Dir(self)
    }
}

fn stat_from(meta: &Metadata) -> Stat {
    Stat {
        size: meta.len(),
        mode: meta.permissions().mode() & 0o7777,
        mod_time: meta.mtime(),
        owner: Some(Owner {
            uid: meta.uid(),
            gid: meta.gid(),
        }),
    }
}

fn node_for(path: &Path) -> FsResult<Node> {
    let meta = std::fs::symlink_metadata(path)?;
    let file_type = meta.file_type();
    if file_type.is_dir() {
        Ok(Node::Dir(Arc::new(HostDir {
            path: path.to_path_buf(),
        })))
    } else if file_type.is_symlink() {
        Ok(Node::Symlink(Arc::new(HostSymlink {
            path: path.to_path_buf(),
        })))
    } else if file_type.is_file() {
        Ok(Node::File(Arc::new(HostFile {
            file: std::fs::File::open(path)?,
            path: path.to_path_buf(),
        })))
    } else {
        // Sockets, fifos and devices have no place in the guest tree.
        Err(FsError::InvalidArgument)
    }
}

impl DirOps for HostDir {
    fn stat(&self) -> FsResult<Stat> {
        Ok(stat_from(&std::fs::metadata(&self.path)?))
    }

    fn read_dir(&self) -> FsResult<Vec<DirEntry>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let meta = entry.metadata()?;
            let kind = if meta.is_dir() {
                NodeKind::Dir
            } else if meta.file_type().is_symlink() {
                NodeKind::Symlink
            } else {
                NodeKind::File
            };
            out.push(DirEntry {
                name,
                kind,
                stat: stat_from(&meta),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn lookup(&self, name: &str) -> FsResult<Node> {
        if name.contains('/') || name == ".." {
            return Err(FsError::InvalidName);
        }
        let child = self.path.join(name);
        match node_for(&child) {
            Err(FsError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FsError::NotFound)
            }
            other => other,
        }
    }
}

pub struct HostFile {
    file: std::fs::File,
    path: PathBuf,
}

impl FileOps for HostFile {
    fn stat(&self) -> FsResult<Stat> {
        Ok(stat_from(&self.file.metadata()?))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }
}

impl std::fmt::Debug for HostFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostFile({})", self.path.display())
    }
}

pub struct HostSymlink {
    path: PathBuf,
}

impl SymlinkOps for HostSymlink {
    fn stat(&self) -> FsResult<Stat> {
        Ok(stat_from(&std::fs::symlink_metadata(&self.path)?))
    }

    fn target(&self) -> FsResult<String> {
        let target = std::fs::read_link(&self.path)?;
        Ok(target.to_string_lossy().into_owned())
    }
}
