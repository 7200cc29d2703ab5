// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Node polymorphism: the closed set of tree shapes and the leaf traits
//! behind them.

use std::sync::Arc;

use crate::{FsError, FsResult};

/// Optional ownership capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Attributes common to every node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stat {
    pub size: u64,
    pub mode: u32,
    /// Unix seconds.
    pub mod_time: i64,
    pub owner: Option<Owner>,
}

impl Stat {
    pub fn new(size: u64, mode: u32, mod_time: i64) -> Self {
        Stat {
            size,
            mode,
            mod_time,
            owner: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
    Symlink,
}

/// One directory listing entry.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub stat: Stat,
}

/// Directory surface: exactly what the in-guest fs server consumes.
pub trait DirOps: Send + Sync {
    fn stat(&self) -> FsResult<Stat>;
    fn read_dir(&self) -> FsResult<Vec<DirEntry>>;
    fn lookup(&self, name: &str) -> FsResult<Node>;
}

/// File surface. Mutators default to read-only failure so archive-backed
/// sources only implement the read half.
pub trait FileOps: Send + Sync {
    fn stat(&self) -> FsResult<Stat>;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize>;

    fn write_at(&self, _data: &[u8], _offset: u64) -> FsResult<usize> {
        Err(FsError::ReadOnly)
    }

    fn truncate(&self, _len: u64) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }
}

pub trait SymlinkOps: Send + Sync {
    fn stat(&self) -> FsResult<Stat>;
    fn target(&self) -> FsResult<String>;
}

/// A tree node: a tagged variant of exactly one of the three shapes.
#[derive(Clone)]
pub enum Node {
    Dir(Arc<dyn DirOps>),
    File(Arc<dyn FileOps>),
    Symlink(Arc<dyn SymlinkOps>),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Dir(_) => NodeKind::Dir,
            Node::File(_) => NodeKind::File,
            Node::Symlink(_) => NodeKind::Symlink,
        }
    }

    pub fn stat(&self) -> FsResult<Stat> {
        match self {
            Node::Dir(d) => d.stat(),
            Node::File(f) => f.stat(),
            Node::Symlink(s) => s.stat(),
        }
    }

    pub fn as_dir(&self) -> FsResult<&Arc<dyn DirOps>> {
        match self {
            Node::Dir(d) => Ok(d),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn as_file(&self) -> FsResult<&Arc<dyn FileOps>> {
        match self {
            Node::File(f) => Ok(f),
            Node::Dir(_) => Err(FsError::IsADirectory),
            Node::Symlink(_) => Err(FsError::InvalidArgument),
        }
    }

    pub fn as_symlink(&self) -> FsResult<&Arc<dyn SymlinkOps>> {
        match self {
            Node::Symlink(s) => Ok(s),
            _ => Err(FsError::NotASymlink),
        }
    }

    /// Full payload of a file node.
    pub fn read_all(&self) -> FsResult<Vec<u8>> {
        let file = self.as_file()?;
        let size = file.stat()?.size;
        let mut buf = vec![0u8; size as usize];
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.read_at(&mut buf[read..], read as u64)?;
            if n == 0 {
                buf.truncate(read);
                break;
            }
            read += n;
        }
        Ok(buf)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Dir(_) => f.write_str("Node::Dir"),
            Node::File(_) => f.write_str("Node::File"),
            Node::Symlink(_) => f.write_str("Node::Symlink"),
        }
    }
}
