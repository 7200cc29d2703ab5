// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Abstract filesystem tree consumed by the VM's fs server.
//!
//! A node is exactly one of directory, file or symlink; sources compose by
//! wrapping each other (archive layers, container stacks, snapshot stacks).
//! Read-only sources fail mutators with [`FsError::ReadOnly`]. All
//! implementations must tolerate concurrent readers; writable files hold an
//! exclusive lock per file.

mod error;
mod hostfs;
mod memfs;
mod node;

pub use error::{FsError, FsResult};
pub use hostfs::{HostDir, HostFile, HostSymlink};
pub use memfs::{MemDir, MemFile, MemFs, MemNode, MemSymlink};
pub use node::{DirEntry, DirOps, FileOps, Node, NodeKind, Owner, Stat, SymlinkOps};
