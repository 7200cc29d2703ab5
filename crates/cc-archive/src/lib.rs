// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Content-addressed two-file archive format.
//!
//! An archive is an index file plus a contents file written in lockstep.
//! The contents file is a raw concatenation of regular-file payloads; the
//! index is an ASCII-framed line per entry behind a fixed magic. Archives
//! are immutable once finished and serve both as cached image layers and
//! as filesystem snapshots.

mod entry;
mod reader;
mod writer;

pub use entry::{Entry, EntryKind, HASH_LEN};
pub use reader::{Archive, EntryReader, IndexReader};
pub use writer::ArchiveWriter;

use std::io;

/// Magic prefix of every index file.
pub const INDEX_MAGIC: &[u8; 9] = b"ARCHIVE0\n";

/// Payload alignment in the contents file when padding is enabled.
pub const CONTENTS_ALIGN: u64 = 4096;

/// Archive codec error type
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("bad index magic")]
    BadMagic,
    #[error("short index line")]
    ShortLine,
    #[error("malformed index field: {0}")]
    BadField(&'static str),
    #[error("control character in entry name")]
    BadName,
    #[error("duplicate entry name: {0}")]
    DuplicateName(String),
    #[error("entry is not openable")]
    Invalid,
    #[error("entry {name} out of bounds: offset {offset} + size {size} > contents length {len}")]
    OutOfBounds {
        name: String,
        offset: u64,
        size: u64,
        len: u64,
    },
    #[error("index line too long: {0} bytes")]
    LineTooLong(usize),
    #[error("entry not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Appends the index/contents suffixes used throughout the image cache.
pub fn index_path(base: &std::path::Path) -> std::path::PathBuf {
    let mut p = base.as_os_str().to_owned();
    p.push(".idx");
    p.into()
}

pub fn contents_path(base: &std::path::Path) -> std::path::PathBuf {
    let mut p = base.as_os_str().to_owned();
    p.push(".contents");
    p.into()
}
