// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Archive writer. Index and contents are written in lockstep; the writer
//! is single-threaded and the result is immutable once `finish` returns.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::{ArchiveError, CONTENTS_ALIGN, Entry, INDEX_MAGIC, Result, contents_path, index_path};

pub struct ArchiveWriter {
    index: BufWriter<File>,
    contents: BufWriter<File>,
    /// Append position in the contents file.
    offset: u64,
    /// Zero-pad payloads to [`CONTENTS_ALIGN`] so mmap-friendly alignment
    /// survives across runs.
    pad: bool,
    names: HashSet<String>,
}

impl ArchiveWriter {
    /// Create `<base>.idx` + `<base>.contents` with padding enabled.
    pub fn create(base: &Path) -> Result<Self> {
        Self::create_with_padding(base, true)
    }

    pub fn create_with_padding(base: &Path, pad: bool) -> Result<Self> {
        let mut index = BufWriter::new(File::create(index_path(base))?);
        let contents = BufWriter::new(File::create(contents_path(base))?);
        index.write_all(INDEX_MAGIC)?;
        Ok(ArchiveWriter {
            index,
            contents,
            offset: 0,
            pad,
            names: HashSet::new(),
        })
    }

    /// Append an entry with no payload (directory, symlink, whiteout, ...).
    /// `size`, `offset` and `hash` on the passed entry are ignored.
    pub fn append(&mut self, mut entry: Entry) -> Result<Entry> {
        if entry.kind.openable() {
            return Err(ArchiveError::Invalid);
        }
        entry.size = 0;
        entry.offset = 0;
        entry.hash = [0; crate::HASH_LEN];
        self.write_index_line(&entry)?;
        Ok(entry)
    }

    /// Append a regular or extended entry, streaming its payload into the
    /// contents file. Returns the entry with size, offset and hash filled in.
    pub fn append_data(&mut self, mut entry: Entry, mut data: impl Read) -> Result<Entry> {
        if !entry.kind.openable() {
            return Err(ArchiveError::Invalid);
        }

        entry.offset = self.offset;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = data.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            self.contents.write_all(&buf[..n])?;
            written += n as u64;
        }
        entry.size = written;
        entry.hash = hasher.finalize().into();
        self.offset += written;

        if self.pad {
            let rem = self.offset % CONTENTS_ALIGN;
            if rem != 0 {
                let pad = (CONTENTS_ALIGN - rem) as usize;
                self.contents.write_all(&vec![0u8; pad])?;
                self.offset += pad as u64;
            }
        }

        self.write_index_line(&entry)?;
        Ok(entry)
    }

    fn write_index_line(&mut self, entry: &Entry) -> Result<()> {
        if !self.names.insert(entry.name.clone()) {
            return Err(ArchiveError::DuplicateName(entry.name.clone()));
        }
        let line = entry.encode_line()?;
        self.index.write_all(&line)?;
        Ok(())
    }

    /// Flush both files. Dropping without calling this loses buffered data.
    pub fn finish(mut self) -> Result<()> {
        self.index.flush()?;
        self.contents.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Archive, EntryKind};

    #[test]
    fn padded_offsets_are_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("layer");
        let mut w = ArchiveWriter::create(&base).unwrap();
        w.append_data(Entry::new(EntryKind::Regular, "a"), &b"xyz"[..]).unwrap();
        let second =
            w.append_data(Entry::new(EntryKind::Regular, "b"), &b"hello"[..]).unwrap();
        w.finish().unwrap();
        assert_eq!(second.offset, CONTENTS_ALIGN);

        let archive = Archive::open(&base).unwrap();
        let mut buf = vec![0u8; 5];
        archive.open_entry(archive.lookup("b").unwrap()).unwrap().read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn unpadded_offsets_are_dense() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("layer");
        let mut w = ArchiveWriter::create_with_padding(&base, false).unwrap();
        w.append_data(Entry::new(EntryKind::Regular, "a"), &b"xyz"[..]).unwrap();
        let second =
            w.append_data(Entry::new(EntryKind::Regular, "b"), &b"hello"[..]).unwrap();
        w.finish().unwrap();
        assert_eq!(second.offset, 3);
    }

    #[test]
    fn duplicate_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("layer");
        let mut w = ArchiveWriter::create(&base).unwrap();
        w.append(Entry::new(EntryKind::Directory, "etc")).unwrap();
        assert!(matches!(
            w.append(Entry::new(EntryKind::Directory, "etc")),
            Err(ArchiveError::DuplicateName(_))
        ));
    }

    #[test]
    fn payload_on_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("layer");
        let mut w = ArchiveWriter::create(&base).unwrap();
        assert!(w.append_data(Entry::new(EntryKind::Directory, "etc"), &b"x"[..]).is_err());
    }
}
