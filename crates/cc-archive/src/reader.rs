// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Archive readers: streaming index iteration and random-access entry
//! opening. A finished archive may be read from any number of threads;
//! every payload read is a positioned read on the shared contents file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use crate::{ArchiveError, Entry, INDEX_MAGIC, Result, contents_path, index_path};

/// Streaming reader over an index file.
pub struct IndexReader<R: Read> {
    inner: R,
}

impl IndexReader<BufReader<File>> {
    pub fn open(index: &Path) -> Result<Self> {
        Self::new(BufReader::new(File::open(index)?))
    }
}

impl<R: Read> IndexReader<R> {
    /// Consumes and checks the magic before the first entry.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut magic = [0u8; INDEX_MAGIC.len()];
        inner.read_exact(&mut magic).map_err(|_| ArchiveError::BadMagic)?;
        if &magic != INDEX_MAGIC {
            return Err(ArchiveError::BadMagic);
        }
        Ok(IndexReader { inner })
    }

    /// Next entry in append order, or `None` at end of index.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        let mut header = [0u8; 5];
        match self.inner.read(&mut header[..1])? {
            0 => return Ok(None),
            _ => {}
        }
        self.inner.read_exact(&mut header[1..]).map_err(|_| ArchiveError::ShortLine)?;
        if header[4] != b' ' {
            return Err(ArchiveError::BadField("line length"));
        }
        let len_str =
            std::str::from_utf8(&header[..4]).map_err(|_| ArchiveError::BadField("line length"))?;
        let len = usize::from_str_radix(len_str, 16)
            .map_err(|_| ArchiveError::BadField("line length"))?;
        if len < 2 {
            return Err(ArchiveError::ShortLine);
        }

        let mut tail = vec![0u8; len];
        self.inner.read_exact(&mut tail).map_err(|_| ArchiveError::ShortLine)?;
        Entry::decode_line(&tail).map(Some)
    }
}

/// A fully loaded archive: index in memory, contents opened for positioned
/// reads.
pub struct Archive {
    entries: Vec<Entry>,
    by_name: HashMap<String, usize>,
    contents: Arc<File>,
    contents_len: u64,
}

impl Archive {
    /// Open `<base>.idx` + `<base>.contents`.
    pub fn open(base: &Path) -> Result<Self> {
        Self::open_paths(&index_path(base), &contents_path(base))
    }

    pub fn open_paths(index: &Path, contents: &Path) -> Result<Self> {
        let contents = File::open(contents)?;
        let contents_len = contents.metadata()?.len();

        let mut reader = IndexReader::open(index)?;
        let mut entries = Vec::new();
        let mut by_name = HashMap::new();
        while let Some(entry) = reader.next_entry()? {
            if entry.kind.openable() && entry.size > 0 {
                let end = entry.offset.checked_add(entry.size);
                if end.is_none() || end.unwrap() > contents_len {
                    return Err(ArchiveError::OutOfBounds {
                        name: entry.name.clone(),
                        offset: entry.offset,
                        size: entry.size,
                        len: contents_len,
                    });
                }
            }
            if by_name.insert(entry.name.clone(), entries.len()).is_some() {
                return Err(ArchiveError::DuplicateName(entry.name.clone()));
            }
            entries.push(entry);
        }

        Ok(Archive {
            entries,
            by_name,
            contents: Arc::new(contents),
            contents_len,
        })
    }

    /// Entries in append order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contents_len(&self) -> u64 {
        self.contents_len
    }

    pub fn lookup(&self, name: &str) -> Option<&Entry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Open an entry's payload for positioned reads. Only regular and
    /// extended entries are openable.
    pub fn open_entry(&self, entry: &Entry) -> Result<EntryReader> {
        if !entry.kind.openable() {
            return Err(ArchiveError::Invalid);
        }
        Ok(EntryReader {
            contents: self.contents.clone(),
            offset: entry.offset,
            size: entry.size,
        })
    }

    pub fn open_name(&self, name: &str) -> Result<EntryReader> {
        let entry = self.lookup(name).ok_or_else(|| ArchiveError::NotFound(name.to_string()))?;
        self.open_entry(entry)
    }
}

/// Positioned reader over one entry's payload. Reads are clamped to the
/// entry's declared size; the shared contents handle is never seeked.
#[derive(Clone)]
pub struct EntryReader {
    contents: Arc<File>,
    offset: u64,
    size: u64,
}

impl EntryReader {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `buf.len()` bytes at `pos` within the entry. Returns the
    /// number of bytes read; 0 at or past end.
    pub fn read_at(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        if pos >= self.size {
            return Ok(0);
        }
        let avail = (self.size - pos) as usize;
        let want = buf.len().min(avail);
        let n = self.contents.read_at(&mut buf[..want], self.offset + pos)?;
        Ok(n)
    }

    /// Read exactly `buf.len()` bytes at `pos`, failing on short reads.
    pub fn read_exact_at(&self, buf: &mut [u8], pos: u64) -> Result<()> {
        let end = pos.checked_add(buf.len() as u64).filter(|&e| e <= self.size);
        if end.is_none() {
            return Err(ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of entry",
            )));
        }
        self.contents.read_exact_at(buf, self.offset + pos)?;
        Ok(())
    }

    /// Read the whole payload.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size as usize];
        self.contents.read_exact_at(&mut buf, self.offset)?;
        Ok(buf)
    }
}
