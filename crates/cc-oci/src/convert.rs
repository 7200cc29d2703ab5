// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Layer ingestion: tar(.gz) blobs become index/contents archives.
//!
//! Whiteout files translate into first-class `deleted` entries; the
//! opaque marker is preserved verbatim so the layered filesystem can act
//! on it. Input streams are never fully buffered.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use cc_archive::{ArchiveWriter, Entry, EntryKind};
use cc_containerfs::{normalize, whiteout};
use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::{OciError, Result};

/// Conversion summary.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConvertStats {
    pub entries: u64,
    pub bytes: u64,
    pub whiteouts: u64,
}

/// Convert a tar stream into `<base>.idx` + `<base>.contents`.
/// `gzipped: None` sniffs the gzip magic from the first bytes.
pub fn convert_tar_to_archive<R: Read>(
    input: R,
    gzipped: Option<bool>,
    base: &Path,
) -> Result<ConvertStats> {
    let mut input = PeekTwo::new(input);
    let gz = match gzipped {
        Some(explicit) => explicit,
        None => input.peek()? == [0x1f, 0x8b],
    };
    let reader: Box<dyn Read> = if gz {
        Box::new(GzDecoder::new(input))
    } else {
        Box::new(input)
    };

    let mut tar = tar::Archive::new(reader);
    let mut writer = ArchiveWriter::create(base)?;
    let mut names: HashSet<String> = HashSet::new();
    let mut stats = ConvertStats::default();

    for entry in tar.entries().map_err(OciError::Io)? {
        let mut entry = entry.map_err(OciError::Io)?;
        let path = entry.path().map_err(OciError::Io)?.to_string_lossy().into_owned();
        let name = normalize(&path);

        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644);
        let uid = header.uid().unwrap_or(0) as u32;
        let gid = header.gid().unwrap_or(0) as u32;
        let mod_time = header.mtime().unwrap_or(0) as i64;

        let kind = header.entry_type();
        let (base_name, parent) = match name.rsplit_once('/') {
            Some((parent, base)) => (base.to_string(), parent.to_string()),
            None => (name.clone(), String::new()),
        };

        // Whiteouts: `.wh.<name>` deletes, `.wh..wh..opq` marks opaque
        // and is stored as a plain marker entry.
        let archive_entry = if base_name == whiteout::OPAQUE {
            stats.whiteouts += 1;
            let mut e = Entry::new(EntryKind::Regular, name.clone());
            e.mode = mode;
            e.mod_time = mod_time;
            Some((e, true))
        } else if let Some(stripped) = base_name.strip_prefix(whiteout::PREFIX) {
            stats.whiteouts += 1;
            let target = if parent.is_empty() {
                stripped.to_string()
            } else {
                format!("{}/{}", parent, stripped)
            };
            Some((Entry::new(EntryKind::Deleted, target), false))
        } else {
            let mapped = match kind {
                tar::EntryType::Regular | tar::EntryType::Continuous => Some(EntryKind::Regular),
                tar::EntryType::Directory => Some(EntryKind::Directory),
                tar::EntryType::Symlink => Some(EntryKind::Symlink),
                tar::EntryType::Link => Some(EntryKind::Hardlink),
                tar::EntryType::XHeader | tar::EntryType::XGlobalHeader => None,
                other => {
                    debug!(?other, name = %name, "skipping unsupported tar entry type");
                    None
                }
            };
            mapped.map(|k| {
                let mut e = Entry::new(k, name.clone());
                e.mode = mode;
                e.uid = uid;
                e.gid = gid;
                e.mod_time = mod_time;
                if k == EntryKind::Symlink || k == EntryKind::Hardlink {
                    if let Ok(Some(link)) = entry.link_name() {
                        let target = link.to_string_lossy().into_owned();
                        e.link_name = if k == EntryKind::Hardlink {
                            normalize(&target)
                        } else {
                            target
                        };
                    }
                }
                (e, k == EntryKind::Regular)
            })
        };

        let Some((archive_entry, has_data)) = archive_entry else {
            continue;
        };
        if !names.insert(archive_entry.name.clone()) {
            warn!(name = %archive_entry.name, "duplicate name in layer tar, keeping first");
            continue;
        }

        stats.entries += 1;
        if has_data {
            let written = writer.append_data(archive_entry, &mut entry)?;
            stats.bytes += written.size;
        } else {
            writer.append(archive_entry)?;
        }
    }

    writer.finish()?;
    Ok(stats)
}

/// Two-byte lookahead over a reader, for gzip sniffing.
struct PeekTwo<R: Read> {
    inner: R,
    buffered: [u8; 2],
    filled: usize,
    served: usize,
}

impl<R: Read> PeekTwo<R> {
    fn new(inner: R) -> Self {
        PeekTwo {
            inner,
            buffered: [0; 2],
            filled: 0,
            served: 0,
        }
    }

    fn peek(&mut self) -> std::io::Result<[u8; 2]> {
        while self.filled < 2 {
            let n = self.inner.read(&mut self.buffered[self.filled..])?;
            if n == 0 {
                break;
            }
            self.filled += n;
        }
        Ok(self.buffered)
    }
}

impl<R: Read> Read for PeekTwo<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.served < self.filled {
            let n = buf.len().min(self.filled - self.served);
            buf[..n].copy_from_slice(&self.buffered[self.served..self.served + n]);
            self.served += n;
            return Ok(n);
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_archive::Archive;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn build_tar(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            match data {
                Some(bytes) => {
                    let mut header = tar::Header::new_gnu();
                    header.set_size(bytes.len() as u64);
                    header.set_mode(0o644);
                    header.set_mtime(1_700_000_000);
                    header.set_cksum();
                    builder.append_data(&mut header, path, *bytes).unwrap();
                }
                None => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder.append_data(&mut header, format!("{}/", path), &[][..]).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn plain_tar_converts_with_metadata() {
        let tar_bytes = build_tar(&[
            ("etc", None),
            ("etc/os-release", Some(b"abcd\n")),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("layer");
        let stats = convert_tar_to_archive(&tar_bytes[..], None, &base).unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, 5);

        let archive = Archive::open(&base).unwrap();
        let file = archive.lookup("etc/os-release").unwrap();
        assert_eq!(file.mode, 0o644);
        assert_eq!(file.mod_time, 1_700_000_000);
        assert_eq!(archive.open_entry(file).unwrap().read_all().unwrap(), b"abcd\n");
    }

    #[test]
    fn gzip_is_sniffed_when_unspecified() {
        let tar_bytes = build_tar(&[("f", Some(b"data"))]);
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&tar_bytes).unwrap();
        let gz_bytes = gz.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("layer");
        convert_tar_to_archive(&gz_bytes[..], None, &base).unwrap();
        let archive = Archive::open(&base).unwrap();
        assert_eq!(archive.open_name("f").unwrap().read_all().unwrap(), b"data");
    }

    #[test]
    fn whiteout_files_become_deleted_entries() {
        let tar_bytes = build_tar(&[
            ("a/b/.wh.c", Some(b"")),
            ("d/.wh..wh..opq", Some(b"")),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("layer");
        let stats = convert_tar_to_archive(&tar_bytes[..], None, &base).unwrap();
        assert_eq!(stats.whiteouts, 2);

        let archive = Archive::open(&base).unwrap();
        assert_eq!(archive.lookup("a/b/c").unwrap().kind, EntryKind::Deleted);
        // The opaque marker is stored verbatim for the overlay to find.
        assert_eq!(
            archive.lookup("d/.wh..wh..opq").unwrap().kind,
            EntryKind::Regular
        );
    }
}
