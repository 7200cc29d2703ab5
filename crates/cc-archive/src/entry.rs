// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Entry metadata and the index line codec.

use crate::{ArchiveError, Result};

/// Length of an entry content hash (SHA-256).
pub const HASH_LEN: usize = 32;

/// Entry kind tag as stored in the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryKind {
    Invalid = 0,
    Regular = 1,
    Directory = 2,
    Symlink = 3,
    Hardlink = 4,
    /// Extended metadata record carrying a payload, openable like a regular file.
    Extended = 5,
    /// Whiteout: masks the same name in lower layers.
    Deleted = 6,
}

impl EntryKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => EntryKind::Regular,
            2 => EntryKind::Directory,
            3 => EntryKind::Symlink,
            4 => EntryKind::Hardlink,
            5 => EntryKind::Extended,
            6 => EntryKind::Deleted,
            _ => EntryKind::Invalid,
        }
    }

    /// Only regular and extended entries carry payload bytes.
    pub fn openable(self) -> bool {
        matches!(self, EntryKind::Regular | EntryKind::Extended)
    }
}

/// One archive entry as recorded in the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    pub name: String,
    pub link_name: String,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Modification time, unix seconds.
    pub mod_time: i64,
    /// Byte offset into the contents file; 0 for entries with no data.
    pub offset: u64,
    /// SHA-256 of the entry contents.
    pub hash: [u8; HASH_LEN],
}

impl Entry {
    pub fn new(kind: EntryKind, name: impl Into<String>) -> Self {
        Entry {
            kind,
            name: name.into(),
            link_name: String::new(),
            size: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            mod_time: 0,
            offset: 0,
            hash: [0; HASH_LEN],
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_link(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink | EntryKind::Hardlink)
    }

    /// Encode this entry as one index line, including the leading length
    /// field. The length counts everything after `"LLLL "` including the
    /// trailing newline.
    pub(crate) fn encode_line(&self) -> Result<Vec<u8>> {
        validate_name(&self.name)?;
        validate_name(&self.link_name)?;

        let tail = format!(
            "{:02x} {:08x} {:08x}:{:08x} {:016x} {:016x} {:016x} {} {}\t{}\n",
            self.kind as u8,
            self.mode,
            self.uid,
            self.gid,
            self.mod_time as u64,
            self.size,
            self.offset,
            hex::encode(self.hash),
            self.name,
            self.link_name,
        );
        if tail.len() > 0xffff {
            return Err(ArchiveError::LineTooLong(tail.len()));
        }

        let mut line = Vec::with_capacity(5 + tail.len());
        line.extend_from_slice(format!("{:04x} ", tail.len()).as_bytes());
        line.extend_from_slice(tail.as_bytes());
        Ok(line)
    }

    /// Decode the portion of an index line after `"LLLL "`. The slice must
    /// include the trailing newline.
    pub(crate) fn decode_line(tail: &[u8]) -> Result<Entry> {
        if tail.len() < 2 || *tail.last().unwrap() != b'\n' {
            return Err(ArchiveError::ShortLine);
        }
        let tail = &tail[..tail.len() - 1];

        // Fixed-width numeric prefix:
        //   kk mmmmmmmm uuuuuuuu:gggggggg tttt*16 ssss*16 oooo*16 hhhh*64<sp>
        const FIXED: usize = 2 + 1 + 8 + 1 + 8 + 1 + 8 + 1 + 16 + 1 + 16 + 1 + 16 + 1 + 64 + 1;
        if tail.len() < FIXED {
            return Err(ArchiveError::ShortLine);
        }
        let (fixed, names) = tail.split_at(FIXED);
        let fixed = std::str::from_utf8(fixed).map_err(|_| ArchiveError::BadField("ascii"))?;

        let kind = EntryKind::from_u8(parse_hex(&fixed[0..2], "kind")? as u8);
        let mode = parse_hex(&fixed[3..11], "mode")? as u32;
        let uid = parse_hex(&fixed[12..20], "uid")? as u32;
        expect_sep(fixed, 20, ':')?;
        let gid = parse_hex(&fixed[21..29], "gid")? as u32;
        let mod_time = parse_hex(&fixed[30..46], "mod_time")? as i64;
        let size = parse_hex(&fixed[47..63], "size")?;
        let offset = parse_hex(&fixed[64..80], "offset")?;
        let mut hash = [0u8; HASH_LEN];
        hex::decode_to_slice(&fixed[81..145], &mut hash)
            .map_err(|_| ArchiveError::BadField("hash"))?;

        let names = std::str::from_utf8(names).map_err(|_| ArchiveError::BadField("name"))?;
        let (name, link_name) =
            names.split_once('\t').ok_or(ArchiveError::BadField("name separator"))?;
        validate_name(name)?;
        validate_name(link_name)?;

        Ok(Entry {
            kind,
            name: name.to_string(),
            link_name: link_name.to_string(),
            size,
            mode,
            uid,
            gid,
            mod_time,
            offset,
            hash,
        })
    }
}

fn expect_sep(s: &str, at: usize, want: char) -> Result<()> {
    if s.as_bytes().get(at) == Some(&(want as u8)) {
        Ok(())
    } else {
        Err(ArchiveError::BadField("separator"))
    }
}

fn parse_hex(s: &str, field: &'static str) -> Result<u64> {
    u64::from_str_radix(s, 16).map_err(|_| ArchiveError::BadField(field))
}

fn validate_name(name: &str) -> Result<()> {
    if name.contains('\t') || name.contains('\n') {
        return Err(ArchiveError::BadName);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entry {
        let mut e = Entry::new(EntryKind::Regular, "usr/bin/env");
        e.size = 12345;
        e.mode = 0o755;
        e.uid = 1000;
        e.gid = 100;
        e.mod_time = 1_700_000_000;
        e.offset = 8192;
        e.hash = [0xab; HASH_LEN];
        e
    }

    #[test]
    fn line_round_trip() {
        let e = sample();
        let line = e.encode_line().unwrap();
        assert_eq!(&line[4..5], b" ");
        let len = usize::from_str_radix(std::str::from_utf8(&line[..4]).unwrap(), 16).unwrap();
        assert_eq!(len, line.len() - 5);
        let back = Entry::decode_line(&line[5..]).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn symlink_round_trip() {
        let mut e = Entry::new(EntryKind::Symlink, "sbin/init");
        e.link_name = "/lib/systemd/systemd".to_string();
        let line = e.encode_line().unwrap();
        let back = Entry::decode_line(&line[5..]).unwrap();
        assert_eq!(back.link_name, "/lib/systemd/systemd");
        assert_eq!(back.kind, EntryKind::Symlink);
    }

    #[test]
    fn negative_mod_time_survives() {
        let mut e = sample();
        e.mod_time = -1;
        let line = e.encode_line().unwrap();
        let back = Entry::decode_line(&line[5..]).unwrap();
        assert_eq!(back.mod_time, -1);
    }

    #[test]
    fn tab_in_name_rejected() {
        let e = Entry::new(EntryKind::Regular, "a\tb");
        assert!(matches!(e.encode_line(), Err(ArchiveError::BadName)));
    }

    #[test]
    fn truncated_line_rejected() {
        let e = sample();
        let line = e.encode_line().unwrap();
        assert!(Entry::decode_line(&line[5..40]).is_err());
    }
}
