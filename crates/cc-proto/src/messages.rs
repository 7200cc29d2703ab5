// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Typed request/response payloads for the helper protocol.

use crate::codec::{DecodeError, Decoder, Encoder, Wire};

/// File metadata as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: i64,
    pub mode: u32,
    pub mod_time: i64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

impl Wire for FileInfo {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_string(&self.name);
        enc.put_i64(self.size);
        enc.put_u32(self.mode);
        enc.put_i64(self.mod_time);
        enc.put_bool(self.is_dir);
        enc.put_bool(self.is_symlink);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(FileInfo {
            name: dec.get_string()?,
            size: dec.get_i64()?,
            mode: dec.get_u32()?,
            mod_time: dec.get_i64()?,
            is_dir: dec.get_bool()?,
            is_symlink: dec.get_bool()?,
        })
    }
}

/// Where an instance's root filesystem comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SourceType {
    /// A `docker save` tar archive.
    Tar = 0,
    /// A pre-baked image directory.
    Dir = 1,
    /// A registry reference.
    Ref = 2,
    /// A filesystem snapshot handle from this helper.
    Snapshot = 3,
}

impl SourceType {
    fn from_u8(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(SourceType::Tar),
            1 => Ok(SourceType::Dir),
            2 => Ok(SourceType::Ref),
            3 => Ok(SourceType::Snapshot),
            other => Err(DecodeError::InvalidDiscriminant(other as u32)),
        }
    }
}

/// One virtio-fs style mount.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MountConfig {
    pub tag: String,
    pub host_path: String,
    pub writable: bool,
}

impl Wire for MountConfig {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_string(&self.tag);
        enc.put_string(&self.host_path);
        enc.put_bool(self.writable);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(MountConfig {
            tag: dec.get_string()?,
            host_path: dec.get_string()?,
            writable: dec.get_bool()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstanceOptions {
    pub memory_mb: u64,
    pub cpus: i32,
    /// 0 disables the timeout.
    pub timeout_secs: f64,
    pub user: String,
    pub enable_dmesg: bool,
    pub mounts: Vec<MountConfig>,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        InstanceOptions {
            memory_mb: 256,
            cpus: 1,
            timeout_secs: 0.0,
            user: String::new(),
            enable_dmesg: false,
            mounts: Vec::new(),
        }
    }
}

impl Wire for InstanceOptions {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.memory_mb);
        enc.put_i32(self.cpus);
        enc.put_f64(self.timeout_secs);
        enc.put_string(&self.user);
        enc.put_bool(self.enable_dmesg);
        enc.put_u32(self.mounts.len() as u32);
        for mount in &self.mounts {
            mount.encode(enc);
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let memory_mb = dec.get_u64()?;
        let cpus = dec.get_i32()?;
        let timeout_secs = dec.get_f64()?;
        let user = dec.get_string()?;
        let enable_dmesg = dec.get_bool()?;
        let count = dec.get_u32()? as usize;
        let mut mounts = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            mounts.push(MountConfig::decode(dec)?);
        }
        Ok(InstanceOptions {
            memory_mb,
            cpus,
            timeout_secs,
            user,
            enable_dmesg,
            mounts,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstanceNewRequest {
    pub source_type: SourceType,
    /// Tar or directory path; empty for registry pulls.
    pub source_path: String,
    /// Registry reference; empty for tar/dir sources.
    pub image_ref: String,
    /// Snapshot handle when the source is a snapshot.
    pub source_handle: u64,
    pub cache_dir: String,
    pub options: InstanceOptions,
}

impl Wire for InstanceNewRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(self.source_type as u8);
        enc.put_string(&self.source_path);
        enc.put_string(&self.image_ref);
        enc.put_u64(self.source_handle);
        enc.put_string(&self.cache_dir);
        self.options.encode(enc);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(InstanceNewRequest {
            source_type: SourceType::from_u8(dec.get_u8()?)?,
            source_path: dec.get_string()?,
            image_ref: dec.get_string()?,
            source_handle: dec.get_u64()?,
            cache_dir: dec.get_string()?,
            options: InstanceOptions::decode(dec)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceExecRequest {
    pub name: String,
    pub args: Vec<String>,
}

impl Wire for InstanceExecRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_string(&self.name);
        enc.put_string_slice(&self.args);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(InstanceExecRequest {
            name: dec.get_string()?,
            args: dec.get_string_slice()?,
        })
    }
}

/// Single-path requests shared by several fs operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathRequest {
    pub path: String,
}

impl Wire for PathRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_string(&self.path);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(PathRequest {
            path: dec.get_string()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsWriteFileRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub mode: u32,
}

impl Wire for FsWriteFileRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_string(&self.path);
        enc.put_bytes(&self.data);
        enc.put_u32(self.mode);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(FsWriteFileRequest {
            path: dec.get_string()?,
            data: dec.get_bytes()?,
            mode: dec.get_u32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfoList {
    pub entries: Vec<FileInfo>,
}

impl Wire for FileInfoList {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            entry.encode(enc);
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let count = dec.get_u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            entries.push(FileInfo::decode(dec)?);
        }
        Ok(FileInfoList { entries })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsSnapshotRequest {
    pub excludes: Vec<String>,
    pub cache_dir: String,
}

impl Wire for FsSnapshotRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_string_slice(&self.excludes);
        enc.put_string(&self.cache_dir);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(FsSnapshotRequest {
            excludes: dec.get_string_slice()?,
            cache_dir: dec.get_string()?,
        })
    }
}

/// Bare handle argument, shared by many operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleRequest {
    pub handle: u64,
}

impl Wire for HandleRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.handle);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(HandleRequest {
            handle: dec.get_u64()?,
        })
    }
}

/// Bare handle response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandleResponse {
    pub handle: u64,
}

impl Wire for HandleResponse {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.handle);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(HandleResponse {
            handle: dec.get_u64()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdNewRequest {
    pub name: String,
    pub args: Vec<String>,
}

impl Wire for CmdNewRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_string(&self.name);
        enc.put_string_slice(&self.args);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(CmdNewRequest {
            name: dec.get_string()?,
            args: dec.get_string_slice()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdSetEnvRequest {
    pub handle: u64,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
}

impl Wire for CmdSetEnvRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.handle);
        enc.put_string_slice(&self.env);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(CmdSetEnvRequest {
            handle: dec.get_u64()?,
            env: dec.get_string_slice()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdSetDirRequest {
    pub handle: u64,
    pub dir: String,
}

impl Wire for CmdSetDirRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.handle);
        enc.put_string(&self.dir);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(CmdSetDirRequest {
            handle: dec.get_u64()?,
            dir: dec.get_string()?,
        })
    }
}

/// Non-zero exit is data, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitResponse {
    pub exit_code: i32,
}

impl Wire for ExitResponse {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_i32(self.exit_code);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(ExitResponse {
            exit_code: dec.get_i32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputResponse {
    pub exit_code: i32,
    pub output: Vec<u8>,
}

impl Wire for OutputResponse {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_i32(self.exit_code);
        enc.put_bytes(&self.output);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(OutputResponse {
            exit_code: dec.get_i32()?,
            output: dec.get_bytes()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetListenRequest {
    pub port: u32,
}

impl Wire for NetListenRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u32(self.port);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(NetListenRequest {
            port: dec.get_u32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub handle: u64,
    pub len: u32,
}

impl Wire for ReadRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.handle);
        enc.put_u32(self.len);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(ReadRequest {
            handle: dec.get_u64()?,
            len: dec.get_u32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    pub handle: u64,
    pub data: Vec<u8>,
}

impl Wire for WriteRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.handle);
        enc.put_bytes(&self.data);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(WriteRequest {
            handle: dec.get_u64()?,
            data: dec.get_bytes()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileOpenRequest {
    pub path: String,
    pub flags: i32,
    pub mode: u32,
}

impl Wire for FileOpenRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_string(&self.path);
        enc.put_i32(self.flags);
        enc.put_u32(self.mode);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(FileOpenRequest {
            path: dec.get_string()?,
            flags: dec.get_i32()?,
            mode: dec.get_u32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileReadAtRequest {
    pub handle: u64,
    pub offset: u64,
    pub len: u32,
}

impl Wire for FileReadAtRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.handle);
        enc.put_u64(self.offset);
        enc.put_u32(self.len);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(FileReadAtRequest {
            handle: dec.get_u64()?,
            offset: dec.get_u64()?,
            len: dec.get_u32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileWriteAtRequest {
    pub handle: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Wire for FileWriteAtRequest {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.handle);
        enc.put_u64(self.offset);
        enc.put_bytes(&self.data);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(FileWriteAtRequest {
            handle: dec.get_u64()?,
            offset: dec.get_u64()?,
            data: dec.get_bytes()?,
        })
    }
}

/// One streamed output chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamChunk {
    pub stream_type: u8,
    pub data: Vec<u8>,
}

impl Wire for StreamChunk {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(self.stream_type);
        enc.put_bytes(&self.data);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(StreamChunk {
            stream_type: dec.get_u8()?,
            data: dec.get_bytes()?,
        })
    }
}

/// Terminates a stream; emitted exactly once per streaming request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamEnd {
    pub code: u8,
    pub exit_code: i32,
}

impl Wire for StreamEnd {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(self.code);
        enc.put_i32(self.exit_code);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(StreamEnd {
            code: dec.get_u8()?,
            exit_code: dec.get_i32()?,
        })
    }
}

/// Empty payload for requests and responses that carry nothing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Empty;

impl Wire for Empty {
    fn encode(&self, _enc: &mut Encoder) {}

    fn decode(_dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Empty)
    }
}

/// Raw bytes payload (file reads, conn reads).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BytesResponse {
    pub data: Vec<u8>,
}

impl Wire for BytesResponse {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_bytes(&self.data);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(BytesResponse {
            data: dec.get_bytes()?,
        })
    }
}

/// Count-of-bytes response (writes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountResponse {
    pub count: u32,
}

impl Wire for CountResponse {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u32(self.count);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(CountResponse {
            count: dec.get_u32()?,
        })
    }
}

/// What this helper's machine can offer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilitiesResponse {
    pub hypervisor_available: bool,
    /// 0 when unknown.
    pub max_memory_mb: u64,
    /// 0 when unknown.
    pub max_cpus: i32,
    pub architecture: String,
}

impl Wire for CapabilitiesResponse {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_bool(self.hypervisor_available);
        enc.put_u64(self.max_memory_mb);
        enc.put_i32(self.max_cpus);
        enc.put_string(&self.architecture);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(CapabilitiesResponse {
            hypervisor_available: dec.get_bool()?,
            max_memory_mb: dec.get_u64()?,
            max_cpus: dec.get_i32()?,
            architecture: dec.get_string()?,
        })
    }
}

/// Resolved-path response for symlink-expanded entrypoint lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathResponse {
    pub path: String,
}

impl Wire for PathResponse {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_string(&self.path);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(PathResponse {
            path: dec.get_string()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Wire + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = value.to_bytes();
        assert_eq!(T::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn representative_messages_round_trip() {
        round_trip(FileInfo {
            name: "os-release".into(),
            size: 5,
            mode: 0o644,
            mod_time: 1_700_000_000,
            is_dir: false,
            is_symlink: false,
        });
        round_trip(InstanceNewRequest {
            source_type: SourceType::Ref,
            source_path: String::new(),
            image_ref: "alpine:3.20".into(),
            source_handle: 0,
            cache_dir: "/tmp/cc-cache".into(),
            options: InstanceOptions {
                memory_mb: 512,
                cpus: 2,
                timeout_secs: 30.0,
                user: "1000:1000".into(),
                enable_dmesg: true,
                mounts: vec![MountConfig {
                    tag: "work".into(),
                    host_path: "/home/dev/project".into(),
                    writable: true,
                }],
            },
        });
        round_trip(CmdNewRequest {
            name: "sh".into(),
            args: vec!["-c".into(), "printf foo".into()],
        });
        round_trip(StreamChunk {
            stream_type: crate::STREAM_STDERR,
            data: b"bar".to_vec(),
        });
        round_trip(StreamEnd {
            code: 0,
            exit_code: 2,
        });
        round_trip(FsWriteFileRequest {
            path: "/etc/hostname".into(),
            data: b"box\n".to_vec(),
            mode: 0o644,
        });
    }

    #[test]
    fn invalid_source_type_rejected() {
        assert!(matches!(
            SourceType::from_u8(9),
            Err(DecodeError::InvalidDiscriminant(9))
        ));
    }
}
