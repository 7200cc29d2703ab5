// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Helper IPC protocol: length-prefixed frames over a Unix socket with a
//! big-endian typed payload codec.
//!
//! Message type ranges carve out families; the low control range carries
//! responses, errors and stream frames shared by every family.

mod codec;
mod frame;
mod messages;

pub use codec::{DecodeError, Decoder, Encoder, Wire};
pub use frame::{MAX_FRAME_LEN, read_frame, write_frame};
pub use messages::*;

/// Control frames (responses and streams).
pub const MSG_RESPONSE: u16 = 0x0001;
pub const MSG_ERROR: u16 = 0x0002;
pub const MSG_STREAM_CHUNK: u16 = 0x0003;
pub const MSG_STREAM_END: u16 = 0x0004;

/// Instance family.
pub const MSG_INSTANCE_NEW: u16 = 0x0100;
pub const MSG_INSTANCE_EXEC: u16 = 0x0101;
pub const MSG_INSTANCE_CLOSE: u16 = 0x0102;
pub const MSG_INSTANCE_RESOLVE_PATH: u16 = 0x0103;
pub const MSG_CAPABILITIES: u16 = 0x0104;

/// Filesystem family.
pub const MSG_FS_READ_FILE: u16 = 0x0200;
pub const MSG_FS_WRITE_FILE: u16 = 0x0201;
pub const MSG_FS_STAT: u16 = 0x0202;
pub const MSG_FS_READ_DIR: u16 = 0x0203;
pub const MSG_FS_REMOVE: u16 = 0x0204;

/// File-handle family.
pub const MSG_FILE_OPEN: u16 = 0x0300;
pub const MSG_FILE_READ_AT: u16 = 0x0301;
pub const MSG_FILE_WRITE_AT: u16 = 0x0302;
pub const MSG_FILE_CLOSE: u16 = 0x0303;

/// Command family.
pub const MSG_CMD_NEW: u16 = 0x0400;
pub const MSG_CMD_SET_ENV: u16 = 0x0401;
pub const MSG_CMD_SET_DIR: u16 = 0x0402;
pub const MSG_CMD_START: u16 = 0x0403;
pub const MSG_CMD_WAIT: u16 = 0x0404;
pub const MSG_CMD_RUN: u16 = 0x0405;
pub const MSG_CMD_RUN_STREAMING: u16 = 0x0406;
pub const MSG_CMD_OUTPUT: u16 = 0x0407;
pub const MSG_CMD_COMBINED_OUTPUT: u16 = 0x0408;
pub const MSG_CMD_KILL: u16 = 0x0409;
pub const MSG_CMD_STDOUT_PIPE: u16 = 0x040a;
pub const MSG_CMD_STDERR_PIPE: u16 = 0x040b;
pub const MSG_CMD_STDIN_PIPE: u16 = 0x040c;
pub const MSG_CMD_CLOSE: u16 = 0x040d;

/// Net family.
pub const MSG_NET_LISTEN: u16 = 0x0500;
pub const MSG_LISTENER_ACCEPT: u16 = 0x0501;
pub const MSG_LISTENER_CLOSE: u16 = 0x0502;
pub const MSG_CONN_READ: u16 = 0x0503;
pub const MSG_CONN_WRITE: u16 = 0x0504;
pub const MSG_CONN_CLOSE: u16 = 0x0505;

/// Pipe handles returned by the cmd family.
pub const MSG_PIPE_READ: u16 = 0x0506;
pub const MSG_PIPE_WRITE: u16 = 0x0507;
pub const MSG_PIPE_CLOSE: u16 = 0x0508;

/// Snapshot family.
pub const MSG_FS_SNAPSHOT: u16 = 0x0600;
pub const MSG_SNAPSHOT_AS_SOURCE: u16 = 0x0601;
pub const MSG_SNAPSHOT_CLOSE: u16 = 0x0602;

/// Dockerfile family (reserved; building is served elsewhere).
pub const MSG_DOCKERFILE_BUILD: u16 = 0x0700;

/// Stream type tags inside `StreamChunk`.
pub const STREAM_STDOUT: u8 = 1;
pub const STREAM_STDERR: u8 = 2;

/// Wire error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    Unknown = 1,
    HypervisorUnavailable = 2,
    NotRunning = 3,
    AlreadyClosed = 4,
    Timeout = 5,
    Cancelled = 6,
    InvalidHandle = 7,
    InvalidArgument = 8,
    Io = 9,
}

impl ErrorCode {
    pub fn from_u8(v: u8) -> ErrorCode {
        match v {
            0 => ErrorCode::Ok,
            2 => ErrorCode::HypervisorUnavailable,
            3 => ErrorCode::NotRunning,
            4 => ErrorCode::AlreadyClosed,
            5 => ErrorCode::Timeout,
            6 => ErrorCode::Cancelled,
            7 => ErrorCode::InvalidHandle,
            8 => ErrorCode::InvalidArgument,
            9 => ErrorCode::Io,
            _ => ErrorCode::Unknown,
        }
    }
}

/// The error payload carried in `Error` frames: a sentinel code plus the
/// `{op, path}` pair callers need for precise diagnostics.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{op} {path}: {message} ({code:?})")]
pub struct IpcError {
    pub code: ErrorCode,
    pub message: String,
    pub op: String,
    pub path: String,
}

impl IpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        IpcError {
            code,
            message: message.into(),
            op: String::new(),
            path: String::new(),
        }
    }

    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = op.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn invalid_handle(handle: u64) -> Self {
        IpcError::new(ErrorCode::InvalidHandle, format!("invalid handle: {}", handle))
    }

    pub fn unknown_message_type(msg_type: u16) -> Self {
        IpcError::new(
            ErrorCode::InvalidArgument,
            format!("unknown message type: 0x{:04x}", msg_type),
        )
    }
}

impl Wire for IpcError {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(self.code as u8);
        enc.put_string(&self.message);
        enc.put_string(&self.op);
        enc.put_string(&self.path);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(IpcError {
            code: ErrorCode::from_u8(dec.get_u8()?),
            message: dec.get_string()?,
            op: dec.get_string()?,
            path: dec.get_string()?,
        })
    }
}

impl From<DecodeError> for IpcError {
    fn from(err: DecodeError) -> Self {
        IpcError::new(ErrorCode::InvalidArgument, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::Unknown,
            ErrorCode::HypervisorUnavailable,
            ErrorCode::NotRunning,
            ErrorCode::AlreadyClosed,
            ErrorCode::Timeout,
            ErrorCode::Cancelled,
            ErrorCode::InvalidHandle,
            ErrorCode::InvalidArgument,
            ErrorCode::Io,
        ] {
            assert_eq!(ErrorCode::from_u8(code as u8), code);
        }
        assert_eq!(ErrorCode::from_u8(200), ErrorCode::Unknown);
    }

    #[test]
    fn ipc_error_round_trips() {
        let err = IpcError::new(ErrorCode::Io, "read failed")
            .with_op("read_file")
            .with_path("/etc/os-release");
        let mut enc = Encoder::new();
        err.encode(&mut enc);
        let mut dec = Decoder::new(enc.as_slice());
        assert_eq!(IpcError::decode(&mut dec).unwrap(), err);
    }

    #[test]
    fn unknown_message_type_formats_hex() {
        let err = IpcError::unknown_message_type(0x0999);
        assert_eq!(err.message, "unknown message type: 0x0999");
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }
}
