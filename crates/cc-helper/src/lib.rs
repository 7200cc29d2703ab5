// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Helper process internals.
//!
//! One helper owns one VM instance and serves the binary IPC protocol
//! over a Unix socket: a mux of typed handlers in front of handle tables
//! for files, commands, listeners, connections, pipes and snapshots.

pub mod backend;
pub mod instance;
pub mod operations;
pub mod server;
pub mod state;

use cc_proto::{ErrorCode, IpcError};
use cc_vfs::FsError;

/// Map filesystem errors onto the wire taxonomy, attaching `{op, path}`.
pub fn fs_ipc_error(err: FsError, op: &str, path: &str) -> IpcError {
    let code = match err {
        FsError::ReadOnly => ErrorCode::InvalidArgument,
        FsError::InvalidArgument | FsError::InvalidName => ErrorCode::InvalidArgument,
        _ => ErrorCode::Io,
    };
    IpcError::new(code, err.to_string()).with_op(op).with_path(path)
}
