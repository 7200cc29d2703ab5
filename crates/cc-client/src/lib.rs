// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Client library for the cc helper: binary discovery, process spawn,
//! connection management and typed stubs over the wire protocol.

mod client;
mod spawn;

pub use client::{Client, Cmd, Listener, NetConn, Pipe, RemoteFile, Snapshot};
pub use spawn::{Helper, find_helper_binary, socket_path, spawn_helper, spawn_helper_at};

use std::path::PathBuf;

use cc_proto::{DecodeError, IpcError};

/// Client-side error type
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("helper binary not found; searched {searched:?}")]
    HelperNotFound { searched: Vec<PathBuf> },
    #[error("helper did not accept a connection within {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DecodeError> for ClientError {
    fn from(err: DecodeError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
