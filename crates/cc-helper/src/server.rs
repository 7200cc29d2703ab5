// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The IPC server: one Unix listener, one task per connection, requests
//! serviced strictly in wire order within a connection. Streaming
//! handlers own the connection until their `StreamEnd`.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use cc_proto::{
    IpcError, MSG_CMD_RUN_STREAMING, MSG_ERROR, MSG_RESPONSE, Wire, read_frame, write_frame,
};
use futures::FutureExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::operations;
use crate::state::HelperState;

pub struct HelperServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    state: Arc<HelperState>,
}

impl HelperServer {
    pub fn new(socket_path: PathBuf) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            debug!(socket_path = %socket_path.display(), "removing stale socket");
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        info!(socket_path = %socket_path.display(), "helper listening");
        Ok(HelperServer {
            socket_path,
            listener: Some(listener),
            state: Arc::new(HelperState::new()),
        })
    }

    pub fn state(&self) -> Arc<HelperState> {
        self.state.clone()
    }

    /// Accept loop. Runs until the task is cancelled from outside.
    pub async fn run(&mut self) -> Result<()> {
        let listener = self.listener.take().ok_or_else(|| anyhow!("server already running"))?;
        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let state = self.state.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(state, stream).await {
                                    error!(error = %e, "connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                // Reap finished connection tasks as they complete.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    /// Cancel in-flight handlers, wait for them, then remove the socket.
    pub async fn shutdown(self) -> Result<()> {
        info!("helper shutting down");
        let close = operations::close_everything(&self.state).await;
        if let Err(e) = close {
            warn!(error = %e, "close path reported an error");
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        Ok(())
    }
}

async fn handle_connection(state: Arc<HelperState>, stream: UnixStream) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    while let Some((msg_type, body)) = read_frame(&mut reader).await? {
        dispatch(&state, msg_type, body, &mut writer).await?;
    }
    Ok(())
}

/// One request, strictly serialized with its connection peers.
async fn dispatch(
    state: &Arc<HelperState>,
    msg_type: u16,
    body: Vec<u8>,
    writer: &mut tokio::net::unix::OwnedWriteHalf,
) -> std::io::Result<()> {
    if msg_type == MSG_CMD_RUN_STREAMING {
        // The streaming handler owns the connection until StreamEnd.
        if let Err(err) = operations::cmd_run_streaming(state, &body, writer).await {
            debug!(error = %err, "streaming request failed");
            write_frame(writer, MSG_ERROR, &err.to_bytes()).await?;
        }
        return Ok(());
    }

    // A panicking handler must not poison the helper process.
    let outcome = AssertUnwindSafe(operations::handle_request(state, msg_type, &body))
        .catch_unwind()
        .await;
    let (reply_type, payload) = match outcome {
        Ok(Ok(payload)) => (MSG_RESPONSE, payload),
        Ok(Err(err)) => {
            debug!(msg_type = format_args!("0x{:04x}", msg_type), error = %err, "request failed");
            (MSG_ERROR, err.to_bytes())
        }
        Err(_) => {
            error!(msg_type = format_args!("0x{:04x}", msg_type), "handler panicked");
            let err =
                IpcError::new(cc_proto::ErrorCode::Unknown, "handler panicked");
            (MSG_ERROR, err.to_bytes())
        }
    };
    write_frame(writer, reply_type, &payload).await
}
