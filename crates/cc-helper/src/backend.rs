// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The hypervisor seam.
//!
//! The helper drives commands and guest sockets through [`VmBackend`];
//! the hypervisor-backed implementation lives out of tree and registers
//! through the same trait. The in-tree [`ProcessBackend`] runs commands
//! as host processes, which backs local development and the test suite.

use async_trait::async_trait;
use cc_proto::{ErrorCode, IpcError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command as TokioCommand;
use tracing::debug;

/// Backend error type
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),
    #[error("instance not running")]
    NotRunning,
    #[error("operation timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BackendError> for IpcError {
    fn from(err: BackendError) -> Self {
        let code = match &err {
            BackendError::HypervisorUnavailable(_) => ErrorCode::HypervisorUnavailable,
            BackendError::NotRunning => ErrorCode::NotRunning,
            BackendError::Timeout => ErrorCode::Timeout,
            BackendError::Cancelled => ErrorCode::Cancelled,
            BackendError::Io(_) => ErrorCode::Io,
        };
        IpcError::new(code, err.to_string())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Fully resolved command invocation.
#[derive(Clone, Debug, Default)]
pub struct CommandSpec {
    pub name: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub dir: Option<String>,
}

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A started command inside the VM.
#[async_trait]
pub trait VmCommand: Send {
    /// Wait for exit. Non-zero status is data, not an error.
    async fn wait(&mut self) -> BackendResult<i32>;
    async fn kill(&mut self) -> BackendResult<()>;
    fn take_stdout(&mut self) -> Option<BoxedRead>;
    fn take_stderr(&mut self) -> Option<BoxedRead>;
    fn take_stdin(&mut self) -> Option<BoxedWrite>;
}

/// A TCP listener exposed from the guest.
#[async_trait]
pub trait VmListener: Send + Sync {
    async fn accept(&self) -> BackendResult<Box<dyn VmConn>>;
}

/// One accepted connection.
#[async_trait]
pub trait VmConn: Send {
    async fn read(&mut self, len: usize) -> BackendResult<Vec<u8>>;
    async fn write(&mut self, data: &[u8]) -> BackendResult<usize>;
}

/// The VM side of one instance.
#[async_trait]
pub trait VmBackend: Send + Sync {
    async fn spawn(&self, spec: &CommandSpec) -> BackendResult<Box<dyn VmCommand>>;
    async fn listen(&self, port: u32) -> BackendResult<Box<dyn VmListener>>;
    /// Tear the VM down; further operations fail with `NotRunning`.
    async fn shutdown(&self) -> BackendResult<()>;
}

/// Host-process implementation of the backend seam.
pub struct ProcessBackend;

#[async_trait]
impl VmBackend for ProcessBackend {
    async fn spawn(&self, spec: &CommandSpec) -> BackendResult<Box<dyn VmCommand>> {
        let mut command = TokioCommand::new(&spec.name);
        command
            .args(&spec.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for pair in &spec.env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }
        if let Some(dir) = &spec.dir {
            command.current_dir(dir);
        }
        debug!(name = %spec.name, args = ?spec.args, "spawning command");
        let child = command.spawn()?;
        Ok(Box::new(ProcessCommand { child }))
    }

    async fn listen(&self, port: u32) -> BackendResult<Box<dyn VmListener>> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port as u16)).await?;
        Ok(Box::new(ProcessListener { listener }))
    }

    async fn shutdown(&self) -> BackendResult<()> {
        Ok(())
    }
}

struct ProcessCommand {
    child: tokio::process::Child,
}

#[async_trait]
impl VmCommand for ProcessCommand {
    async fn wait(&mut self) -> BackendResult<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> BackendResult<()> {
        self.child.kill().await?;
        Ok(())
    }

    fn take_stdout(&mut self) -> Option<BoxedRead> {
        self.child.stdout.take().map(|s| Box::new(s) as BoxedRead)
    }

    fn take_stderr(&mut self) -> Option<BoxedRead> {
        self.child.stderr.take().map(|s| Box::new(s) as BoxedRead)
    }

    fn take_stdin(&mut self) -> Option<BoxedWrite> {
        self.child.stdin.take().map(|s| Box::new(s) as BoxedWrite)
    }
}

struct ProcessListener {
    listener: tokio::net::TcpListener,
}

#[async_trait]
impl VmListener for ProcessListener {
    async fn accept(&self) -> BackendResult<Box<dyn VmConn>> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(ProcessConn { stream }))
    }
}

struct ProcessConn {
    stream: tokio::net::TcpStream,
}

#[async_trait]
impl VmConn for ProcessConn {
    async fn read(&mut self, len: usize) -> BackendResult<Vec<u8>> {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; len.min(1 << 20)];
        let n = self.stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn write(&mut self, data: &[u8]) -> BackendResult<usize> {
        use tokio::io::AsyncWriteExt;
        self.stream.write_all(data).await?;
        Ok(data.len())
    }
}
