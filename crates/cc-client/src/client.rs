// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Typed stubs over the helper connection.
//!
//! One connection carries strictly ordered request/response pairs; the
//! shared inner connection is reference counted so handle stubs stay
//! cheap to clone. Handle lifecycle is explicit: call `close` when done;
//! the helper reclaims everything at shutdown regardless.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cc_proto::*;
use tokio::net::UnixStream;
use tracing::debug;

use crate::{ClientError, Result};

#[derive(Debug)]
struct ClientInner {
    stream: tokio::sync::Mutex<UnixStream>,
}

/// A connection to one helper.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub async fn connect(socket: &Path) -> Result<Client> {
        let stream = UnixStream::connect(socket).await?;
        Ok(Client {
            inner: Arc::new(ClientInner {
                stream: tokio::sync::Mutex::new(stream),
            }),
        })
    }

    /// One request/response exchange.
    async fn request<Req: Wire, Resp: Wire>(&self, msg_type: u16, req: &Req) -> Result<Resp> {
        let mut stream = self.inner.stream.lock().await;
        write_frame(&mut *stream, msg_type, &req.to_bytes()).await?;
        match read_frame(&mut *stream).await? {
            Some((MSG_RESPONSE, body)) => Ok(Resp::from_bytes(&body)?),
            Some((MSG_ERROR, body)) => Err(ClientError::Ipc(IpcError::from_bytes(&body)?)),
            Some((other, _)) => Err(ClientError::Protocol(format!(
                "unexpected frame type 0x{:04x}",
                other
            ))),
            None => Err(ClientError::Protocol("connection closed mid-request".to_string())),
        }
    }

    /// 1 ms non-blocking probe: EOF means the helper is gone; anything
    /// else (including a timeout) counts as alive.
    pub async fn is_alive(&self) -> bool {
        let stream = self.inner.stream.lock().await;
        let probe = tokio::time::timeout(Duration::from_millis(1), stream.readable()).await;
        match probe {
            Err(_) => true,
            Ok(Err(_)) => false,
            Ok(Ok(())) => {
                let mut buf = [0u8; 1];
                match stream.try_read(&mut buf) {
                    Ok(0) => false,
                    _ => true,
                }
            }
        }
    }

    // ---- instance ----

    pub async fn instance_new(&self, req: &InstanceNewRequest) -> Result<()> {
        self.request::<_, Empty>(MSG_INSTANCE_NEW, req).await?;
        Ok(())
    }

    /// Run the instance's main command; the VM terminates afterwards.
    pub async fn instance_exec(&self, name: &str, args: &[String]) -> Result<i32> {
        let resp: ExitResponse = self
            .request(
                MSG_INSTANCE_EXEC,
                &InstanceExecRequest {
                    name: name.to_string(),
                    args: args.to_vec(),
                },
            )
            .await?;
        Ok(resp.exit_code)
    }

    pub async fn instance_close(&self) -> Result<()> {
        self.request::<_, Empty>(MSG_INSTANCE_CLOSE, &Empty).await?;
        Ok(())
    }

    pub async fn capabilities(&self) -> Result<CapabilitiesResponse> {
        self.request(MSG_CAPABILITIES, &Empty).await
    }

    pub async fn resolve_path(&self, path: &str) -> Result<String> {
        let resp: PathResponse = self
            .request(
                MSG_INSTANCE_RESOLVE_PATH,
                &PathRequest {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(resp.path)
    }

    // ---- filesystem ----

    pub async fn fs_read_file(&self, path: &str) -> Result<Vec<u8>> {
        let resp: BytesResponse = self
            .request(
                MSG_FS_READ_FILE,
                &PathRequest {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(resp.data)
    }

    pub async fn fs_write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        self.request::<_, Empty>(
            MSG_FS_WRITE_FILE,
            &FsWriteFileRequest {
                path: path.to_string(),
                data: data.to_vec(),
                mode,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn fs_stat(&self, path: &str) -> Result<FileInfo> {
        self.request(
            MSG_FS_STAT,
            &PathRequest {
                path: path.to_string(),
            },
        )
        .await
    }

    pub async fn fs_read_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let resp: FileInfoList = self
            .request(
                MSG_FS_READ_DIR,
                &PathRequest {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(resp.entries)
    }

    pub async fn fs_remove(&self, path: &str) -> Result<()> {
        self.request::<_, Empty>(
            MSG_FS_REMOVE,
            &PathRequest {
                path: path.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn fs_snapshot(&self, excludes: &[String], cache_dir: &str) -> Result<Snapshot> {
        let resp: HandleResponse = self
            .request(
                MSG_FS_SNAPSHOT,
                &FsSnapshotRequest {
                    excludes: excludes.to_vec(),
                    cache_dir: cache_dir.to_string(),
                },
            )
            .await?;
        Ok(Snapshot {
            client: self.clone(),
            handle: resp.handle,
        })
    }

    pub async fn open_file(&self, path: &str, flags: i32, mode: u32) -> Result<RemoteFile> {
        let resp: HandleResponse = self
            .request(
                MSG_FILE_OPEN,
                &FileOpenRequest {
                    path: path.to_string(),
                    flags,
                    mode,
                },
            )
            .await?;
        Ok(RemoteFile {
            client: self.clone(),
            handle: resp.handle,
        })
    }

    // ---- commands ----

    pub async fn command(&self, name: &str, args: &[String]) -> Result<Cmd> {
        let resp: HandleResponse = self
            .request(
                MSG_CMD_NEW,
                &CmdNewRequest {
                    name: name.to_string(),
                    args: args.to_vec(),
                },
            )
            .await?;
        debug!(handle = resp.handle, name, "command handle created");
        Ok(Cmd {
            client: self.clone(),
            handle: resp.handle,
        })
    }

    // ---- net ----

    pub async fn listen(&self, port: u32) -> Result<Listener> {
        let resp: HandleResponse =
            self.request(MSG_NET_LISTEN, &NetListenRequest { port }).await?;
        Ok(Listener {
            client: self.clone(),
            handle: resp.handle,
        })
    }
}

/// A command handle. Configure, then start/wait or use a run variant.
#[derive(Clone)]
pub struct Cmd {
    client: Client,
    pub handle: u64,
}

impl Cmd {
    pub async fn set_env(&self, env: &[String]) -> Result<()> {
        self.client
            .request::<_, Empty>(
                MSG_CMD_SET_ENV,
                &CmdSetEnvRequest {
                    handle: self.handle,
                    env: env.to_vec(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn set_dir(&self, dir: &str) -> Result<()> {
        self.client
            .request::<_, Empty>(
                MSG_CMD_SET_DIR,
                &CmdSetDirRequest {
                    handle: self.handle,
                    dir: dir.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.client
            .request::<_, Empty>(MSG_CMD_START, &HandleRequest { handle: self.handle })
            .await?;
        Ok(())
    }

    pub async fn wait(&self) -> Result<i32> {
        let resp: ExitResponse = self
            .client
            .request(MSG_CMD_WAIT, &HandleRequest { handle: self.handle })
            .await?;
        Ok(resp.exit_code)
    }

    pub async fn run(&self) -> Result<i32> {
        let resp: ExitResponse = self
            .client
            .request(MSG_CMD_RUN, &HandleRequest { handle: self.handle })
            .await?;
        Ok(resp.exit_code)
    }

    pub async fn output(&self) -> Result<(i32, Vec<u8>)> {
        let resp: OutputResponse = self
            .client
            .request(MSG_CMD_OUTPUT, &HandleRequest { handle: self.handle })
            .await?;
        Ok((resp.exit_code, resp.output))
    }

    pub async fn combined_output(&self) -> Result<(i32, Vec<u8>)> {
        let resp: OutputResponse = self
            .client
            .request(MSG_CMD_COMBINED_OUTPUT, &HandleRequest { handle: self.handle })
            .await?;
        Ok((resp.exit_code, resp.output))
    }

    pub async fn kill(&self) -> Result<()> {
        self.client
            .request::<_, Empty>(MSG_CMD_KILL, &HandleRequest { handle: self.handle })
            .await?;
        Ok(())
    }

    pub async fn stdout_pipe(&self) -> Result<Pipe> {
        self.pipe(MSG_CMD_STDOUT_PIPE).await
    }

    pub async fn stderr_pipe(&self) -> Result<Pipe> {
        self.pipe(MSG_CMD_STDERR_PIPE).await
    }

    pub async fn stdin_pipe(&self) -> Result<Pipe> {
        self.pipe(MSG_CMD_STDIN_PIPE).await
    }

    async fn pipe(&self, msg_type: u16) -> Result<Pipe> {
        let resp: HandleResponse = self
            .client
            .request(msg_type, &HandleRequest { handle: self.handle })
            .await?;
        Ok(Pipe {
            client: self.client.clone(),
            handle: resp.handle,
        })
    }

    /// Stream the command's output. `on_chunk` observes `(stream, data)`
    /// pairs in per-stream order; the exit code arrives with `StreamEnd`.
    pub async fn run_streaming(
        &self,
        mut on_chunk: impl FnMut(u8, &[u8]),
    ) -> Result<i32> {
        let mut stream = self.client.inner.stream.lock().await;
        write_frame(
            &mut *stream,
            MSG_CMD_RUN_STREAMING,
            &HandleRequest { handle: self.handle }.to_bytes(),
        )
        .await?;

        loop {
            match read_frame(&mut *stream).await? {
                Some((MSG_STREAM_CHUNK, body)) => {
                    let chunk = StreamChunk::from_bytes(&body)?;
                    on_chunk(chunk.stream_type, &chunk.data);
                }
                Some((MSG_STREAM_END, body)) => {
                    let end = StreamEnd::from_bytes(&body)?;
                    return Ok(end.exit_code);
                }
                Some((MSG_ERROR, body)) => {
                    return Err(ClientError::Ipc(IpcError::from_bytes(&body)?));
                }
                Some((other, _)) => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected frame 0x{:04x} in stream",
                        other
                    )));
                }
                None => {
                    return Err(ClientError::Protocol("connection closed mid-stream".to_string()));
                }
            }
        }
    }

    pub async fn close(self) -> Result<()> {
        self.client
            .request::<_, Empty>(MSG_CMD_CLOSE, &HandleRequest { handle: self.handle })
            .await?;
        Ok(())
    }
}

/// An open file handle inside the instance.
#[derive(Clone)]
pub struct RemoteFile {
    client: Client,
    pub handle: u64,
}

impl RemoteFile {
    pub async fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let resp: BytesResponse = self
            .client
            .request(
                MSG_FILE_READ_AT,
                &FileReadAtRequest {
                    handle: self.handle,
                    offset,
                    len,
                },
            )
            .await?;
        Ok(resp.data)
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let resp: CountResponse = self
            .client
            .request(
                MSG_FILE_WRITE_AT,
                &FileWriteAtRequest {
                    handle: self.handle,
                    offset,
                    data: data.to_vec(),
                },
            )
            .await?;
        Ok(resp.count)
    }

    pub async fn close(self) -> Result<()> {
        self.client
            .request::<_, Empty>(MSG_FILE_CLOSE, &HandleRequest { handle: self.handle })
            .await?;
        Ok(())
    }
}

/// Guest-exposed TCP listener.
#[derive(Clone)]
pub struct Listener {
    client: Client,
    pub handle: u64,
}

impl Listener {
    pub async fn accept(&self) -> Result<NetConn> {
        let resp: HandleResponse = self
            .client
            .request(MSG_LISTENER_ACCEPT, &HandleRequest { handle: self.handle })
            .await?;
        Ok(NetConn {
            client: self.client.clone(),
            handle: resp.handle,
        })
    }

    pub async fn close(self) -> Result<()> {
        self.client
            .request::<_, Empty>(MSG_LISTENER_CLOSE, &HandleRequest { handle: self.handle })
            .await?;
        Ok(())
    }
}

/// One accepted connection.
#[derive(Clone)]
pub struct NetConn {
    client: Client,
    pub handle: u64,
}

impl NetConn {
    pub async fn read(&self, len: u32) -> Result<Vec<u8>> {
        let resp: BytesResponse = self
            .client
            .request(
                MSG_CONN_READ,
                &ReadRequest {
                    handle: self.handle,
                    len,
                },
            )
            .await?;
        Ok(resp.data)
    }

    pub async fn write(&self, data: &[u8]) -> Result<u32> {
        let resp: CountResponse = self
            .client
            .request(
                MSG_CONN_WRITE,
                &WriteRequest {
                    handle: self.handle,
                    data: data.to_vec(),
                },
            )
            .await?;
        Ok(resp.count)
    }

    pub async fn close(self) -> Result<()> {
        self.client
            .request::<_, Empty>(MSG_CONN_CLOSE, &HandleRequest { handle: self.handle })
            .await?;
        Ok(())
    }
}

/// A command stdio pipe.
#[derive(Clone, Debug)]
pub struct Pipe {
    client: Client,
    pub handle: u64,
}

impl Pipe {
    /// Read up to `len` bytes; empty data means EOF.
    pub async fn read(&self, len: u32) -> Result<Vec<u8>> {
        let resp: BytesResponse = self
            .client
            .request(
                MSG_PIPE_READ,
                &ReadRequest {
                    handle: self.handle,
                    len,
                },
            )
            .await?;
        Ok(resp.data)
    }

    pub async fn write(&self, data: &[u8]) -> Result<u32> {
        let resp: CountResponse = self
            .client
            .request(
                MSG_PIPE_WRITE,
                &WriteRequest {
                    handle: self.handle,
                    data: data.to_vec(),
                },
            )
            .await?;
        Ok(resp.count)
    }

    pub async fn close(self) -> Result<()> {
        self.client
            .request::<_, Empty>(MSG_PIPE_CLOSE, &HandleRequest { handle: self.handle })
            .await?;
        Ok(())
    }
}

/// A filesystem snapshot handle; usable both as a layer and a source.
#[derive(Clone)]
pub struct Snapshot {
    client: Client,
    pub handle: u64,
}

impl Snapshot {
    /// Snapshots double as instance sources; the helper hands the same
    /// handle back.
    pub async fn as_source(&self) -> Result<u64> {
        let resp: HandleResponse = self
            .client
            .request(MSG_SNAPSHOT_AS_SOURCE, &HandleRequest { handle: self.handle })
            .await?;
        Ok(resp.handle)
    }

    pub async fn close(self) -> Result<()> {
        self.client
            .request::<_, Empty>(MSG_SNAPSHOT_CLOSE, &HandleRequest { handle: self.handle })
            .await?;
        Ok(())
    }
}
