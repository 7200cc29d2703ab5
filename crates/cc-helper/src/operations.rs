// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request handlers behind the mux. Each returns the encoded response
//! payload or an [`IpcError`]; invalid handles never disturb other
//! entries, and non-zero command exits are ordinary results.

use std::sync::Arc;

use cc_containerfs::resolve_path;
use cc_oci::ImageStore;
use cc_proto::*;
use cc_vfs::NodeKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::backend::{BoxedRead, ProcessBackend};
use crate::fs_ipc_error;
use crate::instance::Instance;
use crate::state::{
    CmdEntry, CmdState, ConnEntry, FileEntry, HelperState, ListenerEntry, PipeReaderEntry,
    PipeWriterEntry,
};

type HandlerResult = Result<Vec<u8>, IpcError>;

const PIPE_CHUNK: usize = 32 * 1024;

/// File open flags on the wire.
mod flags {
    pub const O_WRONLY: i32 = 0x0001;
    pub const O_RDWR: i32 = 0x0002;
    pub const O_CREATE: i32 = 0x0200;
    pub const O_TRUNC: i32 = 0x0400;
}

pub async fn handle_request(
    state: &Arc<HelperState>,
    msg_type: u16,
    body: &[u8],
) -> HandlerResult {
    match msg_type {
        MSG_INSTANCE_NEW => instance_new(state, body).await,
        MSG_INSTANCE_EXEC => instance_exec(state, body).await,
        MSG_INSTANCE_CLOSE => instance_close(state).await,
        MSG_INSTANCE_RESOLVE_PATH => instance_resolve_path(state, body),
        MSG_CAPABILITIES => capabilities(),
        MSG_FS_READ_FILE => fs_read_file(state, body),
        MSG_FS_WRITE_FILE => fs_write_file(state, body),
        MSG_FS_STAT => fs_stat(state, body),
        MSG_FS_READ_DIR => fs_read_dir(state, body),
        MSG_FS_REMOVE => fs_remove(state, body),
        MSG_FILE_OPEN => file_open(state, body),
        MSG_FILE_READ_AT => file_read_at(state, body),
        MSG_FILE_WRITE_AT => file_write_at(state, body),
        MSG_FILE_CLOSE => file_close(state, body),
        MSG_CMD_NEW => cmd_new(state, body),
        MSG_CMD_SET_ENV => cmd_set_env(state, body).await,
        MSG_CMD_SET_DIR => cmd_set_dir(state, body).await,
        MSG_CMD_START => cmd_start(state, body).await,
        MSG_CMD_WAIT => cmd_wait(state, body).await,
        MSG_CMD_RUN => cmd_run(state, body).await,
        MSG_CMD_OUTPUT => cmd_output(state, body, false).await,
        MSG_CMD_COMBINED_OUTPUT => cmd_output(state, body, true).await,
        MSG_CMD_KILL => cmd_kill(state, body).await,
        MSG_CMD_STDOUT_PIPE => cmd_pipe(state, body, PipeKind::Stdout).await,
        MSG_CMD_STDERR_PIPE => cmd_pipe(state, body, PipeKind::Stderr).await,
        MSG_CMD_STDIN_PIPE => cmd_pipe(state, body, PipeKind::Stdin).await,
        MSG_CMD_CLOSE => cmd_close(state, body).await,
        MSG_NET_LISTEN => net_listen(state, body).await,
        MSG_LISTENER_ACCEPT => listener_accept(state, body).await,
        MSG_LISTENER_CLOSE => listener_close(state, body),
        MSG_CONN_READ => conn_read(state, body).await,
        MSG_CONN_WRITE => conn_write(state, body).await,
        MSG_CONN_CLOSE => conn_close(state, body),
        MSG_PIPE_READ => pipe_read(state, body).await,
        MSG_PIPE_WRITE => pipe_write(state, body).await,
        MSG_PIPE_CLOSE => pipe_close(state, body),
        MSG_FS_SNAPSHOT => fs_snapshot(state, body).await,
        MSG_SNAPSHOT_AS_SOURCE => snapshot_as_source(state, body),
        MSG_SNAPSHOT_CLOSE => snapshot_close(state, body),
        MSG_DOCKERFILE_BUILD => Err(IpcError::new(
            ErrorCode::InvalidArgument,
            "dockerfile builds are not served by this helper",
        )),
        other => Err(IpcError::unknown_message_type(other)),
    }
}

fn oci_ipc_error(err: cc_oci::OciError, op: &str) -> IpcError {
    let code = match &err {
        cc_oci::OciError::BadReference { .. } => ErrorCode::InvalidArgument,
        _ => ErrorCode::Io,
    };
    IpcError::new(code, err.to_string()).with_op(op)
}

fn archive_ipc_error(err: cc_archive::ArchiveError, op: &str) -> IpcError {
    IpcError::new(ErrorCode::Io, err.to_string()).with_op(op)
}

// ---- instance ----

async fn instance_new(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = InstanceNewRequest::from_bytes(body)?;
    // Fail fast before any expensive image work; set_instance re-checks.
    if state.instance().is_ok() {
        return Err(IpcError::new(ErrorCode::InvalidArgument, "instance already exists"));
    }

    let arch = std::env::consts::ARCH;
    let (layer_bases, config, parent_key) = match req.source_type {
        SourceType::Tar => {
            let store = ImageStore::new(&req.cache_dir);
            let path = std::path::PathBuf::from(&req.source_path);
            let image = tokio::task::spawn_blocking(move || store.import_tar(&path, arch))
                .await
                .map_err(|e| IpcError::new(ErrorCode::Unknown, e.to_string()))?
                .map_err(|e| oci_ipc_error(e, "import_tar"))?;
            (image_layer_bases(&image), image.config, None)
        }
        SourceType::Dir => {
            let store = ImageStore::new(&req.cache_dir);
            let image = store
                .load_dir(std::path::Path::new(&req.source_path))
                .map_err(|e| oci_ipc_error(e, "load_dir"))?;
            (image_layer_bases(&image), image.config, None)
        }
        SourceType::Ref => {
            let store = ImageStore::new(&req.cache_dir);
            let image = store
                .pull(&req.image_ref, arch, None)
                .await
                .map_err(|e| oci_ipc_error(e, "pull"))?;
            (image_layer_bases(&image), image.config, None)
        }
        SourceType::Snapshot => {
            let record = state.snapshot(req.source_handle)?;
            (
                record.layer_bases.clone(),
                record.config.clone(),
                Some(record.cache_key.clone()),
            )
        }
    };

    info!(layers = layer_bases.len(), source = ?req.source_type, "creating instance");
    let instance = Instance::new(
        layer_bases,
        config,
        req.options,
        parent_key,
        Box::new(ProcessBackend),
    )
    .map_err(|e| IpcError::new(ErrorCode::Io, e.to_string()).with_op("instance_new"))?;
    state.set_instance(Arc::new(instance))?;
    Ok(Empty.to_bytes())
}

async fn instance_exec(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = InstanceExecRequest::from_bytes(body)?;
    let instance = state.instance()?;
    let spec = instance.command_spec(&req.name, &req.args);

    let mut cmd = instance
        .with_deadline(instance.spawn(&spec))
        .await
        .map_err(IpcError::from)?;
    let exit_code = instance.with_deadline(cmd.wait()).await.map_err(IpcError::from)?;

    // Exec is the instance's main program; its exit ends the VM.
    let _ = instance.terminate().await;
    Ok(ExitResponse { exit_code }.to_bytes())
}

async fn instance_close(state: &Arc<HelperState>) -> HandlerResult {
    close_everything(state).await?;
    Ok(Empty.to_bytes())
}

/// Close path: conns, listeners, files, snapshots, then the instance.
/// Errors accumulate; the first one is surfaced after everything ran.
pub async fn close_everything(state: &Arc<HelperState>) -> Result<(), IpcError> {
    let (conns, listeners, files, snapshots, instance) = state.drain_for_close();
    let mut first_error: Option<IpcError> = None;

    drop(conns);
    drop(listeners);
    drop(files);
    drop(snapshots);
    if let Some(instance) = instance {
        if let Err(e) = instance.terminate().await {
            first_error.get_or_insert(e.into());
        }
    }
    match first_error {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// System capabilities. The hypervisor bit reflects whether a real VM
/// backend is wired in; the in-tree process backend does not count.
fn capabilities() -> HandlerResult {
    Ok(CapabilitiesResponse {
        hypervisor_available: false,
        max_memory_mb: 0,
        max_cpus: std::thread::available_parallelism().map(|n| n.get() as i32).unwrap_or(0),
        architecture: std::env::consts::ARCH.to_string(),
    }
    .to_bytes())
}

fn instance_resolve_path(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = PathRequest::from_bytes(body)?;
    let instance = state.instance()?;
    let resolved = resolve_path(&instance.fs, &req.path)
        .map_err(|e| fs_ipc_error(e, "resolve_path", &req.path))?;
    Ok(PathResponse {
        path: format!("/{}", resolved),
    }
    .to_bytes())
}

fn image_layer_bases(image: &cc_oci::LoadedImage) -> Vec<std::path::PathBuf> {
    image.config.layers.iter().map(|digest| image.dir.join(digest)).collect()
}

// ---- filesystem ----

fn fs_read_file(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = PathRequest::from_bytes(body)?;
    let instance = state.instance()?;
    let data = instance
        .fs
        .read_file(&req.path)
        .map_err(|e| fs_ipc_error(e, "read_file", &req.path))?;
    Ok(BytesResponse { data }.to_bytes())
}

fn fs_write_file(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = FsWriteFileRequest::from_bytes(body)?;
    let instance = state.instance()?;
    instance
        .fs
        .write_file(&req.path, &req.data, req.mode)
        .map_err(|e| fs_ipc_error(e, "write_file", &req.path))?;
    Ok(Empty.to_bytes())
}

fn fs_stat(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = PathRequest::from_bytes(body)?;
    let instance = state.instance()?;
    let (kind, stat) =
        instance.fs.stat(&req.path).map_err(|e| fs_ipc_error(e, "stat", &req.path))?;
    let name = req.path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("/").to_string();
    Ok(FileInfo {
        name,
        size: stat.size as i64,
        mode: stat.mode,
        mod_time: stat.mod_time,
        is_dir: kind == NodeKind::Dir,
        is_symlink: kind == NodeKind::Symlink,
    }
    .to_bytes())
}

fn fs_read_dir(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = PathRequest::from_bytes(body)?;
    let instance = state.instance()?;
    let entries = instance
        .fs
        .read_dir(&req.path)
        .map_err(|e| fs_ipc_error(e, "read_dir", &req.path))?;
    let entries = entries
        .into_iter()
        .map(|e| FileInfo {
            name: e.name,
            size: e.stat.size as i64,
            mode: e.stat.mode,
            mod_time: e.stat.mod_time,
            is_dir: e.kind == NodeKind::Dir,
            is_symlink: e.kind == NodeKind::Symlink,
        })
        .collect();
    Ok(FileInfoList { entries }.to_bytes())
}

fn fs_remove(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = PathRequest::from_bytes(body)?;
    let instance = state.instance()?;
    instance.fs.remove(&req.path).map_err(|e| fs_ipc_error(e, "remove", &req.path))?;
    Ok(Empty.to_bytes())
}

// ---- file handles ----

fn file_open(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = FileOpenRequest::from_bytes(body)?;
    let instance = state.instance()?;
    let wants_write = req.flags & (flags::O_WRONLY | flags::O_RDWR) != 0;

    let node = if wants_write {
        // Copy up so writes land in the mutable upper layer.
        let existing = instance.fs.read_file(&req.path);
        let initial = match existing {
            Ok(_) if req.flags & flags::O_TRUNC != 0 => Vec::new(),
            Ok(data) => data,
            Err(cc_vfs::FsError::NotFound) if req.flags & flags::O_CREATE != 0 => Vec::new(),
            Err(e) => return Err(fs_ipc_error(e, "open", &req.path)),
        };
        instance
            .fs
            .write_file(&req.path, &initial, req.mode)
            .map_err(|e| fs_ipc_error(e, "open", &req.path))?;
        instance.fs.lookup(&req.path).map_err(|e| fs_ipc_error(e, "open", &req.path))?
    } else {
        instance.fs.lookup(&req.path).map_err(|e| fs_ipc_error(e, "open", &req.path))?
    };
    if node.as_file().is_err() {
        return Err(IpcError::new(ErrorCode::InvalidArgument, "not a regular file")
            .with_op("open")
            .with_path(&req.path));
    }

    let handle = state.insert_file(Arc::new(FileEntry {
        path: req.path,
        node,
    }));
    Ok(HandleResponse { handle }.to_bytes())
}

fn file_read_at(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = FileReadAtRequest::from_bytes(body)?;
    let entry = state.file(req.handle)?;
    let file = entry.node.as_file().map_err(|e| fs_ipc_error(e, "read_at", &entry.path))?;
    let mut buf = vec![0u8; req.len as usize];
    let n = file
        .read_at(&mut buf, req.offset)
        .map_err(|e| fs_ipc_error(e, "read_at", &entry.path))?;
    buf.truncate(n);
    Ok(BytesResponse { data: buf }.to_bytes())
}

fn file_write_at(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = FileWriteAtRequest::from_bytes(body)?;
    let entry = state.file(req.handle)?;
    let file = entry.node.as_file().map_err(|e| fs_ipc_error(e, "write_at", &entry.path))?;
    let n = file
        .write_at(&req.data, req.offset)
        .map_err(|e| fs_ipc_error(e, "write_at", &entry.path))?;
    Ok(CountResponse { count: n as u32 }.to_bytes())
}

fn file_close(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    state.remove_file(req.handle)?;
    Ok(Empty.to_bytes())
}

// ---- commands ----

fn cmd_new(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = CmdNewRequest::from_bytes(body)?;
    let instance = state.instance()?;
    let spec = instance.command_spec(&req.name, &req.args);
    let handle = state.insert_cmd(Arc::new(CmdEntry {
        state: tokio::sync::Mutex::new(CmdState::Configured(spec)),
    }));
    debug!(handle, "command created");
    Ok(HandleResponse { handle }.to_bytes())
}

async fn cmd_set_env(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = CmdSetEnvRequest::from_bytes(body)?;
    let entry = state.cmd(req.handle)?;
    let mut guard = entry.state.lock().await;
    match &mut *guard {
        CmdState::Configured(spec) => {
            spec.env.extend(req.env);
            Ok(Empty.to_bytes())
        }
        _ => Err(IpcError::new(ErrorCode::InvalidArgument, "command already started")),
    }
}

async fn cmd_set_dir(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = CmdSetDirRequest::from_bytes(body)?;
    let entry = state.cmd(req.handle)?;
    let mut guard = entry.state.lock().await;
    match &mut *guard {
        CmdState::Configured(spec) => {
            spec.dir = Some(req.dir);
            Ok(Empty.to_bytes())
        }
        _ => Err(IpcError::new(ErrorCode::InvalidArgument, "command already started")),
    }
}

async fn cmd_start(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    let entry = state.cmd(req.handle)?;
    let instance = state.instance()?;
    let mut guard = entry.state.lock().await;
    let spec = match &*guard {
        CmdState::Configured(spec) => spec.clone(),
        _ => return Err(IpcError::new(ErrorCode::InvalidArgument, "command already started")),
    };
    let cmd = instance.with_deadline(instance.spawn(&spec)).await.map_err(IpcError::from)?;
    *guard = CmdState::Running(cmd);
    Ok(Empty.to_bytes())
}

async fn cmd_wait(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    let entry = state.cmd(req.handle)?;
    let instance = state.instance()?;
    let mut guard = entry.state.lock().await;
    match &mut *guard {
        CmdState::Running(cmd) => {
            let exit_code = instance.with_deadline(cmd.wait()).await.map_err(IpcError::from)?;
            *guard = CmdState::Done(exit_code);
            Ok(ExitResponse { exit_code }.to_bytes())
        }
        CmdState::Done(exit_code) => Ok(ExitResponse {
            exit_code: *exit_code,
        }
        .to_bytes()),
        CmdState::Configured(_) => {
            Err(IpcError::new(ErrorCode::NotRunning, "command not started"))
        }
        CmdState::Closed => Err(IpcError::new(ErrorCode::AlreadyClosed, "command closed")),
    }
}

async fn cmd_run(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    let entry = state.cmd(req.handle)?;
    let instance = state.instance()?;
    let mut guard = entry.state.lock().await;
    let spec = match &*guard {
        CmdState::Configured(spec) => spec.clone(),
        _ => return Err(IpcError::new(ErrorCode::InvalidArgument, "command already started")),
    };
    let mut cmd = instance.with_deadline(instance.spawn(&spec)).await.map_err(IpcError::from)?;
    // Drain the output pipes so a chatty command cannot wedge on a full
    // pipe while we wait.
    let stdout = cmd.take_stdout();
    let stderr = cmd.take_stderr();
    tokio::spawn(drain(stdout));
    tokio::spawn(drain(stderr));
    let exit_code = instance.with_deadline(cmd.wait()).await.map_err(IpcError::from)?;
    *guard = CmdState::Done(exit_code);
    Ok(ExitResponse { exit_code }.to_bytes())
}

async fn drain(pipe: Option<BoxedRead>) {
    if let Some(mut pipe) = pipe {
        let mut sink = tokio::io::sink();
        let _ = tokio::io::copy(&mut pipe, &mut sink).await;
    }
}

async fn cmd_output(state: &Arc<HelperState>, body: &[u8], combined: bool) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    let entry = state.cmd(req.handle)?;
    let instance = state.instance()?;
    let mut guard = entry.state.lock().await;
    let spec = match &*guard {
        CmdState::Configured(spec) => spec.clone(),
        _ => return Err(IpcError::new(ErrorCode::InvalidArgument, "command already started")),
    };
    let mut cmd = instance.with_deadline(instance.spawn(&spec)).await.map_err(IpcError::from)?;

    let stdout = cmd.take_stdout();
    let stderr = cmd.take_stderr();
    let sink = Arc::new(tokio::sync::Mutex::new(Vec::<u8>::new()));

    let mut readers = Vec::new();
    if let Some(stdout) = stdout {
        readers.push(tokio::spawn(collect(stdout, sink.clone())));
    }
    match (combined, stderr) {
        (true, Some(stderr)) => readers.push(tokio::spawn(collect(stderr, sink.clone()))),
        (false, stderr) => {
            readers.push(tokio::spawn(async move {
                drain(stderr).await;
            }));
        }
        (true, None) => {}
    }

    let exit_code = instance.with_deadline(cmd.wait()).await.map_err(IpcError::from)?;
    for reader in readers {
        let _ = reader.await;
    }
    *guard = CmdState::Done(exit_code);

    let output = std::mem::take(&mut *sink.lock().await);
    Ok(OutputResponse { exit_code, output }.to_bytes())
}

async fn collect(mut pipe: BoxedRead, sink: Arc<tokio::sync::Mutex<Vec<u8>>>) {
    let mut buf = [0u8; PIPE_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.lock().await.extend_from_slice(&buf[..n]),
        }
    }
}

async fn cmd_kill(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    let entry = state.cmd(req.handle)?;
    let mut guard = entry.state.lock().await;
    match &mut *guard {
        CmdState::Running(cmd) => {
            cmd.kill().await.map_err(IpcError::from)?;
            Ok(Empty.to_bytes())
        }
        _ => Err(IpcError::new(ErrorCode::NotRunning, "command not running")),
    }
}

enum PipeKind {
    Stdout,
    Stderr,
    Stdin,
}

async fn cmd_pipe(state: &Arc<HelperState>, body: &[u8], kind: PipeKind) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    let entry = state.cmd(req.handle)?;
    let mut guard = entry.state.lock().await;
    let cmd = match &mut *guard {
        CmdState::Running(cmd) => cmd,
        _ => return Err(IpcError::new(ErrorCode::NotRunning, "command not running")),
    };
    let handle = match kind {
        PipeKind::Stdout | PipeKind::Stderr => {
            let pipe = match kind {
                PipeKind::Stdout => cmd.take_stdout(),
                _ => cmd.take_stderr(),
            };
            let pipe = pipe.ok_or_else(|| {
                IpcError::new(ErrorCode::InvalidArgument, "pipe already taken")
            })?;
            state.insert_pipe_reader(Arc::new(PipeReaderEntry {
                reader: tokio::sync::Mutex::new(pipe),
            }))
        }
        PipeKind::Stdin => {
            let pipe = cmd.take_stdin().ok_or_else(|| {
                IpcError::new(ErrorCode::InvalidArgument, "pipe already taken")
            })?;
            state.insert_pipe_writer(Arc::new(PipeWriterEntry {
                writer: tokio::sync::Mutex::new(pipe),
            }))
        }
    };
    Ok(HandleResponse { handle }.to_bytes())
}

async fn cmd_close(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    let entry = state.remove_cmd(req.handle)?;
    let mut guard = entry.state.lock().await;
    if let CmdState::Running(cmd) = &mut *guard {
        let _ = cmd.kill().await;
    }
    *guard = CmdState::Closed;
    Ok(Empty.to_bytes())
}

// ---- streaming ----

/// `CmdRunStreaming`: chunks flow until both pipes close, then exactly
/// one `StreamEnd` with the exit code.
pub async fn cmd_run_streaming(
    state: &Arc<HelperState>,
    body: &[u8],
    writer: &mut tokio::net::unix::OwnedWriteHalf,
) -> Result<(), IpcError> {
    let req = HandleRequest::from_bytes(body)?;
    let entry = state.cmd(req.handle)?;
    let instance = state.instance()?;
    let mut guard = entry.state.lock().await;
    let spec = match &*guard {
        CmdState::Configured(spec) => spec.clone(),
        _ => return Err(IpcError::new(ErrorCode::InvalidArgument, "command already started")),
    };

    let mut cmd = instance.with_deadline(instance.spawn(&spec)).await.map_err(IpcError::from)?;
    let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamChunk>(16);
    if let Some(stdout) = cmd.take_stdout() {
        tokio::spawn(pump(stdout, STREAM_STDOUT, tx.clone()));
    }
    if let Some(stderr) = cmd.take_stderr() {
        tokio::spawn(pump(stderr, STREAM_STDERR, tx.clone()));
    }
    drop(tx);

    while let Some(chunk) = rx.recv().await {
        write_frame(writer, MSG_STREAM_CHUNK, &chunk.to_bytes())
            .await
            .map_err(|e| IpcError::new(ErrorCode::Io, e.to_string()))?;
    }

    let exit_code = instance.with_deadline(cmd.wait()).await.map_err(IpcError::from)?;
    *guard = CmdState::Done(exit_code);
    write_frame(
        writer,
        MSG_STREAM_END,
        &StreamEnd { code: 0, exit_code }.to_bytes(),
    )
    .await
    .map_err(|e| IpcError::new(ErrorCode::Io, e.to_string()))?;
    Ok(())
}

/// Forward one pipe as chunks, preserving per-stream write order.
async fn pump(mut pipe: BoxedRead, stream_type: u8, tx: tokio::sync::mpsc::Sender<StreamChunk>) {
    let mut buf = [0u8; PIPE_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = StreamChunk {
                    stream_type,
                    data: buf[..n].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        }
    }
}

// ---- net ----

async fn net_listen(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = NetListenRequest::from_bytes(body)?;
    let instance = state.instance()?;
    let listener = instance.listen(req.port).await.map_err(IpcError::from)?;
    let handle = state.insert_listener(Arc::new(ListenerEntry { listener }));
    Ok(HandleResponse { handle }.to_bytes())
}

async fn listener_accept(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    let entry = state.listener(req.handle)?;
    let conn = entry.listener.accept().await.map_err(IpcError::from)?;
    let handle = state.insert_conn(Arc::new(ConnEntry {
        conn: tokio::sync::Mutex::new(conn),
    }));
    Ok(HandleResponse { handle }.to_bytes())
}

fn listener_close(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    state.remove_listener(req.handle)?;
    Ok(Empty.to_bytes())
}

async fn conn_read(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = ReadRequest::from_bytes(body)?;
    let entry = state.conn(req.handle)?;
    let mut conn = entry.conn.lock().await;
    let data = conn.read(req.len as usize).await.map_err(IpcError::from)?;
    Ok(BytesResponse { data }.to_bytes())
}

async fn conn_write(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = WriteRequest::from_bytes(body)?;
    let entry = state.conn(req.handle)?;
    let mut conn = entry.conn.lock().await;
    let n = conn.write(&req.data).await.map_err(IpcError::from)?;
    Ok(CountResponse { count: n as u32 }.to_bytes())
}

fn conn_close(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    state.remove_conn(req.handle)?;
    Ok(Empty.to_bytes())
}

// ---- pipes ----

async fn pipe_read(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = ReadRequest::from_bytes(body)?;
    let entry = state.pipe_reader(req.handle)?;
    let mut reader = entry.reader.lock().await;
    let mut buf = vec![0u8; (req.len as usize).min(1 << 20)];
    // EOF is an empty success, not an error.
    let n = reader
        .read(&mut buf)
        .await
        .map_err(|e| IpcError::new(ErrorCode::Io, e.to_string()).with_op("pipe_read"))?;
    buf.truncate(n);
    Ok(BytesResponse { data: buf }.to_bytes())
}

async fn pipe_write(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = WriteRequest::from_bytes(body)?;
    let entry = state.pipe_writer(req.handle)?;
    let mut writer = entry.writer.lock().await;
    writer
        .write_all(&req.data)
        .await
        .map_err(|e| IpcError::new(ErrorCode::Io, e.to_string()).with_op("pipe_write"))?;
    writer
        .flush()
        .await
        .map_err(|e| IpcError::new(ErrorCode::Io, e.to_string()).with_op("pipe_write"))?;
    Ok(CountResponse {
        count: req.data.len() as u32,
    }
    .to_bytes())
}

fn pipe_close(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    // A pipe handle lives in exactly one of the two tables.
    if state.remove_pipe_reader(req.handle).is_ok() {
        return Ok(Empty.to_bytes());
    }
    state.remove_pipe_writer(req.handle)?;
    Ok(Empty.to_bytes())
}

// ---- snapshots ----

async fn fs_snapshot(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = FsSnapshotRequest::from_bytes(body)?;
    let instance = state.instance()?;
    let cache_dir = std::path::PathBuf::from(&req.cache_dir);
    let excludes = req.excludes.clone();
    let record = tokio::task::spawn_blocking(move || {
        instance.snapshot(&excludes, &cache_dir)
    })
    .await
    .map_err(|e| IpcError::new(ErrorCode::Unknown, e.to_string()))?
    .map_err(|e| archive_ipc_error(e, "snapshot"))?;

    let handle = state.insert_snapshot(Arc::new(record));
    info!(handle, "snapshot created");
    Ok(HandleResponse { handle }.to_bytes())
}

fn snapshot_as_source(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    // Snapshots are both layers and sources; the handle is unchanged.
    state.snapshot(req.handle)?;
    Ok(HandleResponse { handle: req.handle }.to_bytes())
}

fn snapshot_close(state: &Arc<HelperState>, body: &[u8]) -> HandlerResult {
    let req = HandleRequest::from_bytes(body)?;
    state.remove_snapshot(req.handle)?;
    Ok(Empty.to_bytes())
}
