// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end helper tests: an in-process server over a real Unix socket,
//! driven by the client stubs.

use std::path::Path;

use cc_client::Client;
use cc_helper::server::HelperServer;
use cc_proto::{ErrorCode, InstanceNewRequest, InstanceOptions, SourceType};

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

/// A one-layer `docker save` tar whose rootfs holds `/etc/os-release`.
fn build_save_tar() -> Vec<u8> {
    let mut layer = tar::Builder::new(Vec::new());
    append_file(&mut layer, "etc/os-release", b"abcd\n");
    append_file(&mut layer, "etc/hostname", b"box\n");
    let layer_bytes = layer.into_inner().unwrap();

    let config = serde_json::json!({
        "architecture": "amd64",
        "config": {"Env": [], "Cmd": ["/bin/sh"]}
    });
    let manifest = serde_json::json!([{
        "Config": "cfg.json",
        "RepoTags": ["e2e:latest"],
        "Layers": ["layer1/layer.tar"]
    }]);

    let mut save = tar::Builder::new(Vec::new());
    append_file(&mut save, "manifest.json", &serde_json::to_vec(&manifest).unwrap());
    append_file(&mut save, "cfg.json", &serde_json::to_vec(&config).unwrap());
    append_file(&mut save, "layer1/layer.tar", &layer_bytes);
    save.into_inner().unwrap()
}

async fn start_server(dir: &Path) -> (Client, tokio::task::JoinHandle<()>) {
    let socket = dir.join("h.sock");
    let mut server = HelperServer::new(socket.clone()).unwrap();
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });
    // The listener is bound before run(), so connect retries are cheap.
    let client = loop {
        match Client::connect(&socket).await {
            Ok(client) => break client,
            Err(_) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
        }
    };
    (client, task)
}

fn tar_instance_request(dir: &Path) -> InstanceNewRequest {
    let tar_path = dir.join("image.tar");
    std::fs::write(&tar_path, build_save_tar()).unwrap();
    InstanceNewRequest {
        source_type: SourceType::Tar,
        source_path: tar_path.display().to_string(),
        image_ref: String::new(),
        source_handle: 0,
        cache_dir: dir.join("cache").display().to_string(),
        options: InstanceOptions::default(),
    }
}

#[tokio::test]
async fn load_tar_and_read_file() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = start_server(dir.path()).await;

    client.instance_new(&tar_instance_request(dir.path())).await.unwrap();
    let data = client.fs_read_file("/etc/os-release").await.unwrap();
    assert_eq!(data, b"abcd\n");

    let info = client.fs_stat("/etc/os-release").await.unwrap();
    assert_eq!(info.name, "os-release");
    assert_eq!(info.size, 5);
    assert!(!info.is_dir);

    let names: Vec<_> = client
        .fs_read_dir("/etc")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["hostname", "os-release"]);

    server.abort();
}

#[tokio::test]
async fn at_most_one_instance_per_helper() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = start_server(dir.path()).await;

    client.instance_new(&tar_instance_request(dir.path())).await.unwrap();
    let err = client.instance_new(&tar_instance_request(dir.path())).await.unwrap_err();
    match err {
        cc_client::ClientError::Ipc(ipc) => {
            assert_eq!(ipc.code, ErrorCode::InvalidArgument);
        }
        other => panic!("expected ipc error, got {:?}", other),
    }

    server.abort();
}

#[tokio::test]
async fn writes_shadow_and_removals_whiteout() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = start_server(dir.path()).await;
    client.instance_new(&tar_instance_request(dir.path())).await.unwrap();

    client.fs_write_file("/etc/os-release", b"patched", 0o644).await.unwrap();
    assert_eq!(client.fs_read_file("/etc/os-release").await.unwrap(), b"patched");

    client.fs_remove("/etc/hostname").await.unwrap();
    let err = client.fs_read_file("/etc/hostname").await.unwrap_err();
    match err {
        cc_client::ClientError::Ipc(ipc) => {
            assert_eq!(ipc.code, ErrorCode::Io);
            assert_eq!(ipc.path, "/etc/hostname");
        }
        other => panic!("expected ipc error, got {:?}", other),
    }

    server.abort();
}

#[cfg(unix)]
#[tokio::test]
async fn streaming_exec_preserves_per_stream_order() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = start_server(dir.path()).await;
    client.instance_new(&tar_instance_request(dir.path())).await.unwrap();

    let cmd = client
        .command(
            "sh",
            &[
                "-c".to_string(),
                "printf foo; printf bar 1>&2; exit 2".to_string(),
            ],
        )
        .await
        .unwrap();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let exit = cmd
        .run_streaming(|stream, data| match stream {
            cc_proto::STREAM_STDOUT => stdout.extend_from_slice(data),
            cc_proto::STREAM_STDERR => stderr.extend_from_slice(data),
            other => panic!("unknown stream {}", other),
        })
        .await
        .unwrap();

    assert_eq!(exit, 2);
    assert_eq!(stdout, b"foo");
    assert_eq!(stderr, b"bar");

    server.abort();
}

#[cfg(unix)]
#[tokio::test]
async fn command_exit_codes_are_data_not_errors() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = start_server(dir.path()).await;
    client.instance_new(&tar_instance_request(dir.path())).await.unwrap();

    let cmd = client
        .command("sh", &["-c".to_string(), "exit 3".to_string()])
        .await
        .unwrap();
    assert_eq!(cmd.run().await.unwrap(), 3);

    let cmd = client
        .command("sh", &["-c".to_string(), "printf hello".to_string()])
        .await
        .unwrap();
    let (exit, output) = cmd.output().await.unwrap();
    assert_eq!(exit, 0);
    assert_eq!(output, b"hello");

    server.abort();
}

#[cfg(unix)]
#[tokio::test]
async fn invalid_handles_leave_tables_intact() {
    use cc_proto::{HandleRequest, MSG_CMD_WAIT, MSG_ERROR, Wire, read_frame, write_frame};

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("h.sock");
    let (client, server) = {
        let mut server = HelperServer::new(socket.clone()).unwrap();
        let task = tokio::spawn(async move {
            let _ = server.run().await;
        });
        let client = loop {
            match Client::connect(&socket).await {
                Ok(client) => break client,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            }
        };
        (client, task)
    };
    client.instance_new(&tar_instance_request(dir.path())).await.unwrap();

    let cmd = client
        .command("sh", &["-c".to_string(), "exit 0".to_string()])
        .await
        .unwrap();

    // A bogus handle on a second connection errors without disturbing
    // the real one.
    let mut raw = tokio::net::UnixStream::connect(&socket).await.unwrap();
    write_frame(
        &mut raw,
        MSG_CMD_WAIT,
        &HandleRequest { handle: 9999 }.to_bytes(),
    )
    .await
    .unwrap();
    let (ty, body) = read_frame(&mut raw).await.unwrap().unwrap();
    assert_eq!(ty, MSG_ERROR);
    let err = cc_proto::IpcError::from_bytes(&body).unwrap();
    assert_eq!(err.code, ErrorCode::InvalidHandle);

    assert_eq!(cmd.run().await.unwrap(), 0);
    server.abort();
}

#[tokio::test]
async fn unknown_message_type_gets_invalid_argument() {
    use cc_proto::{MSG_ERROR, Wire, read_frame, write_frame};

    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("h.sock");
    let mut server = HelperServer::new(socket.clone()).unwrap();
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });

    let mut stream = loop {
        match tokio::net::UnixStream::connect(&socket).await {
            Ok(s) => break s,
            Err(_) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
        }
    };

    write_frame(&mut stream, 0x0999, b"").await.unwrap();
    let (ty, body) = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(ty, MSG_ERROR);
    let err = cc_proto::IpcError::from_bytes(&body).unwrap();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    assert_eq!(err.message, "unknown message type: 0x0999");

    task.abort();
}

#[tokio::test]
async fn snapshot_round_trips_as_source() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = start_server(dir.path()).await;
    client.instance_new(&tar_instance_request(dir.path())).await.unwrap();

    client.fs_write_file("/srv/data", b"payload", 0o600).await.unwrap();
    let snapshot = client
        .fs_snapshot(&[], &dir.path().join("cache").display().to_string())
        .await
        .unwrap();
    assert!(snapshot.handle >= 1);
    assert_eq!(snapshot.as_source().await.unwrap(), snapshot.handle);

    server.abort();
}

#[cfg(unix)]
#[tokio::test]
async fn pipes_carry_stdio_both_ways() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = start_server(dir.path()).await;
    client.instance_new(&tar_instance_request(dir.path())).await.unwrap();

    let cmd = client.command("cat", &[]).await.unwrap();
    cmd.start().await.unwrap();
    let stdin = cmd.stdin_pipe().await.unwrap();
    let stdout = cmd.stdout_pipe().await.unwrap();

    stdin.write(b"echoed through cat").await.unwrap();
    stdin.close().await.unwrap();

    let mut collected = Vec::new();
    loop {
        let chunk = stdout.read(4096).await.unwrap();
        if chunk.is_empty() {
            break; // EOF arrives as an empty success
        }
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"echoed through cat");
    assert_eq!(cmd.wait().await.unwrap(), 0);

    // Taking the same pipe twice is refused.
    let err = cmd.stdout_pipe().await.unwrap_err();
    assert!(matches!(err, cc_client::ClientError::Ipc(_)));

    server.abort();
}

#[tokio::test]
async fn file_handles_read_and_write() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = start_server(dir.path()).await;
    client.instance_new(&tar_instance_request(dir.path())).await.unwrap();

    // Read-only handle over a layer-backed file.
    let file = client.open_file("/etc/os-release", 0, 0).await.unwrap();
    assert_eq!(file.read_at(0, 16).await.unwrap(), b"abcd\n");
    assert_eq!(file.read_at(2, 2).await.unwrap(), b"cd");
    file.close().await.unwrap();

    // Writable handle copies up into the instance's upper layer.
    let file = client
        .open_file("/etc/os-release", 0x0001, 0o644)
        .await
        .unwrap();
    file.write_at(0, b"XY").await.unwrap();
    file.close().await.unwrap();
    assert_eq!(client.fs_read_file("/etc/os-release").await.unwrap(), b"XYcd\n");

    // O_CREATE makes new files.
    let file = client
        .open_file("/srv/new.txt", 0x0001 | 0x0200, 0o600)
        .await
        .unwrap();
    file.write_at(0, b"fresh").await.unwrap();
    file.close().await.unwrap();
    assert_eq!(client.fs_read_file("/srv/new.txt").await.unwrap(), b"fresh");

    server.abort();
}

#[tokio::test]
async fn listener_accepts_and_echoes() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let dir = tempfile::tempdir().unwrap();
    let (client, server) = start_server(dir.path()).await;
    client.instance_new(&tar_instance_request(dir.path())).await.unwrap();

    // Port 0 lets the backend pick; the process backend binds loopback,
    // so drive it with a local TCP client.
    let listener = client.listen(40413).await.unwrap();

    let connect = tokio::spawn(async move {
        let mut sock = tokio::net::TcpStream::connect(("127.0.0.1", 40413)).await.unwrap();
        sock.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        sock.read_exact(&mut buf).await.unwrap();
        buf
    });

    let conn = listener.accept().await.unwrap();
    let got = conn.read(64).await.unwrap();
    assert_eq!(got, b"ping");
    conn.write(b"pong").await.unwrap();

    assert_eq!(&connect.await.unwrap(), b"pong");

    conn.close().await.unwrap();
    listener.close().await.unwrap();
    server.abort();
}

#[cfg(unix)]
#[tokio::test]
async fn instance_exec_terminates_the_instance() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = start_server(dir.path()).await;
    client.instance_new(&tar_instance_request(dir.path())).await.unwrap();

    let exit = client
        .instance_exec("sh", &["-c".to_string(), "exit 7".to_string()])
        .await
        .unwrap();
    assert_eq!(exit, 7);

    // The VM is gone; further commands cannot start.
    let cmd = client
        .command("sh", &["-c".to_string(), "true".to_string()])
        .await
        .unwrap();
    let err = cmd.run().await.unwrap_err();
    match err {
        cc_client::ClientError::Ipc(ipc) => assert_eq!(ipc.code, ErrorCode::NotRunning),
        other => panic!("expected NotRunning, got {:?}", other),
    }

    server.abort();
}

#[tokio::test]
async fn capabilities_report_the_host() {
    let dir = tempfile::tempdir().unwrap();
    let (client, server) = start_server(dir.path()).await;

    let caps = client.capabilities().await.unwrap();
    // No hypervisor backend is registered in this build.
    assert!(!caps.hypervisor_available);
    assert_eq!(caps.architecture, std::env::consts::ARCH);

    server.abort();
}
