// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Helper discovery and process lifecycle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{Client, ClientError, Result};

const HELPER_ENV: &str = "CC_HELPER_PATH";
const HELPER_BIN: &str = if cfg!(windows) { "cc-helper.exe" } else { "cc-helper" };

const CONNECT_BACKOFF: Duration = Duration::from_millis(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Locate the helper binary: `CC_HELPER_PATH`, the current executable's
/// directory, the platform user-data directory, then `PATH`.
pub fn find_helper_binary() -> Result<PathBuf> {
    let mut searched = Vec::new();

    if let Some(path) = std::env::var_os(HELPER_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        searched.push(path);
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(HELPER_BIN);
            if candidate.is_file() {
                return Ok(candidate);
            }
            searched.push(candidate);
        }
    }

    for data_dir in [dirs::data_dir(), dirs::data_local_dir()].into_iter().flatten() {
        let candidate = data_dir.join("cc").join("bin").join(HELPER_BIN);
        if candidate.is_file() {
            return Ok(candidate);
        }
        searched.push(candidate);
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(HELPER_BIN);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        searched.push(PathBuf::from("$PATH"));
    }

    Err(ClientError::HelperNotFound { searched })
}

/// Fresh socket path under a short subdirectory; `sun_path` is only 108
/// bytes on most Unixes.
pub fn socket_path() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp = std::env::temp_dir();
    tmp.join("cc").join(format!("h-{}-{}.sock", std::process::id(), n))
}

/// A spawned helper process bound to one socket.
pub struct Helper {
    child: tokio::process::Child,
    socket_path: PathBuf,
}

impl Helper {
    pub fn socket(&self) -> &Path {
        &self.socket_path
    }

    /// Kill the helper, grant it a grace period, remove the socket file.
    pub async fn shutdown(mut self) -> Result<()> {
        debug!(socket = %self.socket_path.display(), "shutting helper down");
        let _ = self.child.start_kill();
        match tokio::time::timeout(KILL_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "helper exited"),
            Ok(Err(e)) => warn!(error = %e, "helper wait failed"),
            Err(_) => warn!("helper did not exit within the grace period"),
        }
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        Ok(())
    }
}

/// Spawn a helper and poll-connect to it.
pub async fn spawn_helper() -> Result<(Helper, Client)> {
    let binary = find_helper_binary()?;
    spawn_helper_at(&binary).await
}

pub async fn spawn_helper_at(binary: &Path) -> Result<(Helper, Client)> {
    let socket = socket_path();
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!(binary = %binary.display(), socket = %socket.display(), "spawning helper");
    let child = tokio::process::Command::new(binary)
        .arg("--socket")
        .arg(&socket)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::inherit())
        .spawn()?;

    let helper = Helper {
        child,
        socket_path: socket.clone(),
    };

    let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
    loop {
        match Client::connect(&socket).await {
            Ok(client) => return Ok((helper, client)),
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(_) => {
                let _ = helper.shutdown().await;
                return Err(ClientError::ConnectTimeout(CONNECT_TIMEOUT));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_paths_are_unique_and_short_dirred() {
        let a = socket_path();
        let b = socket_path();
        assert_ne!(a, b);
        assert!(a.parent().unwrap().ends_with("cc"));
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("h-"));
    }

    #[test]
    fn missing_helper_reports_searched_paths() {
        // Point the env override somewhere nonexistent and clear PATH so
        // discovery cannot accidentally succeed on a developer machine.
        let dir = tempfile::tempdir().unwrap();
        let saved_path = std::env::var_os("PATH");
        std::env::set_var(HELPER_ENV, dir.path().join("nope"));
        std::env::set_var("PATH", dir.path());

        let result = find_helper_binary();

        std::env::remove_var(HELPER_ENV);
        if let Some(path) = saved_path {
            std::env::set_var("PATH", path);
        }
        match result {
            Err(ClientError::HelperNotFound { searched }) => {
                assert!(!searched.is_empty());
            }
            other => panic!(
                "expected HelperNotFound, got {:?}",
                other.map(|p| p.display().to_string())
            ),
        }
    }
}
