// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Instance lifecycle: the layered filesystem, the image config defaults
//! applied to commands, the timeout clock and snapshot creation.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use cc_archive::{Archive, ArchiveWriter};
use cc_containerfs::{LayerStack, OverlayFs, resolve_path, write_upper_layer};
use cc_oci::ImageConfig;
use cc_proto::InstanceOptions;
use cc_vfs::{HostDir, MemFs, Node};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::backend::{BackendError, BackendResult, CommandSpec, VmBackend, VmCommand};

/// Instance construction error type
#[derive(thiserror::Error, Debug)]
pub enum InstanceError {
    #[error("layer archive: {0}")]
    Archive(#[from] cc_archive::ArchiveError),
    #[error("mount {tag}: {source}")]
    Mount {
        tag: String,
        #[source]
        source: cc_vfs::FsError,
    },
}

/// One virtio-fs style mount exposed to the guest under a tag.
pub struct MountPoint {
    pub tag: String,
    pub root: Node,
    pub writable: bool,
}

/// One helper owns at most one of these.
pub struct Instance {
    pub fs: OverlayFs,
    pub config: ImageConfig,
    pub options: InstanceOptions,
    backend: Box<dyn VmBackend>,
    /// Archive base paths of every layer below the upper, bottom first.
    layer_bases: Vec<PathBuf>,
    /// Cache key of the snapshot this instance booted from, if any.
    parent_cache_key: Option<String>,
    mounts: Vec<MountPoint>,
    deadline: Option<Instant>,
    terminated: AtomicBool,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance").finish_non_exhaustive()
    }
}

impl Instance {
    pub fn new(
        layer_bases: Vec<PathBuf>,
        config: ImageConfig,
        options: InstanceOptions,
        parent_cache_key: Option<String>,
        backend: Box<dyn VmBackend>,
    ) -> Result<Instance, InstanceError> {
        let mut layers = Vec::with_capacity(layer_bases.len());
        for base in &layer_bases {
            layers.push(Arc::new(Archive::open(base)?));
        }
        let stack = LayerStack::new(layers);

        // Mount trees handed to the guest fs server: a host directory,
        // or a fresh writable tree when no host path is given.
        let mut mounts = Vec::with_capacity(options.mounts.len());
        for mount in &options.mounts {
            let root = if mount.host_path.is_empty() {
                Node::Dir(MemFs::new().root())
            } else {
                HostDir::new(&mount.host_path)
                    .map_err(|source| InstanceError::Mount {
                        tag: mount.tag.clone(),
                        source,
                    })?
                    .root_node()
            };
            mounts.push(MountPoint {
                tag: mount.tag.clone(),
                root,
                writable: mount.writable,
            });
        }

        let deadline = if options.timeout_secs > 0.0 {
            Some(Instant::now() + Duration::from_secs_f64(options.timeout_secs))
        } else {
            None
        };
        Ok(Instance {
            fs: OverlayFs::new(stack),
            config,
            options,
            backend,
            layer_bases,
            parent_cache_key,
            mounts,
            deadline,
            terminated: AtomicBool::new(false),
        })
    }

    pub fn mounts(&self) -> &[MountPoint] {
        &self.mounts
    }

    pub fn mount(&self, tag: &str) -> Option<&MountPoint> {
        self.mounts.iter().find(|m| m.tag == tag)
    }

    pub fn parent_cache_key(&self) -> Option<&str> {
        self.parent_cache_key.as_deref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Apply image-config defaults and expand symlinked entrypoints.
    pub fn command_spec(&self, name: &str, args: &[String]) -> CommandSpec {
        let resolved_name = if name.starts_with('/') {
            match resolve_path(&self.fs, name) {
                Ok(path) => format!("/{}", path),
                Err(_) => name.to_string(),
            }
        } else {
            name.to_string()
        };
        let mut env = self.config.env.clone();
        if !self.options.user.is_empty() {
            env.push(format!("USER={}", self.options.user));
        }
        CommandSpec {
            name: resolved_name,
            args: args.to_vec(),
            env,
            dir: if self.config.working_dir.is_empty() {
                None
            } else {
                Some(self.config.working_dir.clone())
            },
        }
    }

    /// Spawn through the backend, honoring the instance deadline.
    pub async fn spawn(&self, spec: &CommandSpec) -> BackendResult<Box<dyn VmCommand>> {
        if self.is_terminated() {
            return Err(BackendError::NotRunning);
        }
        self.backend.spawn(spec).await
    }

    pub async fn listen(&self, port: u32) -> BackendResult<Box<dyn crate::backend::VmListener>> {
        if self.is_terminated() {
            return Err(BackendError::NotRunning);
        }
        self.backend.listen(port).await
    }

    /// Run a future against the instance timeout, if one is configured.
    pub async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = BackendResult<T>>,
    ) -> BackendResult<T> {
        match self.deadline {
            None => fut.await,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(BackendError::Timeout);
                }
                match tokio::time::timeout(left, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout),
                }
            }
        }
    }

    /// Terminate the VM. Idempotent; later operations see `NotRunning`.
    pub async fn terminate(&self) -> BackendResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("terminating instance");
        self.backend.shutdown().await
    }

    /// Serialize the writable upper layer into a new snapshot archive.
    pub fn snapshot(
        &self,
        excludes: &[String],
        cache_dir: &std::path::Path,
    ) -> cc_archive::Result<SnapshotRecord> {
        let parent_key = self.parent_cache_key();
        let cache_key = snapshot_cache_key(parent_key, excludes);
        let dir = cache_dir.join("snapshots");
        std::fs::create_dir_all(&dir)?;
        let base = dir.join(&cache_key);

        if !cc_archive::index_path(&base).exists() {
            let mut writer = ArchiveWriter::create(&base)?;
            write_upper_layer(self.fs.upper(), &mut writer, excludes)?;
            writer.finish()?;
        }
        debug!(cache_key = %cache_key, "snapshot written");

        let mut layer_bases = self.layer_bases.clone();
        layer_bases.push(base.clone());
        Ok(SnapshotRecord {
            base,
            cache_key,
            parent: parent_key.map(str::to_string),
            layer_bases,
            config: self.config.clone(),
        })
    }
}

/// A snapshot is both a layer and an instance source: it remembers the
/// whole stack beneath it plus the image config to boot from.
#[derive(Clone, Debug)]
pub struct SnapshotRecord {
    pub base: PathBuf,
    pub cache_key: String,
    /// Parent by cache key only, never by handle, so snapshot chains
    /// cannot keep instances alive.
    pub parent: Option<String>,
    pub layer_bases: Vec<PathBuf>,
    pub config: ImageConfig,
}

/// Deterministic key over the parent key and the exclude list.
pub fn snapshot_cache_key(parent: Option<&str>, excludes: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or("").as_bytes());
    for exclude in excludes {
        hasher.update([0u8]);
        hasher.update(exclude.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ProcessBackend;
    use cc_archive::{Entry, EntryKind};

    fn image_layer(dir: &std::path::Path) -> PathBuf {
        let base = dir.join("layer");
        let mut writer = ArchiveWriter::create(&base).unwrap();
        let mut entry = Entry::new(EntryKind::Regular, "etc/os-release");
        entry.mode = 0o644;
        writer.append_data(entry, &b"abcd\n"[..]).unwrap();
        writer.finish().unwrap();
        base
    }

    #[test]
    fn mounts_expose_host_directories_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("shared");
        std::fs::create_dir(&host).unwrap();
        std::fs::write(host.join("note.txt"), b"from host").unwrap();

        let options = InstanceOptions {
            mounts: vec![
                cc_proto::MountConfig {
                    tag: "work".into(),
                    host_path: host.display().to_string(),
                    writable: false,
                },
                cc_proto::MountConfig {
                    tag: "scratch".into(),
                    host_path: String::new(),
                    writable: true,
                },
            ],
            ..Default::default()
        };
        let instance = Instance::new(
            vec![image_layer(dir.path())],
            ImageConfig::default(),
            options,
            None,
            Box::new(ProcessBackend),
        )
        .unwrap();

        let work = instance.mount("work").unwrap();
        assert!(!work.writable);
        let note = work.root.as_dir().unwrap().lookup("note.txt").unwrap();
        assert_eq!(note.read_all().unwrap(), b"from host");

        let scratch = instance.mount("scratch").unwrap();
        assert!(scratch.writable);
        assert!(scratch.root.as_dir().unwrap().read_dir().unwrap().is_empty());
        assert!(instance.mount("missing").is_none());
    }

    #[test]
    fn missing_mount_path_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let options = InstanceOptions {
            mounts: vec![cc_proto::MountConfig {
                tag: "bad".into(),
                host_path: dir.path().join("nope").display().to_string(),
                writable: false,
            }],
            ..Default::default()
        };
        let err = Instance::new(
            vec![image_layer(dir.path())],
            ImageConfig::default(),
            options,
            None,
            Box::new(ProcessBackend),
        )
        .unwrap_err();
        assert!(matches!(err, InstanceError::Mount { tag, .. } if tag == "bad"));
    }

    #[test]
    fn cache_key_depends_on_parent_and_excludes() {
        let a = snapshot_cache_key(None, &[]);
        let b = snapshot_cache_key(None, &["tmp".to_string()]);
        let c = snapshot_cache_key(Some(&a), &[]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, snapshot_cache_key(None, &[]));
    }
}
