// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Image materialization: registry pulls and `docker save` imports both
//! end in the same on-disk shape, `<image dir>/config.json` plus one
//! `<hex-digest>.idx`/`.contents` archive pair per layer.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cc_archive::Archive;
use cc_containerfs::LayerStack;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::convert::convert_tar_to_archive;
use crate::progress::ProgressFn;
use crate::reference::{ImageReference, sanitize};
use crate::registry::RegistryClient;
use crate::{OciError, Result, oci_arch};

/// The image directory's `config.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Layer digests (hex, no algorithm prefix) in application order.
    pub layers: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub architecture: String,
}

/// A materialized image, ready to stack.
#[derive(Clone, Debug)]
pub struct LoadedImage {
    pub dir: PathBuf,
    pub config: ImageConfig,
}

impl LoadedImage {
    /// Open every layer archive, bottom-most first.
    pub fn layer_archives(&self) -> Result<Vec<Arc<Archive>>> {
        self.config
            .layers
            .iter()
            .map(|digest| Ok(Arc::new(Archive::open(&self.dir.join(digest))?)))
            .collect()
    }

    pub fn layer_stack(&self) -> Result<Arc<LayerStack>> {
        Ok(LayerStack::new(self.layer_archives()?))
    }
}

pub struct ImageStore {
    cache_dir: PathBuf,
    client: RegistryClient,
}

impl ImageStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        ImageStore {
            cache_dir: cache_dir.into(),
            client: RegistryClient::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn image_dir(&self, key: &str) -> PathBuf {
        self.cache_dir.join("images").join(key)
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.cache_dir.join("blobs").join(sanitize(digest))
    }

    /// Load a previously materialized image directory.
    pub fn load_dir(&self, dir: &Path) -> Result<LoadedImage> {
        let raw = std::fs::read(dir.join("config.json"))?;
        let config: ImageConfig = serde_json::from_slice(&raw)?;
        Ok(LoadedImage {
            dir: dir.to_path_buf(),
            config,
        })
    }

    /// Pull `reference` for `arch`, idempotently. A present `config.json`
    /// short-circuits the whole fetch.
    pub async fn pull(
        &self,
        reference: &str,
        arch: &str,
        progress: Option<ProgressFn>,
    ) -> Result<LoadedImage> {
        let key = format!("{}-{}", sanitize(reference), arch);
        let image_dir = self.image_dir(&key);
        if image_dir.join("config.json").exists() {
            debug!(reference, key, "image already materialized");
            return self.load_dir(&image_dir);
        }
        std::fs::create_dir_all(&image_dir)?;
        std::fs::create_dir_all(self.cache_dir.join("blobs"))?;

        let parsed = ImageReference::parse(reference)?;
        let (manifest, media_type) = self.client.fetch_manifest(&parsed).await?;
        let manifest = self.resolve_manifest(&parsed, manifest, &media_type, arch).await?;
        let resolved = parse_manifest(&manifest)?;

        info!(
            reference,
            layers = resolved.layers.len(),
            "pulling image"
        );
        let blob_count = resolved.layers.len() as i32 + 1;
        let mut layer_digests = Vec::with_capacity(resolved.layers.len());
        for (index, layer) in resolved.layers.iter().enumerate() {
            let hex_digest = strip_algorithm(&layer.digest);
            let blob = self.blob_path(&layer.digest);
            if !blob.exists() {
                self.client
                    .fetch_blob(
                        &parsed,
                        &layer.digest,
                        &blob,
                        index as i32,
                        blob_count,
                        progress.as_ref(),
                    )
                    .await?;
            }

            let layer_base = image_dir.join(&hex_digest);
            if !cc_archive::index_path(&layer_base).exists() {
                let gz = layer.media_type.as_deref().map(|t| t.contains("gzip"));
                let file = std::fs::File::open(&blob)?;
                convert_tar_to_archive(std::io::BufReader::new(file), gz, &layer_base)?;
            }
            layer_digests.push(hex_digest);
        }

        let mut config = match &resolved.config_digest {
            Some(digest) => {
                let blob = self.blob_path(digest);
                if !blob.exists() {
                    self.client
                        .fetch_blob(
                            &parsed,
                            digest,
                            &blob,
                            blob_count - 1,
                            blob_count,
                            progress.as_ref(),
                        )
                        .await?;
                }
                let raw = std::fs::read(&blob)?;
                extract_image_config(&serde_json::from_slice(&raw)?)
            }
            None => resolved.inline_config.clone().unwrap_or_default(),
        };
        config.layers = layer_digests;
        if config.architecture.is_empty() {
            config.architecture = oci_arch(arch).to_string();
        }

        write_config(&image_dir, &config)?;
        Ok(LoadedImage {
            dir: image_dir,
            config,
        })
    }

    /// Descend from a fat manifest to the child matching `arch`.
    async fn resolve_manifest(
        &self,
        reference: &ImageReference,
        manifest: serde_json::Value,
        media_type: &str,
        arch: &str,
    ) -> Result<serde_json::Value> {
        if !is_index(&manifest, media_type) {
            return Ok(manifest);
        }
        let wanted = oci_arch(arch);
        let manifests = manifest
            .get("manifests")
            .and_then(|m| m.as_array())
            .ok_or_else(|| OciError::Manifest("index without manifests".to_string()))?;
        let child = manifests
            .iter()
            .find(|m| {
                m.get("platform")
                    .and_then(|p| p.get("architecture"))
                    .and_then(|a| a.as_str())
                    == Some(wanted)
            })
            .and_then(|m| m.get("digest"))
            .and_then(|d| d.as_str())
            .ok_or_else(|| OciError::NoManifestForArch {
                arch: wanted.to_string(),
            })?;
        debug!(digest = child, arch = wanted, "descending into image index");
        self.client.fetch_manifest_digest(reference, child).await
    }

    /// Import a `docker save` tar. The file is iterated once per pass
    /// (manifest, config, layers) so it is never fully buffered.
    pub fn import_tar(&self, tar_path: &Path, arch: &str) -> Result<LoadedImage> {
        let key = format!("{}-{}", sanitize(&tar_path.display().to_string()), arch);
        let image_dir = self.image_dir(&key);
        if image_dir.join("config.json").exists() {
            return self.load_dir(&image_dir);
        }
        std::fs::create_dir_all(&image_dir)?;

        // Pass 1: the save manifest.
        let save: SaveManifest = {
            let raw = read_tar_entry(tar_path, "manifest.json")?
                .ok_or_else(|| OciError::TarImport("no manifest.json in tar".to_string()))?;
            let mut all: Vec<SaveManifest> = serde_json::from_slice(&raw)?;
            if all.is_empty() {
                return Err(OciError::TarImport("empty manifest.json".to_string()));
            }
            all.remove(0)
        };

        // Pass 2: the image config blob.
        let mut config = {
            let raw = read_tar_entry(tar_path, &save.config)?.ok_or_else(|| {
                OciError::TarImport(format!("config {} missing from tar", save.config))
            })?;
            extract_image_config(&serde_json::from_slice(&raw)?)
        };

        // Pass 3: the layers, converted in manifest order.
        let mut layer_digests = Vec::with_capacity(save.layers.len());
        for layer_path in &save.layers {
            let digest = self.import_layer(tar_path, layer_path, &save, &image_dir)?;
            layer_digests.push(digest);
        }

        config.layers = layer_digests;
        if config.architecture.is_empty() {
            config.architecture = oci_arch(arch).to_string();
        }
        write_config(&image_dir, &config)?;
        Ok(LoadedImage {
            dir: image_dir,
            config,
        })
    }

    fn import_layer(
        &self,
        tar_path: &Path,
        layer_path: &str,
        save: &SaveManifest,
        image_dir: &Path,
    ) -> Result<String> {
        // OCI-layout saves carry the digest in the path and the media
        // type in LayerSources; the legacy format reveals neither, so the
        // digest is computed while streaming and gzip is sniffed.
        let known_digest = layer_path
            .strip_prefix("blobs/sha256/")
            .map(str::to_string);
        let gz = known_digest
            .as_ref()
            .and_then(|hex| save.layer_sources.get(&format!("sha256:{}", hex)))
            .map(|src| src.media_type.contains("gzip"));

        let file = std::fs::File::open(tar_path)?;
        let mut tar = tar::Archive::new(std::io::BufReader::new(file));
        for entry in tar.entries()? {
            let entry = entry?;
            if entry.path()?.to_string_lossy() != *layer_path {
                continue;
            }
            let tmp_base = image_dir.join(".importing");
            let mut hasher = HashingReader::new(entry);
            convert_tar_to_archive(&mut hasher, gz, &tmp_base)?;
            let digest = known_digest.clone().unwrap_or_else(|| hex::encode(hasher.finish()));

            let final_base = image_dir.join(&digest);
            std::fs::rename(
                cc_archive::index_path(&tmp_base),
                cc_archive::index_path(&final_base),
            )?;
            std::fs::rename(
                cc_archive::contents_path(&tmp_base),
                cc_archive::contents_path(&final_base),
            )?;
            return Ok(digest);
        }
        Err(OciError::TarImport(format!("layer {} missing from tar", layer_path)))
    }
}

/// One record of a `docker save` manifest.json.
#[derive(Debug, Deserialize)]
struct SaveManifest {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
    #[serde(default, rename = "LayerSources")]
    layer_sources: BTreeMap<String, LayerSource>,
}

#[derive(Debug, Deserialize)]
struct LayerSource {
    #[serde(rename = "mediaType")]
    media_type: String,
}

struct ResolvedManifest {
    layers: Vec<LayerDescriptor>,
    config_digest: Option<String>,
    /// v1 manifests embed the config instead of referencing a blob.
    inline_config: Option<ImageConfig>,
}

struct LayerDescriptor {
    digest: String,
    media_type: Option<String>,
}

fn is_index(manifest: &serde_json::Value, media_type: &str) -> bool {
    media_type.contains("manifest.list") || media_type.contains("image.index") || {
        manifest.get("manifests").is_some() && manifest.get("layers").is_none()
    }
}

/// Pull the layer list and config pointer out of a single manifest,
/// handling both schema 2 and the legacy schema 1 shape.
fn parse_manifest(manifest: &serde_json::Value) -> Result<ResolvedManifest> {
    if let Some(layers) = manifest.get("layers").and_then(|l| l.as_array()) {
        let layers = layers
            .iter()
            .map(|l| {
                let digest = l
                    .get("digest")
                    .and_then(|d| d.as_str())
                    .ok_or_else(|| OciError::Manifest("layer without digest".to_string()))?;
                Ok(LayerDescriptor {
                    digest: digest.to_string(),
                    media_type: l
                        .get("mediaType")
                        .and_then(|m| m.as_str())
                        .map(str::to_string),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let config_digest = manifest
            .get("config")
            .and_then(|c| c.get("digest"))
            .and_then(|d| d.as_str())
            .map(str::to_string);
        return Ok(ResolvedManifest {
            layers,
            config_digest,
            inline_config: None,
        });
    }

    // Schema 1: fsLayers are listed newest-first and always gzipped.
    if let Some(fs_layers) = manifest.get("fsLayers").and_then(|l| l.as_array()) {
        let mut layers = fs_layers
            .iter()
            .map(|l| {
                let digest = l
                    .get("blobSum")
                    .and_then(|d| d.as_str())
                    .ok_or_else(|| OciError::Manifest("fsLayer without blobSum".to_string()))?;
                Ok(LayerDescriptor {
                    digest: digest.to_string(),
                    media_type: Some("application/vnd.docker.image.rootfs.diff.tar.gzip".into()),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        layers.reverse();

        let inline_config = manifest
            .get("history")
            .and_then(|h| h.as_array())
            .and_then(|h| h.first())
            .and_then(|e| e.get("v1Compatibility"))
            .and_then(|c| c.as_str())
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .map(|blob| extract_image_config(&blob));
        return Ok(ResolvedManifest {
            layers,
            config_digest: None,
            inline_config,
        });
    }

    Err(OciError::Manifest("manifest without layers".to_string()))
}

/// Image config blob (the `config.digest` target), docker field casing.
#[derive(Debug, Default, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    config: Option<ConfigSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigSection {
    #[serde(default, rename = "Env")]
    env: Option<Vec<String>>,
    #[serde(default, rename = "Cmd")]
    cmd: Option<StringOrVec>,
    #[serde(default, rename = "Entrypoint")]
    entrypoint: Option<StringOrVec>,
    #[serde(default, rename = "WorkingDir")]
    working_dir: Option<String>,
    #[serde(default, rename = "User")]
    user: Option<String>,
    #[serde(default, rename = "Labels")]
    labels: Option<BTreeMap<String, String>>,
}

/// Docker accepts both a bare string and an argv array here.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_argv(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s],
            StringOrVec::Many(v) => v,
        }
    }
}

/// Flatten a config blob into our `config.json` shape (minus layers).
fn extract_image_config(blob: &serde_json::Value) -> ImageConfig {
    let parsed: ConfigBlob = serde_json::from_value(blob.clone()).unwrap_or_default();
    let section = parsed.config.unwrap_or_default();
    let user = section.user.unwrap_or_default();
    let (uid, gid) = parse_user(&user);
    ImageConfig {
        layers: Vec::new(),
        env: section.env.unwrap_or_default(),
        entrypoint: section.entrypoint.map(StringOrVec::into_argv).unwrap_or_default(),
        cmd: section.cmd.map(StringOrVec::into_argv).unwrap_or_default(),
        working_dir: section.working_dir.unwrap_or_default(),
        user,
        uid,
        gid,
        labels: section.labels.unwrap_or_default(),
        architecture: parsed.architecture.unwrap_or_default(),
    }
}

/// `uid[:gid]` when numeric; anything else resolves inside the guest.
fn parse_user(user: &str) -> (Option<u32>, Option<u32>) {
    if user.is_empty() {
        return (None, None);
    }
    let (uid_s, gid_s) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };
    let uid = uid_s.parse().ok();
    let gid = gid_s.and_then(|g| g.parse().ok());
    match uid {
        Some(uid) => (Some(uid), gid),
        None => (None, None),
    }
}

fn strip_algorithm(digest: &str) -> String {
    digest.split_once(':').map(|(_, hex)| hex.to_string()).unwrap_or_else(|| digest.to_string())
}

fn write_config(dir: &Path, config: &ImageConfig) -> Result<()> {
    let raw = serde_json::to_vec_pretty(config)?;
    std::fs::write(dir.join("config.json"), raw)?;
    Ok(())
}

/// Scan a tar file for one entry and return its bytes.
fn read_tar_entry(tar_path: &Path, wanted: &str) -> Result<Option<Vec<u8>>> {
    let file = std::fs::File::open(tar_path)?;
    let mut tar = tar::Archive::new(std::io::BufReader::new(file));
    for entry in tar.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == wanted {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}

/// Hashes everything read through it.
struct HashingReader<R: Read> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        HashingReader {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_field_parses_optional_gid() {
        assert_eq!(parse_user(""), (None, None));
        assert_eq!(parse_user("1000"), (Some(1000), None));
        assert_eq!(parse_user("1000:100"), (Some(1000), Some(100)));
        assert_eq!(parse_user("www-data"), (None, None));
    }

    #[test]
    fn config_blob_extracts_string_or_array() {
        let blob = serde_json::json!({
            "architecture": "amd64",
            "config": {
                "Env": ["PATH=/usr/bin"],
                "Cmd": ["nginx", "-g", "daemon off;"],
                "Entrypoint": "start.sh",
                "WorkingDir": "/srv",
                "User": "33:33",
                "Labels": {"org.label": "v"}
            }
        });
        let config = extract_image_config(&blob);
        assert_eq!(config.env, vec!["PATH=/usr/bin"]);
        assert_eq!(config.cmd, vec!["nginx", "-g", "daemon off;"]);
        assert_eq!(config.entrypoint, vec!["/bin/sh", "-c", "start.sh"]);
        assert_eq!(config.working_dir, "/srv");
        assert_eq!((config.uid, config.gid), (Some(33), Some(33)));
        assert_eq!(config.architecture, "amd64");
        assert_eq!(config.labels["org.label"], "v");
    }

    #[test]
    fn schema2_manifest_parses_layers_in_order() {
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {"digest": "sha256:cfg"},
            "layers": [
                {"digest": "sha256:aaa", "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip"},
                {"digest": "sha256:bbb", "mediaType": "application/vnd.oci.image.layer.v1.tar"}
            ]
        });
        let resolved = parse_manifest(&manifest).unwrap();
        assert_eq!(resolved.config_digest.as_deref(), Some("sha256:cfg"));
        assert_eq!(resolved.layers.len(), 2);
        assert_eq!(resolved.layers[0].digest, "sha256:aaa");
        assert!(resolved.layers[0].media_type.as_ref().unwrap().contains("gzip"));
    }

    #[test]
    fn schema1_layers_reverse_to_application_order() {
        let manifest = serde_json::json!({
            "schemaVersion": 1,
            "fsLayers": [
                {"blobSum": "sha256:top"},
                {"blobSum": "sha256:bottom"}
            ],
            "history": [
                {"v1Compatibility": "{\"config\":{\"Cmd\":[\"sh\"]}}"}
            ]
        });
        let resolved = parse_manifest(&manifest).unwrap();
        assert_eq!(resolved.layers[0].digest, "sha256:bottom");
        assert_eq!(resolved.layers[1].digest, "sha256:top");
        assert_eq!(resolved.inline_config.unwrap().cmd, vec!["sh"]);
    }

    #[test]
    fn index_detection() {
        let index = serde_json::json!({"manifests": []});
        assert!(is_index(&index, ""));
        assert!(is_index(
            &serde_json::json!({}),
            "application/vnd.docker.distribution.manifest.list.v2+json"
        ));
        let single = serde_json::json!({"layers": []});
        assert!(!is_index(&single, "application/vnd.oci.image.manifest.v1+json"));
    }
}
