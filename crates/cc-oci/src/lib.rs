// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! OCI image store.
//!
//! Turns a registry reference, a `docker save` tar or a pre-baked image
//! directory into a cached set of content-addressed archive layers plus a
//! `config.json`, ready to stack into a container filesystem.

mod convert;
mod image;
mod progress;
mod reference;
mod registry;

pub use convert::{ConvertStats, convert_tar_to_archive};
pub use image::{ImageConfig, ImageStore, LoadedImage};
pub use progress::{DownloadProgress, ProgressFn, SpeedTracker};
pub use reference::{ImageReference, sanitize};
pub use registry::RegistryClient;

/// OCI store error type
#[derive(thiserror::Error, Debug)]
pub enum OciError {
    #[error("bad image reference {reference:?}: {reason}")]
    BadReference { reference: String, reason: String },
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry auth failed for {registry}: {reason}")]
    Auth { registry: String, reason: String },
    #[error("no manifest for architecture {arch} in image index")]
    NoManifestForArch { arch: String },
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("malformed manifest: {0}")]
    Manifest(String),
    #[error("blob {digest} hash mismatch: got sha256:{actual}")]
    DigestMismatch { digest: String, actual: String },
    #[error("tar import: {0}")]
    TarImport(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("archive error: {0}")]
    Archive(#[from] cc_archive::ArchiveError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OciError>;

/// Map a hypervisor CPU architecture tag to the OCI platform name.
pub fn oci_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}
