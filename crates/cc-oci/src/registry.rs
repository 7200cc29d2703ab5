// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Registry v2 HTTP client: manifest negotiation, Bearer token auth and
//! streamed blob downloads. Proxy environment variables are honored by
//! the underlying client.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::progress::{DownloadProgress, ProgressFn, SpeedTracker};
use crate::reference::ImageReference;
use crate::{OciError, Result};

/// Manifest media types we accept, in preference order.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v1+json",
];

const MAX_AUTH_ATTEMPTS: usize = 3;

pub struct RegistryClient {
    http: reqwest::Client,
    /// Bearer tokens keyed by registry base.
    tokens: Mutex<HashMap<String, String>>,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    pub fn new() -> Self {
        RegistryClient {
            http: reqwest::Client::new(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// GET with cached Bearer token, re-authenticating on 401 up to
    /// [`MAX_AUTH_ATTEMPTS`] times.
    async fn get(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
    ) -> Result<reqwest::Response> {
        for attempt in 0..MAX_AUTH_ATTEMPTS {
            let mut request = self.http.get(url);
            if let Some(accept) = accept {
                request = request.header(reqwest::header::ACCEPT, accept);
            }
            if let Some(token) = self.cached_token(&reference.registry_base) {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            if response.status() != reqwest::StatusCode::UNAUTHORIZED {
                return Ok(response.error_for_status()?);
            }

            debug!(url, attempt, "registry returned 401, negotiating token");
            let challenge = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| OciError::Auth {
                    registry: reference.registry_base.clone(),
                    reason: "401 without WWW-Authenticate".to_string(),
                })?;
            self.fetch_token(reference, &challenge).await?;
        }
        Err(OciError::Auth {
            registry: reference.registry_base.clone(),
            reason: format!("still unauthorized after {} attempts", MAX_AUTH_ATTEMPTS),
        })
    }

    fn cached_token(&self, registry: &str) -> Option<String> {
        self.tokens.lock().unwrap().get(registry).cloned()
    }

    async fn fetch_token(&self, reference: &ImageReference, challenge: &str) -> Result<()> {
        let params = parse_bearer_challenge(challenge).ok_or_else(|| OciError::Auth {
            registry: reference.registry_base.clone(),
            reason: format!("unparseable challenge: {}", challenge),
        })?;
        let realm = params.get("realm").ok_or_else(|| OciError::Auth {
            registry: reference.registry_base.clone(),
            reason: "challenge without realm".to_string(),
        })?;

        let mut request = self.http.get(realm);
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service)]);
        }
        if let Some(scope) = params.get("scope") {
            request = request.query(&[("scope", scope)]);
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }
        let response: TokenResponse =
            request.send().await?.error_for_status()?.json().await?;
        let token = response.token.or(response.access_token).ok_or_else(|| OciError::Auth {
            registry: reference.registry_base.clone(),
            reason: "token endpoint returned no token".to_string(),
        })?;

        debug!(registry = %reference.registry_base, "cached registry token");
        self.tokens.lock().unwrap().insert(reference.registry_base.clone(), token);
        Ok(())
    }

    /// Fetch the tag's manifest; returns the body and its content type.
    pub async fn fetch_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<(serde_json::Value, String)> {
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");
        let response =
            self.get(reference, &reference.manifest_url(), Some(&accept)).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .to_string();
        let body: serde_json::Value = response.json().await?;
        Ok((body, content_type))
    }

    /// Fetch a manifest by digest (index → child descent).
    pub async fn fetch_manifest_digest(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<serde_json::Value> {
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");
        let url = format!(
            "{}/{}/manifests/{}",
            reference.registry_base, reference.repository, digest
        );
        let response = self.get(reference, &url, Some(&accept)).await?;
        Ok(response.json().await?)
    }

    /// Stream a blob into `dest`, reporting progress as it downloads.
    pub async fn fetch_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        dest: &Path,
        blob_index: i32,
        blob_count: i32,
        progress: Option<&ProgressFn>,
    ) -> Result<u64> {
        let response = self.get(reference, &reference.blob_url(digest), None).await?;
        let total = response
            .content_length()
            .map(|l| l as i64)
            .unwrap_or(-1);

        let tmp = dest.with_extension("partial");
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = response.bytes_stream();
        let mut current: i64 = 0;
        let mut speed = SpeedTracker::new();
        let mut hasher = Sha256::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            current += chunk.len() as i64;
            if let Some(progress) = progress {
                if let Some(rate) = speed.update(current) {
                    progress(&DownloadProgress {
                        current,
                        total,
                        blob_index,
                        blob_count,
                        bytes_per_second: rate,
                        eta_seconds: speed.eta(current, total),
                    });
                }
            }
        }
        file.flush().await?;
        drop(file);

        // Registries address blobs by content; verify before committing.
        if let Some(expected) = digest.strip_prefix("sha256:") {
            let actual = hex::encode(hasher.finalize());
            if actual != expected {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(OciError::DigestMismatch {
                    digest: digest.to_string(),
                    actual,
                });
            }
        }
        tokio::fs::rename(&tmp, dest).await?;

        if let Some(progress) = progress {
            progress(&DownloadProgress {
                current,
                total: current.max(total),
                blob_index,
                blob_count,
                bytes_per_second: speed.rate(),
                eta_seconds: 0.0,
            });
        }
        info!(digest, bytes = current, "fetched blob");
        Ok(current as u64)
    }
}

/// Parse `Bearer realm="…",service="…",scope="…"`.
fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut params = HashMap::new();
    for piece in split_challenge(rest) {
        let (key, value) = piece.split_once('=')?;
        let value = value.trim().trim_matches('"');
        params.insert(key.trim().to_string(), value.to_string());
    }
    if params.is_empty() {
        warn!(header, "empty bearer challenge");
        return None;
    }
    Some(params)
}

/// Split on commas that are not inside quoted values.
fn split_challenge(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth_quote = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => depth_quote = !depth_quote,
            ',' if !depth_quote => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}
