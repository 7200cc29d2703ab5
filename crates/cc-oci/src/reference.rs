// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Image reference parsing: `[registry/]name[:tag]`.

/// Docker Hub v2 endpoint used for unqualified references.
pub const DOCKER_HUB_BASE: &str = "https://registry-1.docker.io/v2";

/// A parsed reference plus the registry base URL requests go to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    /// The reference as given.
    pub raw: String,
    /// Fully qualified `https://…/v2` endpoint.
    pub registry_base: String,
    /// Repository path inside the registry (`library/alpine`).
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Parse a reference.
    ///
    /// The tag splits on the last `:` (ignored when the remainder holds a
    /// `/`, which means the colon belonged to a registry port). A leading
    /// segment containing a `.` before any `/` names the registry;
    /// otherwise the reference is a Docker Hub repository, with `library/`
    /// prepended for bare images.
    pub fn parse(reference: &str) -> crate::Result<ImageReference> {
        if reference.is_empty() {
            return Err(crate::OciError::BadReference {
                reference: reference.to_string(),
                reason: "empty reference".to_string(),
            });
        }

        let (pre_tag, tag) = match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag.to_string()),
            _ => (reference, "latest".to_string()),
        };
        if pre_tag.is_empty() {
            return Err(crate::OciError::BadReference {
                reference: reference.to_string(),
                reason: "missing image name".to_string(),
            });
        }

        // A scheme-qualified reference names its registry outright.
        let (registry, repository) = if let Some((scheme, rest)) = pre_tag.split_once("://") {
            match rest.split_once('/') {
                Some((host, repo)) => match repo.strip_prefix("v2/") {
                    Some(stripped) => {
                        (format!("{}://{}/v2", scheme, host), stripped.to_string())
                    }
                    None => (format!("{}://{}", scheme, host), repo.to_string()),
                },
                None => {
                    return Err(crate::OciError::BadReference {
                        reference: reference.to_string(),
                        reason: "registry without repository".to_string(),
                    });
                }
            }
        } else {
            let first_segment = pre_tag.split('/').next().unwrap_or_default();
            if first_segment.contains('.') && pre_tag.contains('/') {
                let (registry, rest) = pre_tag.split_once('/').unwrap();
                (registry.to_string(), rest.to_string())
            } else {
                (String::new(), pre_tag.to_string())
            }
        };

        let (registry_base, repository) = match registry.as_str() {
            "" | "docker.io" => {
                let repository = if repository.contains('/') {
                    repository
                } else {
                    format!("library/{}", repository)
                };
                (DOCKER_HUB_BASE.to_string(), repository)
            }
            other => {
                let mut base = if other.contains("://") {
                    other.to_string()
                } else {
                    format!("https://{}", other)
                };
                if !base.ends_with("/v2") {
                    base.push_str("/v2");
                }
                (base, repository)
            }
        };

        Ok(ImageReference {
            raw: reference.to_string(),
            registry_base,
            repository,
            tag,
        })
    }

    /// URL of this reference's tag manifest.
    pub fn manifest_url(&self) -> String {
        format!("{}/{}/manifests/{}", self.registry_base, self.repository, self.tag)
    }

    pub fn blob_url(&self, digest: &str) -> String {
        format!("{}/{}/blobs/{}", self.registry_base, self.repository, digest)
    }
}

/// Filesystem-safe rendering of references and digests for cache paths.
pub fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_hub_image_gets_library_prefix() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry_base, DOCKER_HUB_BASE);
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn tag_splits_on_last_colon() {
        let r = ImageReference::parse("alpine:3.20").unwrap();
        assert_eq!(r.tag, "3.20");
        assert_eq!(r.repository, "library/alpine");
    }

    #[test]
    fn scoped_hub_image_keeps_namespace() {
        let r = ImageReference::parse("library/ubuntu:24.04").unwrap();
        assert_eq!(r.registry_base, DOCKER_HUB_BASE);
        assert_eq!(r.repository, "library/ubuntu");
    }

    #[test]
    fn dotted_prefix_is_a_registry() {
        let r = ImageReference::parse("ghcr.io/org/tool:v1").unwrap();
        assert_eq!(r.registry_base, "https://ghcr.io/v2");
        assert_eq!(r.repository, "org/tool");
        assert_eq!(r.tag, "v1");
    }

    #[test]
    fn explicit_docker_io_is_hub() {
        let r = ImageReference::parse("docker.io/alpine").unwrap();
        assert_eq!(r.registry_base, DOCKER_HUB_BASE);
        assert_eq!(r.repository, "library/alpine");
    }

    #[test]
    fn scheme_and_v2_preserved_when_present() {
        let r = ImageReference::parse("http://registry.local/v2/team/app:dev").unwrap();
        assert_eq!(r.tag, "dev");
        assert_eq!(r.registry_base, "http://registry.local/v2");
        assert_eq!(r.repository, "team/app");
    }

    #[test]
    fn registry_port_does_not_become_a_tag() {
        let r = ImageReference::parse("registry.example.com:5000/app").unwrap();
        assert_eq!(r.tag, "latest");
        assert_eq!(r.registry_base, "https://registry.example.com:5000/v2");
        assert_eq!(r.repository, "app");
    }

    #[test]
    fn manifest_and_blob_urls() {
        let r = ImageReference::parse("alpine:3.20").unwrap();
        assert_eq!(
            r.manifest_url(),
            "https://registry-1.docker.io/v2/library/alpine/manifests/3.20"
        );
        assert_eq!(
            r.blob_url("sha256:abc"),
            "https://registry-1.docker.io/v2/library/alpine/blobs/sha256:abc"
        );
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize("ghcr.io/org/tool:v1"), "ghcr.io_org_tool_v1");
        assert_eq!(sanitize("sha256:ab12"), "sha256_ab12");
    }
}
