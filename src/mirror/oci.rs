/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 */

//! OCI registry mirror.
//!
//! Blobs are addressed by digest: when the caller does not provide a SHA-256
//! checksum, a preparation round-trip fetches the manifest and learns the
//! digest of the first layer. Authenticated registries additionally need a
//! token exchange before the manifest fetch.

use std::collections::HashMap;
use std::sync::Arc;

use super::{EndpointOps, PreparationRequest};
use crate::checksum::ChecksumKind;
use crate::error::{DownloadError, DownloadResult, ErrorCode};
use crate::target::{DownloadTarget, TransferResponse};

/// Splits a logical path into `(name, tag)` for manifest lookup.
pub type SplitPathTag = Arc<dyn Fn(&str) -> (String, String) + Send + Sync>;

#[derive(Debug, Default, Clone)]
struct OciPathState {
    token: Option<String>,
    sha256sum: Option<String>,
    layer_size: Option<u64>,
}

/// Mirror kind for OCI-registry blob endpoints.
#[derive(Clone)]
pub struct OciMirror {
    repo_prefix: String,
    scope: String,
    username: Option<String>,
    password: Option<String>,
    split_path_tag: Option<SplitPathTag>,
    path_states: HashMap<String, OciPathState>,
}

impl std::fmt::Debug for OciMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciMirror")
            .field("repo_prefix", &self.repo_prefix)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl OciMirror {
    pub fn new(repo_prefix: impl Into<String>) -> Self {
        Self {
            repo_prefix: repo_prefix.into(),
            scope: "pull".to_string(),
            username: None,
            password: None,
            split_path_tag: None,
            path_states: HashMap::new(),
        }
    }

    pub fn with_auth(
        repo_prefix: impl Into<String>,
        scope: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            repo_prefix: repo_prefix.into(),
            scope: scope.into(),
            username: Some(username.into()),
            password: Some(password.into()),
            split_path_tag: None,
            path_states: HashMap::new(),
        }
    }

    /// Override how a logical path is split into `(name, tag)`.
    pub fn set_split_path_tag(&mut self, f: SplitPathTag) {
        self.split_path_tag = Some(f);
    }

    fn split(&self, path: &str) -> (String, String) {
        match &self.split_path_tag {
            Some(f) => f(path),
            None => (path.to_string(), "latest".to_string()),
        }
    }

    fn repo(&self, name: &str) -> String {
        if self.repo_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.repo_prefix, name)
        }
    }

    fn need_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    fn auth_url(&self, base: &str, name: &str) -> String {
        format!(
            "{base}/token?scope=repository:{}:{}",
            self.repo(name),
            self.scope
        )
    }

    fn manifest_url(&self, base: &str, name: &str, reference: &str) -> String {
        format!("{base}/v2/{}/manifests/{reference}", self.repo(name))
    }

    fn state(&self, path: &str) -> Option<&OciPathState> {
        let (name, _) = self.split(path);
        self.path_states.get(&name)
    }

    fn awaiting_token(&self, path: &str) -> bool {
        self.need_auth() && self.state(path).map_or(true, |s| s.token.is_none())
    }
}

impl EndpointOps for OciMirror {
    fn needs_preparation(&self, target: &DownloadTarget) -> bool {
        if self.awaiting_token(&target.path) {
            return true;
        }
        if self
            .state(&target.path)
            .is_some_and(|s| s.sha256sum.is_some())
        {
            return false;
        }
        // A caller-provided digest removes the need for a manifest fetch.
        !target
            .checksums
            .iter()
            .any(|c| c.kind == ChecksumKind::Sha256)
    }

    fn preparation_request(
        &self,
        base: &str,
        path: &str,
    ) -> DownloadResult<Option<PreparationRequest>> {
        let (name, tag) = self.split(path);

        if self.awaiting_token(path) {
            let basic_auth = match (&self.username, &self.password) {
                (Some(user), Some(password)) => Some((user.clone(), password.clone())),
                _ => None,
            };
            return Ok(Some(PreparationRequest {
                url: self.auth_url(base, &name),
                headers: Vec::new(),
                basic_auth,
            }));
        }

        let mut headers = vec![(
            "Accept".to_string(),
            "application/vnd.oci.image.manifest.v1+json".to_string(),
        )];
        headers.extend(self.auth_headers(base, path)?);
        Ok(Some(PreparationRequest {
            url: self.manifest_url(base, &name, &tag),
            headers,
            basic_auth: None,
        }))
    }

    fn apply_preparation(&mut self, path: &str, response: &TransferResponse) -> DownloadResult<()> {
        if !response.ok() {
            return Err(DownloadError::serious(
                ErrorCode::BadStatus,
                format!(
                    "registry handshake failed with status {:?} for {path}",
                    response.status
                ),
            ));
        }

        let (name, _) = self.split(path);
        let json = response.json()?;
        let state = self.path_states.entry(name).or_default();

        if self.username.is_some() && self.password.is_some() && state.token.is_none() {
            let token = json
                .get("token")
                .and_then(|t| t.as_str())
                .ok_or_else(|| {
                    DownloadError::serious(
                        ErrorCode::Transport,
                        "token response did not contain a token",
                    )
                })?;
            state.token = Some(token.to_string());
            return Ok(());
        }

        let layer = json
            .get("layers")
            .and_then(|l| l.get(0))
            .ok_or_else(|| {
                DownloadError::serious(ErrorCode::Transport, "manifest did not contain layers")
            })?;
        let digest = layer
            .get("digest")
            .and_then(|d| d.as_str())
            .ok_or_else(|| {
                DownloadError::serious(ErrorCode::Transport, "manifest layer has no digest")
            })?;
        let Some(hex) = digest.strip_prefix("sha256:") else {
            return Err(DownloadError::serious(
                ErrorCode::UnknownChecksum,
                format!("unexpected layer digest kind: {digest}"),
            ));
        };
        state.sha256sum = Some(hex.to_string());
        state.layer_size = layer.get("size").and_then(|s| s.as_u64());
        Ok(())
    }

    fn auth_headers(&self, _base: &str, path: &str) -> DownloadResult<Vec<(String, String)>> {
        if !self.need_auth() {
            return Ok(Vec::new());
        }
        let token = self
            .state(path)
            .and_then(|s| s.token.clone())
            .ok_or_else(|| {
                DownloadError::serious(
                    ErrorCode::Mirrors,
                    format!("no registry token available for {path}"),
                )
            })?;
        Ok(vec![("Authorization".to_string(), format!("Bearer {token}"))])
    }

    fn format_url(&self, base: &str, target: &DownloadTarget) -> DownloadResult<String> {
        let (name, _) = self.split(&target.path);

        let digest = target
            .checksums
            .iter()
            .find(|c| c.kind == ChecksumKind::Sha256)
            .map(|c| c.hex.clone())
            .or_else(|| self.state(&target.path).and_then(|s| s.sha256sum.clone()))
            .ok_or_else(|| {
                DownloadError::serious(
                    ErrorCode::NoUrl,
                    format!("no blob digest known for {}", target.path),
                )
            })?;

        Ok(format!(
            "{base}/v2/{}/blobs/sha256:{digest}",
            self.repo(&name)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::Mirror;

    fn response_with(body: &str) -> TransferResponse {
        TransferResponse {
            status: Some(200),
            body: Some(body.as_bytes().to_vec()),
            ..TransferResponse::default()
        }
    }

    #[test]
    fn test_blob_url_from_known_checksum() {
        let m = Mirror::oci("https://ghcr.io", OciMirror::new("channel"));
        let t = DownloadTarget::new("artifact", "", "artifact")
            .with_checksum(ChecksumKind::Sha256, "c5be3e".repeat(10) + "abcd");
        let url = m.format_url(&t).unwrap();
        assert!(url.starts_with("https://ghcr.io/v2/channel/artifact/blobs/sha256:c5be3e"));
        // digest known up front: nothing to prepare on an anonymous registry
        assert!(!m.needs_preparation(&t));
    }

    #[test]
    fn test_anonymous_without_checksum_needs_manifest() {
        let m = Mirror::oci("https://ghcr.io", OciMirror::new(""));
        let t = DownloadTarget::new("artifact", "", "artifact");
        assert!(m.needs_preparation(&t));

        let prep = m.preparation_request(&t.path).unwrap().unwrap();
        assert_eq!(prep.url, "https://ghcr.io/v2/artifact/manifests/latest");
        assert!(prep
            .headers
            .iter()
            .any(|(k, v)| k == "Accept" && v == "application/vnd.oci.image.manifest.v1+json"));
        assert!(prep.basic_auth.is_none());
    }

    #[test]
    fn test_token_then_manifest_handshake() {
        let oci = OciMirror::with_auth("", "pull", "user", "secret");
        let mut m = Mirror::oci("https://registry.example.com", oci);
        let t = DownloadTarget::new("artifact", "", "artifact");

        // Step 1: token exchange with basic auth.
        assert!(m.needs_preparation(&t));
        let prep = m.preparation_request(&t.path).unwrap().unwrap();
        assert_eq!(
            prep.url,
            "https://registry.example.com/token?scope=repository:artifact:pull"
        );
        assert_eq!(prep.basic_auth, Some(("user".into(), "secret".into())));

        m.apply_preparation(&t.path, &response_with(r#"{"token": "tok-123"}"#))
            .unwrap();

        // Step 2: manifest fetch with the bearer token.
        assert!(m.needs_preparation(&t));
        let prep = m.preparation_request(&t.path).unwrap().unwrap();
        assert_eq!(
            prep.url,
            "https://registry.example.com/v2/artifact/manifests/latest"
        );
        assert!(prep
            .headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer tok-123"));

        let manifest = r#"{
            "schemaVersion": 2,
            "layers": [
                {"mediaType": "application/vnd.unknown.layer.v1+txt",
                 "digest": "sha256:c5be3ea75353851e1fcf3a298af3b6cfd2af3d7ff018ce52657b6dbd8f986aa4",
                 "size": 13}
            ]
        }"#;
        m.apply_preparation(&t.path, &response_with(manifest)).unwrap();

        // Main fetch: blob by digest with the bearer header.
        assert!(!m.needs_preparation(&t));
        assert_eq!(
            m.format_url(&t).unwrap(),
            "https://registry.example.com/v2/artifact/blobs/sha256:c5be3ea75353851e1fcf3a298af3b6cfd2af3d7ff018ce52657b6dbd8f986aa4"
        );
        let headers = m.auth_headers(&t.path).unwrap();
        assert!(headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer tok-123"));
    }

    #[test]
    fn test_manifest_with_foreign_digest_rejected() {
        let mut m = Mirror::oci("https://r", OciMirror::new(""));
        let t = DownloadTarget::new("artifact", "", "artifact");
        let manifest = r#"{"layers": [{"digest": "sha512:ffff", "size": 1}]}"#;
        let err = m
            .apply_preparation(&t.path, &response_with(manifest))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownChecksum);
    }

    #[test]
    fn test_failed_handshake_status() {
        let mut m = Mirror::oci("https://r", OciMirror::new(""));
        let response = TransferResponse {
            status: Some(401),
            body: Some(b"{}".to_vec()),
            ..TransferResponse::default()
        };
        assert!(m.apply_preparation("artifact", &response).is_err());
    }

    #[test]
    fn test_custom_path_tag_split() {
        let mut oci = OciMirror::new("");
        oci.set_split_path_tag(Arc::new(|path: &str| {
            match path.rsplit_once(':') {
                Some((name, tag)) => (name.to_string(), tag.to_string()),
                None => (path.to_string(), "latest".to_string()),
            }
        }));
        let m = Mirror::oci("https://r", oci);
        let t = DownloadTarget::new("artifact:1.2", "", "artifact");
        let prep = m.preparation_request(&t.path).unwrap().unwrap();
        assert_eq!(prep.url, "https://r/v2/artifact/manifests/1.2");
    }
}
