/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 */

//! Plain HTTP(S) mirror with optional basic authentication.

use base64::Engine;

use super::{join_url, EndpointOps};
use crate::error::DownloadResult;
use crate::target::DownloadTarget;

/// The default mirror kind: paths are joined onto the mirror URL.
#[derive(Debug, Default, Clone)]
pub struct HttpMirror {
    auth_user: Option<String>,
    auth_password: Option<String>,
}

impl HttpMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            auth_user: Some(user.into()),
            auth_password: Some(password.into()),
        }
    }

    pub fn set_auth(&mut self, user: impl Into<String>, password: impl Into<String>) {
        self.auth_user = Some(user.into());
        self.auth_password = Some(password.into());
    }
}

impl EndpointOps for HttpMirror {
    fn format_url(&self, base: &str, target: &DownloadTarget) -> DownloadResult<String> {
        Ok(join_url(base, &target.path))
    }

    fn auth_headers(&self, _base: &str, _path: &str) -> DownloadResult<Vec<(String, String)>> {
        match (&self.auth_user, &self.auth_password) {
            (Some(user), Some(password)) => {
                let token =
                    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
                Ok(vec![("Authorization".to_string(), format!("Basic {token}"))])
            }
            _ => Ok(Vec::new()),
        }
    }

    fn credentials(&self) -> Option<(String, String)> {
        match (&self.auth_user, &self.auth_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::Mirror;

    #[test]
    fn test_format_url_joins_path() {
        let m = Mirror::http("https://conda.anaconda.org/conda-forge/");
        let t = DownloadTarget::new("linux-64/pkg.tar.bz2", "", "pkg.tar.bz2");
        assert_eq!(
            m.format_url(&t).unwrap(),
            "https://conda.anaconda.org/conda-forge/linux-64/pkg.tar.bz2"
        );
    }

    #[test]
    fn test_no_auth_headers_by_default() {
        let m = Mirror::http("https://a");
        assert!(m.auth_headers("x").unwrap().is_empty());
        assert!(m.credentials().is_none());
    }

    #[test]
    fn test_basic_auth_header() {
        let m = Mirror::http_with_auth("https://a", "user", "secret");
        let headers = m.auth_headers("x").unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "Authorization");
        // "user:secret" in base64
        assert_eq!(headers[0].1, "Basic dXNlcjpzZWNyZXQ=");
    }
}
