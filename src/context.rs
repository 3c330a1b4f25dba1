/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Process-wide downloader configuration.
//!
//! A [`Context`] is an immutable snapshot of every knob the scheduler and
//! transfers read. At most one live `Context` may exist per process;
//! constructing a second one fails.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{DownloadError, DownloadResult, ErrorCode};
use crate::mirror::Mirror;

static CONTEXT_ALIVE: AtomicBool = AtomicBool::new(false);

/// Scalar configuration options, loadable from TOML and environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Fail targets whose resolved URL is not local.
    pub offline: bool,

    /// Log verbosity (0 = warn, 1 = info, 2 = debug, 3+ = trace).
    pub verbosity: u8,

    /// Re-order mirror lists based on observed success rates.
    pub adaptive_mirror_sorting: bool,

    /// Skip TLS certificate verification.
    pub disable_ssl_verification: bool,

    /// Extra CA bundle (PEM) trusted in addition to the system store.
    pub ssl_ca_info: Option<PathBuf>,

    /// Verify file hashes when a transfer finishes.
    pub validate_checksum: bool,

    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// A transfer stalling longer than this many seconds is a timeout.
    pub low_speed_time_secs: u64,

    /// Minimum transfer speed in bytes/second backing the stall window.
    pub low_speed_limit: u64,

    /// Per-transfer download speed cap in bytes/second (-1 = off).
    pub max_speed_limit: i64,

    /// Global concurrency cap.
    pub max_parallel_downloads: usize,

    /// Per-mirror concurrency cap (-1 = off).
    pub max_downloads_per_mirror: i64,

    /// Transfer read buffer size in bytes.
    pub transfer_buffersize: usize,

    /// Apply the server-provided `Last-Modified` to the final file.
    pub preserve_filetime: bool,

    /// Use EPSV for FTP transfers.
    pub ftp_use_epsv: bool,

    /// Base directory scanned for zchunk chunk salvage.
    pub cache_dir: Option<PathBuf>,

    /// Multiplier applied to a mirror's retry wait after each failure.
    pub retry_backoff_factor: u32,

    /// Per-target cap on resume attempts.
    pub max_resume_count: u32,

    /// Initial mirror retry wait in milliseconds.
    pub retry_default_timeout_ms: u64,

    /// Headers added to every request, as `Key: value` pairs.
    pub additional_httpheaders: Vec<String>,

    /// Proxy selection: `scheme://host`, `scheme`, `all://host` or `all`
    /// mapped to a proxy URL.
    pub proxy_map: HashMap<String, String>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            offline: false,
            verbosity: 0,
            adaptive_mirror_sorting: true,
            disable_ssl_verification: false,
            ssl_ca_info: None,
            validate_checksum: true,
            connect_timeout_secs: 30,
            low_speed_time_secs: 30,
            low_speed_limit: 1000,
            max_speed_limit: -1,
            max_parallel_downloads: 5,
            max_downloads_per_mirror: -1,
            transfer_buffersize: 100 * 1024,
            preserve_filetime: true,
            ftp_use_epsv: true,
            cache_dir: None,
            retry_backoff_factor: 2,
            max_resume_count: 3,
            retry_default_timeout_ms: 2000,
            additional_httpheaders: Vec::new(),
            proxy_map: HashMap::new(),
        }
    }
}

impl ContextOptions {
    /// Load options from the usual locations with precedence:
    /// 1. `/etc/fetchpool/config.toml` (system-wide)
    /// 2. `~/.config/fetchpool/config.toml` (user)
    /// 3. `FETCHPOOL_*` environment variables
    pub fn load() -> Self {
        let mut options = ContextOptions::default();

        let system_config = Path::new("/etc/fetchpool/config.toml");
        if let Some(parsed) = read_config(system_config) {
            options = parsed;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("fetchpool").join("config.toml");
            if let Some(parsed) = read_config(&user_config) {
                options = parsed;
            }
        }

        options.apply_env_overrides()
    }

    fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("FETCHPOOL_OFFLINE") {
            self.offline = val == "1" || val.to_lowercase() == "true";
        }
        if let Ok(val) = std::env::var("FETCHPOOL_MAX_PARALLEL_DOWNLOADS") {
            if let Ok(n) = val.parse() {
                self.max_parallel_downloads = n;
            }
        }
        if let Ok(val) = std::env::var("FETCHPOOL_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("FETCHPOOL_VERBOSITY") {
            if let Ok(n) = val.parse() {
                self.verbosity = n;
            }
        }
        self
    }

    pub fn validate(&self) -> DownloadResult<()> {
        if self.max_parallel_downloads == 0 {
            return Err(DownloadError::fatal(
                ErrorCode::BadOptArg,
                "max_parallel_downloads must be at least 1",
            ));
        }
        if self.retry_backoff_factor == 0 {
            return Err(DownloadError::fatal(
                ErrorCode::BadOptArg,
                "retry_backoff_factor must be at least 1",
            ));
        }
        Ok(())
    }
}

fn read_config(path: &Path) -> Option<ContextOptions> {
    let content = fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!("ignoring malformed config {}: {}", path.display(), e);
            None
        }
    }
}

/// Immutable process-wide configuration snapshot.
///
/// Holds the scalar options plus the mirror map and is handed by reference to
/// [`crate::Downloader`]. Per-mirror counters are not stored here; the
/// scheduler owns mutable mirror state.
#[derive(Debug)]
pub struct Context {
    pub offline: bool,
    pub verbosity: u8,
    pub adaptive_mirror_sorting: bool,
    pub disable_ssl_verification: bool,
    pub ssl_ca_info: Option<PathBuf>,
    pub validate_checksum: bool,
    pub connect_timeout: Duration,
    pub low_speed_time: Duration,
    pub low_speed_limit: u64,
    pub max_speed_limit: i64,
    pub max_parallel_downloads: usize,
    pub max_downloads_per_mirror: i64,
    pub transfer_buffersize: usize,
    pub preserve_filetime: bool,
    pub ftp_use_epsv: bool,
    pub cache_dir: PathBuf,
    pub retry_backoff_factor: u32,
    pub max_resume_count: u32,
    pub retry_default_timeout: Duration,
    pub additional_httpheaders: Vec<String>,
    pub proxy_map: HashMap<String, String>,

    /// Mirror lists keyed by the base-url string targets refer to.
    pub mirror_map: HashMap<String, Vec<Mirror>>,
}

impl Context {
    /// Build the process context. Fails if another `Context` is alive or the
    /// cache directory cannot be created.
    pub fn new(options: ContextOptions) -> DownloadResult<Self> {
        options.validate()?;

        if CONTEXT_ALIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DownloadError::fatal(
                ErrorCode::BadFuncArg,
                "context created more than once - instance must be unique",
            ));
        }

        let cache_dir = match options.cache_dir {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map(|d| d.join(".pdcache"))
                .unwrap_or_else(|_| PathBuf::from(".pdcache")),
        };
        if !cache_dir.exists() {
            if let Err(e) = fs::create_dir_all(&cache_dir) {
                CONTEXT_ALIVE.store(false, Ordering::SeqCst);
                return Err(DownloadError::fatal(
                    ErrorCode::CannotCreateDir,
                    format!("cannot create cache dir {}: {e}", cache_dir.display()),
                ));
            }
        }

        Ok(Self {
            offline: options.offline,
            verbosity: options.verbosity,
            adaptive_mirror_sorting: options.adaptive_mirror_sorting,
            disable_ssl_verification: options.disable_ssl_verification,
            ssl_ca_info: options.ssl_ca_info,
            validate_checksum: options.validate_checksum,
            connect_timeout: Duration::from_secs(options.connect_timeout_secs),
            low_speed_time: Duration::from_secs(options.low_speed_time_secs),
            low_speed_limit: options.low_speed_limit,
            max_speed_limit: options.max_speed_limit,
            max_parallel_downloads: options.max_parallel_downloads,
            max_downloads_per_mirror: options.max_downloads_per_mirror,
            transfer_buffersize: options.transfer_buffersize,
            preserve_filetime: options.preserve_filetime,
            ftp_use_epsv: options.ftp_use_epsv,
            cache_dir,
            retry_backoff_factor: options.retry_backoff_factor,
            max_resume_count: options.max_resume_count,
            retry_default_timeout: Duration::from_millis(options.retry_default_timeout_ms),
            additional_httpheaders: options.additional_httpheaders,
            proxy_map: options.proxy_map,
            mirror_map: HashMap::new(),
        })
    }

    /// Register a mirror list under a base-url key.
    ///
    /// Targets created with that key as `base_url` are dispatched through the
    /// registered mirrors instead of the key itself.
    pub fn add_mirrors(&mut self, key: impl Into<String>, mirrors: Vec<Mirror>) {
        self.mirror_map.insert(key.into(), mirrors);
    }

    /// Select a proxy for `url`.
    ///
    /// Match order: exact `scheme://host`, `scheme`, `all://host`, `all`.
    pub fn proxy_for_url(&self, url: &Url) -> Option<String> {
        match_proxy(&self.proxy_map, url)
    }
}

/// Proxy selection shared with the HTTP client builder.
pub(crate) fn match_proxy(proxy_map: &HashMap<String, String>, url: &Url) -> Option<String> {
    if proxy_map.is_empty() {
        return None;
    }
    let scheme = url.scheme();
    let host = url.host_str().unwrap_or("");

    for key in [
        format!("{scheme}://{host}"),
        scheme.to_string(),
        format!("all://{host}"),
        "all".to_string(),
    ] {
        if let Some(proxy) = proxy_map.get(&key) {
            return Some(proxy.clone());
        }
    }
    None
}

impl Drop for Context {
    fn drop(&mut self) {
        CONTEXT_ALIVE.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::context_lock;

    fn test_options(dir: &tempfile::TempDir) -> ContextOptions {
        ContextOptions {
            cache_dir: Some(dir.path().join("cache")),
            ..ContextOptions::default()
        }
    }

    #[test]
    fn test_defaults() {
        let options = ContextOptions::default();
        assert_eq!(options.max_parallel_downloads, 5);
        assert_eq!(options.max_resume_count, 3);
        assert_eq!(options.retry_backoff_factor, 2);
        assert_eq!(options.max_speed_limit, -1);
        assert!(options.validate_checksum);
        assert!(options.adaptive_mirror_sorting);
    }

    #[test]
    fn test_validate() {
        let mut options = ContextOptions::default();
        assert!(options.validate().is_ok());
        options.max_parallel_downloads = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_context_is_unique() {
        let _guard = context_lock();
        let dir = tempfile::tempdir().unwrap();

        let ctx = Context::new(test_options(&dir)).unwrap();
        let second = Context::new(test_options(&dir));
        assert!(second.is_err());

        drop(ctx);
        let third = Context::new(test_options(&dir)).unwrap();
        assert!(third.cache_dir.exists());
    }

    #[test]
    fn test_proxy_matching_order() {
        let _guard = context_lock();
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(test_options(&dir)).unwrap();
        ctx.proxy_map = HashMap::from([
            ("https://repo.example.com".into(), "http://proxy1:8080".into()),
            ("https".into(), "http://proxy2:8080".into()),
            ("all://other.example.com".into(), "http://proxy3:8080".into()),
            ("all".into(), "http://proxy4:8080".into()),
        ]);

        let exact = Url::parse("https://repo.example.com/pkg").unwrap();
        assert_eq!(ctx.proxy_for_url(&exact).as_deref(), Some("http://proxy1:8080"));

        let scheme = Url::parse("https://elsewhere.example.com/pkg").unwrap();
        assert_eq!(ctx.proxy_for_url(&scheme).as_deref(), Some("http://proxy2:8080"));

        let all_host = Url::parse("ftp://other.example.com/pkg").unwrap();
        assert_eq!(ctx.proxy_for_url(&all_host).as_deref(), Some("http://proxy3:8080"));

        let fallback = Url::parse("ftp://nowhere.example.com/pkg").unwrap();
        assert_eq!(ctx.proxy_for_url(&fallback).as_deref(), Some("http://proxy4:8080"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let parsed: ContextOptions = toml::from_str(
            r#"
            offline = true
            max_parallel_downloads = 8
            low_speed_limit = 500

            [proxy_map]
            "https" = "http://proxy:3128"
            "#,
        )
        .unwrap();
        assert!(parsed.offline);
        assert_eq!(parsed.max_parallel_downloads, 8);
        assert_eq!(parsed.low_speed_limit, 500);
        assert_eq!(
            parsed.proxy_map.get("https").map(String::as_str),
            Some("http://proxy:3128")
        );
        // untouched fields keep their defaults
        assert_eq!(parsed.max_resume_count, 3);
    }
}
