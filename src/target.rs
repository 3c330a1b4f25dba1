/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 */

//! Caller-facing description of one desired file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::checksum::{self, Checksum, ChecksumKind};
use crate::downloader::zck::ZckTargetState;
use crate::error::{DownloadError, DownloadResult, ErrorCode};
use crate::fileio::FileSlot;
use crate::mirror::MirrorId;

/// Terminal status reported to the end callback, exactly once per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Successful,
    AlreadyExists,
    Error,
}

/// Return code from user callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbReturnCode {
    Ok,
    Abort,
    Error,
}

/// Progress observer: `(total_to_download, downloaded)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Called once per terminal state with the accumulated response.
pub type EndCallback = Box<dyn FnMut(TransferStatus, &TransferResponse) -> CbReturnCode + Send>;

/// Conditional-request state from a previous fetch of the same resource.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// What the server said during the (last) transfer for a target.
#[derive(Debug, Clone, Default)]
pub struct TransferResponse {
    /// HTTP status code.
    pub status: Option<u16>,
    /// Response headers, keys lowercased.
    pub headers: HashMap<String, String>,
    /// URL after redirects.
    pub effective_url: Option<String>,
    /// Bytes delivered by the server in this transfer.
    pub downloaded_size: u64,
    /// Average download speed in bytes/second.
    pub average_speed: f64,
    /// Remote file time, when the server provided one.
    pub filetime: Option<SystemTime>,
    /// Response body; captured only for preparation round-trips.
    pub body: Option<Vec<u8>>,
}

impl TransferResponse {
    pub fn ok(&self) -> bool {
        matches!(self.status, Some(code) if code / 100 == 2)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Parse the captured body as JSON (preparation responses).
    pub fn json(&self) -> DownloadResult<serde_json::Value> {
        let body = self.body.as_deref().ok_or_else(|| {
            DownloadError::serious(ErrorCode::Transport, "response body was not captured")
        })?;
        serde_json::from_slice(body).map_err(|e| {
            DownloadError::serious(ErrorCode::Transport, format!("invalid json response: {e}"))
        })
    }
}

/// The caller-facing description of one desired file.
///
/// `path` may be a complete URL; otherwise it is resolved against `base_url`
/// or a registered mirror list. Exactly one of those three sources must be
/// available when the target is dispatched.
pub struct DownloadTarget {
    /// Logical path, possibly a complete URL.
    pub path: String,
    /// Optional URL prefix used when no mirrors apply.
    pub base_url: String,
    /// Final on-disk destination.
    pub filename: PathBuf,
    /// Derived complete URL when `path` or `base_url` is absolute.
    pub complete_url: Option<String>,

    /// Derived from `path` ending in `.zck`.
    pub is_zchunk: bool,
    /// Whether a partial `.pdpart` may be continued.
    pub resume: bool,
    /// Ask intermediaries for fresh data.
    pub no_cache: bool,

    pub byterange_start: u64,
    pub byterange_end: u64,
    /// Raw range spec for the `Range` header (`start-end[,start-end...]`).
    pub range: String,

    /// If non-zero, Content-Length and the final size must match exactly.
    pub expected_size: u64,
    /// Uncompressed size of the full resource (zchunk fallback fetches).
    pub orig_size: u64,

    pub checksums: Vec<Checksum>,
    pub cache_control: Option<CacheControl>,

    pub progress_callback: Option<ProgressCallback>,
    pub end_callback: Option<EndCallback>,

    /// Zchunk reassembly state, present iff the target is zchunk and an
    /// engine was attached.
    pub zck: Option<ZckTargetState>,

    /// The open slot while a transfer is in progress (lifecycle-owned).
    pub(crate) outfile: Option<FileSlot>,

    /// Set at finalization.
    pub effective_url: Option<String>,
    pub used_mirror: Option<MirrorId>,
    pub error: Option<DownloadError>,
}

impl std::fmt::Debug for DownloadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTarget")
            .field("path", &self.path)
            .field("base_url", &self.base_url)
            .field("filename", &self.filename)
            .field("is_zchunk", &self.is_zchunk)
            .field("expected_size", &self.expected_size)
            .finish_non_exhaustive()
    }
}

impl DownloadTarget {
    pub fn new(path: impl Into<String>, base_url: impl Into<String>, filename: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let base_url = base_url.into();

        let complete_url = if path.contains("://") {
            Some(path.clone())
        } else if base_url.contains("://") {
            Some(crate::mirror::join_url(&base_url, &path))
        } else {
            None
        };

        Self {
            is_zchunk: path.ends_with(".zck"),
            path,
            base_url,
            filename: filename.into(),
            complete_url,
            resume: false,
            no_cache: false,
            byterange_start: 0,
            byterange_end: 0,
            range: String::new(),
            expected_size: 0,
            orig_size: 0,
            checksums: Vec::new(),
            cache_control: None,
            progress_callback: None,
            end_callback: None,
            zck: None,
            outfile: None,
            effective_url: None,
            used_mirror: None,
            error: None,
        }
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = size;
        self
    }

    pub fn with_checksum(mut self, kind: ChecksumKind, hex: impl Into<String>) -> Self {
        self.checksums.push(Checksum::new(kind, hex));
        self
    }

    pub fn with_byterange(mut self, start: u64, end: u64) -> Self {
        self.byterange_start = start;
        self.byterange_end = end;
        self
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = range.into();
        self
    }

    pub fn with_cache_control(mut self, cache_control: CacheControl) -> Self {
        self.cache_control = Some(cache_control);
        self
    }

    pub fn with_progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.progress_callback = Some(cb);
        self
    }

    pub fn with_end_callback(mut self, cb: EndCallback) -> Self {
        self.end_callback = Some(cb);
        self
    }

    /// Attach the zchunk engine driving reassembly for a `.zck` target.
    pub fn with_zck(mut self, state: ZckTargetState) -> Self {
        self.zck = Some(state);
        self
    }

    pub fn has_complete_url(&self) -> bool {
        self.complete_url.is_some()
    }

    /// At most one of (range, byterange_start, resume) may be active.
    pub(crate) fn check_transfer_constraints(&self) -> DownloadResult<()> {
        if self.byterange_start > 0 && (self.resume || !self.range.is_empty()) {
            return Err(DownloadError::fatal(
                ErrorCode::BadFuncArg,
                "byterange_start cannot be combined with resume or a range",
            ));
        }
        if !self.range.is_empty() && (self.resume || self.byterange_start > 0) {
            return Err(DownloadError::fatal(
                ErrorCode::BadFuncArg,
                "a range cannot be combined with resume or byterange_start",
            ));
        }
        Ok(())
    }

    /// Conditional-request headers derived from `cache_control`.
    pub(crate) fn cache_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(cc) = &self.cache_control {
            if let Some(etag) = &cc.etag {
                headers.push(("If-None-Match".to_string(), etag.clone()));
            }
            if let Some(last_modified) = &cc.last_modified {
                headers.push(("If-Modified-Since".to_string(), last_modified.clone()));
            }
        }
        headers
    }

    /// Validate `path` against the strongest provided checksum.
    pub fn validate_checksum(&self, path: &Path) -> DownloadResult<bool> {
        if self.checksums.is_empty() {
            return Ok(false);
        }
        checksum::validate_checksum(path, &self.checksums)
    }

    /// Destination already exists and its checksum matches.
    pub fn already_downloaded(&self) -> bool {
        if self.checksums.is_empty() || !self.filename.exists() {
            return false;
        }
        self.validate_checksum(&self.filename).unwrap_or(false)
    }

    pub(crate) fn set_error(&mut self, error: DownloadError) {
        self.error = Some(error);
    }
}
