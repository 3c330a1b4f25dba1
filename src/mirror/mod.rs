/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Mirrors: interchangeable endpoints with per-mirror statistics,
//! retry/backoff clocks and adaptive ranking.

mod http;
mod oci;
mod s3;

pub use http::HttpMirror;
pub use oci::{OciMirror, SplitPathTag};
pub use s3::S3Mirror;

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::error::DownloadResult;
use crate::target::{DownloadTarget, TransferResponse};

/// Protocol of a mirror, detected from its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Other,
    File,
    Http,
    Ftp,
}

impl Protocol {
    pub fn detect(url: &str) -> Protocol {
        if url.starts_with("file://") || url.starts_with("file:/") {
            Protocol::File
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Protocol::Http
        } else if url.starts_with("ftp://") {
            Protocol::Ftp
        } else {
            Protocol::Other
        }
    }
}

/// Lifecycle state of a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Waiting,
    Authenticating,
    Ready,
    RetryDelay,
    AuthenticationFailed,
    Failed,
}

/// Stable identity of a mirror, derived from kind + URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorId(String);

impl MirrorId {
    pub fn new(kind: &str, url: &str) -> Self {
        Self(format!("{kind}[{url}]"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MirrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-mirror transfer counters.
#[derive(Debug, Clone)]
pub struct MirrorStats {
    /// Maximum allowed parallel connections to this mirror. -1 means no
    /// limit. Dynamically decreased when non-fatal errors occur.
    pub allowed_parallel_connections: i64,

    /// The maximum number of parallel connections ever tried against this
    /// mirror (including unsuccessful ones).
    pub max_tried_parallel_connections: u32,

    /// How many transfers from this mirror are currently in progress.
    pub running_transfers: u32,

    /// How many transfers finished successfully.
    pub successful_transfers: u32,

    /// How many transfers failed.
    pub failed_transfers: u32,

    /// Maximum ranges supported in a single request. Halved when the mirror
    /// answers a range request with a full 200.
    pub max_ranges: u32,
}

impl Default for MirrorStats {
    fn default() -> Self {
        Self {
            allowed_parallel_connections: -1,
            max_tried_parallel_connections: 0,
            running_transfers: 0,
            successful_transfers: 0,
            failed_transfers: 0,
            max_ranges: 256,
        }
    }
}

impl MirrorStats {
    pub fn finished_transfers(&self) -> u32 {
        self.successful_transfers + self.failed_transfers
    }
}

/// A preparatory request (auth or metadata) a mirror needs before the
/// main fetch can be issued.
#[derive(Debug, Clone)]
pub struct PreparationRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
}

/// Capabilities that differ between mirror kinds.
pub trait EndpointOps {
    /// Whether the next transfer must be a handshake rather than the bytes.
    fn needs_preparation(&self, _target: &DownloadTarget) -> bool {
        false
    }

    /// Describe the preparatory fetch, if one is needed right now.
    fn preparation_request(
        &self,
        _base: &str,
        _path: &str,
    ) -> DownloadResult<Option<PreparationRequest>> {
        Ok(None)
    }

    /// Capture state (token, digest) from a finished preparatory fetch.
    fn apply_preparation(
        &mut self,
        _path: &str,
        _response: &TransferResponse,
    ) -> DownloadResult<()> {
        Ok(())
    }

    /// Extra headers for the main fetch of `path`.
    fn auth_headers(&self, _base: &str, _path: &str) -> DownloadResult<Vec<(String, String)>> {
        Ok(Vec::new())
    }

    /// Compose the final URL for the main fetch.
    fn format_url(&self, base: &str, target: &DownloadTarget) -> DownloadResult<String>;

    /// Basic-auth credentials to attach to the main fetch, if any.
    fn credentials(&self) -> Option<(String, String)> {
        None
    }
}

/// The concrete kind of an endpoint.
#[derive(Clone)]
pub enum MirrorKind {
    Http(HttpMirror),
    S3(S3Mirror),
    Oci(OciMirror),
}

impl fmt::Debug for MirrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorKind::Http(_) => write!(f, "Http"),
            MirrorKind::S3(_) => write!(f, "S3"),
            MirrorKind::Oci(_) => write!(f, "Oci"),
        }
    }
}

impl MirrorKind {
    fn ops(&self) -> &dyn EndpointOps {
        match self {
            MirrorKind::Http(m) => m,
            MirrorKind::S3(m) => m,
            MirrorKind::Oci(m) => m,
        }
    }

    fn ops_mut(&mut self) -> &mut dyn EndpointOps {
        match self {
            MirrorKind::Http(m) => m,
            MirrorKind::S3(m) => m,
            MirrorKind::Oci(m) => m,
        }
    }
}

/// One endpoint capable of serving logical paths, with its statistics and
/// retry clocks.
#[derive(Debug, Clone)]
pub struct Mirror {
    id: MirrorId,
    url: String,
    protocol: Protocol,
    pub state: MirrorState,
    pub stats: MirrorStats,

    next_retry: Option<Instant>,
    retry_wait: Duration,
    retry_backoff_factor: u32,
    retry_counter: u32,

    kind: MirrorKind,
}

impl Mirror {
    fn new(kind_name: &str, url: &str, kind: MirrorKind) -> Self {
        let url = strip_trailing_slash(url);
        Self {
            id: MirrorId::new(kind_name, &url),
            protocol: Protocol::detect(&url),
            url,
            state: MirrorState::Ready,
            stats: MirrorStats::default(),
            next_retry: None,
            retry_wait: Duration::from_millis(200),
            retry_backoff_factor: 2,
            retry_counter: 0,
            kind,
        }
    }

    /// A plain HTTP(S) or file mirror.
    pub fn http(url: impl AsRef<str>) -> Self {
        Self::new("HttpMirror", url.as_ref(), MirrorKind::Http(HttpMirror::new()))
    }

    /// An HTTP mirror injecting basic-auth credentials.
    pub fn http_with_auth(
        url: impl AsRef<str>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::new(
            "HttpMirror",
            url.as_ref(),
            MirrorKind::Http(HttpMirror::with_auth(user, password)),
        )
    }

    /// An S3-compatible bucket endpoint signing requests with SigV4.
    pub fn s3(
        bucket_url: impl AsRef<str>,
        region: impl Into<String>,
        aws_access_key_id: impl Into<String>,
        aws_secret_access_key: impl Into<String>,
    ) -> Self {
        Self::new(
            "S3Mirror",
            bucket_url.as_ref(),
            MirrorKind::S3(S3Mirror::new(region, aws_access_key_id, aws_secret_access_key)),
        )
    }

    /// An OCI registry serving blobs after a token + manifest handshake.
    pub fn oci(url: impl AsRef<str>, mirror: OciMirror) -> Self {
        Self::new("OciMirror", url.as_ref(), MirrorKind::Oci(mirror))
    }

    pub fn id(&self) -> &MirrorId {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Take over retry tuning from the process context.
    pub(crate) fn apply_context(&mut self, ctx: &Context) {
        self.retry_wait = ctx.retry_default_timeout;
        self.retry_backoff_factor = ctx.retry_backoff_factor;
        if ctx.max_downloads_per_mirror > 0 {
            self.stats.allowed_parallel_connections = ctx.max_downloads_per_mirror;
        }
    }

    /// Mirror rank, or -1.0 while it is too early to judge.
    ///
    /// The rank is the success rate once at least 3 transfers finished.
    pub fn rank(&self) -> f64 {
        let finished = self.stats.finished_transfers();
        if finished < 3 {
            return -1.0;
        }
        f64::from(self.stats.successful_transfers) / f64::from(finished)
    }

    pub fn need_wait_for_retry(&self) -> bool {
        self.retry_counter != 0
            && matches!(self.next_retry, Some(at) if at > Instant::now())
    }

    pub fn has_running_transfers(&self) -> bool {
        self.stats.running_transfers > 0
    }

    pub fn set_allowed_parallel_connections(&mut self, n: i64) {
        self.stats.allowed_parallel_connections = n;
    }

    /// Initialize the parallel-connection limit from the context cap, once.
    pub fn init_allowed_parallel_connections(&mut self, max_per_mirror: i64) {
        if self.stats.allowed_parallel_connections == -1 && max_per_mirror > 0 {
            self.stats.allowed_parallel_connections = max_per_mirror;
        }
    }

    pub fn increase_running_transfers(&mut self) {
        self.stats.running_transfers += 1;
        if self.stats.max_tried_parallel_connections < self.stats.running_transfers {
            self.stats.max_tried_parallel_connections = self.stats.running_transfers;
        }
    }

    pub fn is_parallel_connections_limited_and_reached(&self) -> bool {
        self.stats.allowed_parallel_connections != -1
            && i64::from(self.stats.running_transfers) >= self.stats.allowed_parallel_connections
    }

    pub fn change_max_ranges(&mut self, new_value: u32) {
        self.stats.max_ranges = new_value;
    }

    /// Record the outcome of one finished transfer.
    ///
    /// On failure the retry clock advances: on the first failure, or once the
    /// previous wait elapsed, the wait is multiplied by the backoff factor
    /// and the next retry pushed out accordingly.
    pub fn update_statistics(&mut self, transfer_success: bool) {
        self.stats.running_transfers = self.stats.running_transfers.saturating_sub(1);
        if transfer_success {
            self.stats.successful_transfers += 1;
        } else {
            self.stats.failed_transfers += 1;
            let clock_elapsed = matches!(self.next_retry, Some(at) if at < Instant::now());
            if self.stats.failed_transfers == 1 || clock_elapsed {
                self.retry_counter += 1;
                self.retry_wait *= self.retry_backoff_factor;
                self.next_retry = Some(Instant::now() + self.retry_wait);
            }
        }
    }

    // Kind dispatch.

    pub fn needs_preparation(&self, target: &DownloadTarget) -> bool {
        self.kind.ops().needs_preparation(target)
    }

    pub fn preparation_request(&self, path: &str) -> DownloadResult<Option<PreparationRequest>> {
        self.kind.ops().preparation_request(&self.url, path)
    }

    pub fn apply_preparation(
        &mut self,
        path: &str,
        response: &TransferResponse,
    ) -> DownloadResult<()> {
        self.kind.ops_mut().apply_preparation(path, response)
    }

    pub fn auth_headers(&self, path: &str) -> DownloadResult<Vec<(String, String)>> {
        self.kind.ops().auth_headers(&self.url, path)
    }

    pub fn format_url(&self, target: &DownloadTarget) -> DownloadResult<String> {
        self.kind.ops().format_url(&self.url, target)
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        self.kind.ops().credentials()
    }

    #[cfg(test)]
    pub(crate) fn retry_wait(&self) -> Duration {
        self.retry_wait
    }
}

/// Owned table of mirrors, addressed by stable [`MirrorId`] keys.
#[derive(Default)]
pub struct MirrorArena {
    mirrors: HashMap<MirrorId, Mirror>,
}

impl MirrorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mirror, keeping an already-registered one (and its
    /// accumulated statistics) when the id is known.
    pub fn insert(&mut self, mirror: Mirror) -> MirrorId {
        let id = mirror.id().clone();
        self.mirrors.entry(id.clone()).or_insert(mirror);
        id
    }

    pub fn get(&self, id: &MirrorId) -> Option<&Mirror> {
        self.mirrors.get(id)
    }

    pub fn get_mut(&mut self, id: &MirrorId) -> Option<&mut Mirror> {
        self.mirrors.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }
}

/// Re-order a target's mirror list after a finished transfer.
///
/// Only immediate neighbors are swapped: success promotes the used mirror by
/// one slot, failure demotes it by one. A serious failure from a mirror with
/// no prior successes moves it to the end of the list.
pub fn sort_mirrors(
    order: &mut [MirrorId],
    arena: &MirrorArena,
    just_used: &MirrorId,
    success: bool,
    serious: bool,
) {
    if order.len() <= 1 {
        return;
    }
    let Some(pos) = order.iter().position(|id| id == just_used) else {
        return;
    };

    // Already last: no penalization possible.
    if !success && pos + 1 == order.len() {
        return;
    }
    // Already first: no bonus possible.
    if success && pos == 0 {
        return;
    }

    let rank_of = |id: &MirrorId| arena.get(id).map_or(-1.0, Mirror::rank);
    let successes = arena
        .get(just_used)
        .map_or(0, |m| m.stats.successful_transfers);

    if serious && successes == 0 {
        // Probably down/broken/buggy.
        order.swap(pos, order.len() - 1);
        tracing::info!("mirror {} was moved to the end", just_used);
        return;
    }

    let rank_cur = rank_of(just_used);
    // Too early to judge.
    if rank_cur < 0.0 {
        return;
    }

    if !success {
        let rank_next = rank_of(&order[pos + 1]);
        if rank_next < 0.0 || rank_next > rank_cur {
            order.swap(pos, pos + 1);
            tracing::info!("mirror {} was penalized", just_used);
        }
    } else {
        let rank_prev = rank_of(&order[pos - 1]);
        if rank_prev < rank_cur {
            order.swap(pos, pos - 1);
            tracing::info!("mirror {} was awarded", just_used);
        }
    }
}

pub(crate) fn strip_trailing_slash(s: &str) -> String {
    if s.len() > 1 && s.ends_with('/') && s != "file://" {
        s[..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Join a base URL and a path with exactly one separating slash.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_detection() {
        assert_eq!(Protocol::detect("https://repo.example.com"), Protocol::Http);
        assert_eq!(Protocol::detect("http://repo.example.com"), Protocol::Http);
        assert_eq!(Protocol::detect("file:///var/cache"), Protocol::File);
        assert_eq!(Protocol::detect("ftp://repo.example.com"), Protocol::Ftp);
        assert_eq!(Protocol::detect("rsync://repo.example.com"), Protocol::Other);
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://a.com/", "/x/y"), "https://a.com/x/y");
        assert_eq!(join_url("https://a.com", "x/y"), "https://a.com/x/y");
    }

    #[test]
    fn test_trailing_slash_stripped() {
        let m = Mirror::http("https://repo.example.com/");
        assert_eq!(m.url(), "https://repo.example.com");
    }

    #[test]
    fn test_rank_needs_three_observations() {
        let mut m = Mirror::http("https://a");
        assert_eq!(m.rank(), -1.0);

        m.increase_running_transfers();
        m.update_statistics(true);
        m.increase_running_transfers();
        m.update_statistics(true);
        assert_eq!(m.rank(), -1.0);

        m.increase_running_transfers();
        m.update_statistics(false);
        assert!((m.rank() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rank_monotonicity() {
        let mut m = Mirror::http("https://a");
        for _ in 0..3 {
            m.increase_running_transfers();
            m.update_statistics(true);
        }
        let mut prev = m.rank();
        // successes never decrease the rank
        for _ in 0..5 {
            m.increase_running_transfers();
            m.update_statistics(true);
            assert!(m.rank() >= prev);
            prev = m.rank();
        }
        // failures never increase it
        for _ in 0..5 {
            m.increase_running_transfers();
            m.update_statistics(false);
            assert!(m.rank() <= prev);
            prev = m.rank();
        }
    }

    #[test]
    fn test_retry_backoff() {
        let mut m = Mirror::http("https://a");
        let initial = m.retry_wait();
        m.increase_running_transfers();
        m.update_statistics(false);
        assert_eq!(m.retry_wait(), initial * 2);
        assert!(m.need_wait_for_retry());
    }

    #[test]
    fn test_parallel_connection_limits() {
        let mut m = Mirror::http("https://a");
        assert!(!m.is_parallel_connections_limited_and_reached());

        m.init_allowed_parallel_connections(2);
        m.increase_running_transfers();
        assert!(!m.is_parallel_connections_limited_and_reached());
        m.increase_running_transfers();
        assert!(m.is_parallel_connections_limited_and_reached());
        assert_eq!(m.stats.max_tried_parallel_connections, 2);

        // init is one-shot
        m.init_allowed_parallel_connections(10);
        assert_eq!(m.stats.allowed_parallel_connections, 2);
    }

    #[test]
    fn test_running_transfer_bounds() {
        let mut m = Mirror::http("https://a");
        m.increase_running_transfers();
        m.update_statistics(true);
        assert_eq!(m.stats.running_transfers, 0);
        assert!(m.stats.running_transfers <= m.stats.max_tried_parallel_connections);
    }

    #[test]
    fn test_arena_deduplicates_by_id() {
        let mut arena = MirrorArena::new();
        let mut first = Mirror::http("https://a");
        first.increase_running_transfers();
        first.update_statistics(true);
        let id = arena.insert(first);

        let again = arena.insert(Mirror::http("https://a"));
        assert_eq!(id, again);
        assert_eq!(arena.len(), 1);
        // statistics of the original survive re-insertion
        assert_eq!(arena.get(&id).unwrap().stats.successful_transfers, 1);
    }

    fn arena_with(ranks: &[(&str, u32, u32)]) -> (MirrorArena, Vec<MirrorId>) {
        let mut arena = MirrorArena::new();
        let mut order = Vec::new();
        for (url, ok, bad) in ranks {
            let mut m = Mirror::http(*url);
            for _ in 0..*ok {
                m.increase_running_transfers();
                m.update_statistics(true);
            }
            for _ in 0..*bad {
                m.increase_running_transfers();
                m.update_statistics(false);
            }
            order.push(arena.insert(m));
        }
        (arena, order)
    }

    #[test]
    fn test_sort_mirrors_promotes_on_success() {
        let (arena, mut order) = arena_with(&[("https://slow", 1, 3), ("https://fast", 4, 0)]);
        let used = order[1].clone();
        sort_mirrors(&mut order, &arena, &used, true, false);
        assert_eq!(order[0], used);
    }

    #[test]
    fn test_sort_mirrors_demotes_on_failure() {
        let (arena, mut order) = arena_with(&[("https://bad", 1, 3), ("https://good", 4, 0)]);
        let used = order[0].clone();
        sort_mirrors(&mut order, &arena, &used, false, false);
        assert_eq!(order[1], used);
    }

    #[test]
    fn test_sort_mirrors_serious_moves_to_end() {
        let (arena, mut order) = arena_with(&[
            ("https://broken", 0, 1),
            ("https://b", 0, 0),
            ("https://c", 0, 0),
        ]);
        let used = order[0].clone();
        sort_mirrors(&mut order, &arena, &used, false, true);
        assert_eq!(order[2], used);
    }

    #[test]
    fn test_sort_mirrors_too_early_is_noop() {
        let (arena, mut order) = arena_with(&[("https://a", 1, 0), ("https://b", 0, 0)]);
        let snapshot = order.clone();
        let used = order[0].clone();
        sort_mirrors(&mut order, &arena, &used, false, false);
        // fewer than 3 finished transfers: rank unknown, order untouched
        assert_eq!(order, snapshot);
    }

    #[test]
    fn test_sort_mirrors_single_entry_noop() {
        let (arena, mut order) = arena_with(&[("https://only", 0, 5)]);
        let used = order[0].clone();
        sort_mirrors(&mut order, &arena, &used, false, true);
        assert_eq!(order.len(), 1);
    }
}
