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

//! The multi-slot transfer scheduler.
//!
//! A single cooperative driver keeps up to `max_parallel_downloads` transfers
//! in flight, selects mirrors for waiting targets, dispatches completions,
//! and decides between retry, zchunk continuation and finalization. All
//! mutable state is touched only between completions on the driver task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::context::Context;
use crate::error::{DownloadError, DownloadResult, ErrorCode};
use crate::mirror::{join_url, sort_mirrors, Mirror, MirrorArena, MirrorId, Protocol};
use crate::target::DownloadTarget;
use crate::transfer::{run_transfer, TransferJob, TransferOutcome, TransferSink};

use super::target::{DownloadState, Target};
use super::DownloadOptions;

static SIG_INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Ask a running [`Downloader::download`] loop to stop at its next tick.
pub fn request_interrupt() {
    SIG_INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Clear a previously requested interrupt.
pub fn reset_interrupt() {
    SIG_INTERRUPTED.store(false, Ordering::SeqCst);
}

pub fn is_sig_interrupted() -> bool {
    SIG_INTERRUPTED.load(Ordering::SeqCst)
}

type InFlight = FuturesUnordered<BoxFuture<'static, TransferOutcome>>;

/// The scheduler: owns the targets, the mirror arena and the HTTP client.
pub struct Downloader<'ctx> {
    ctx: &'ctx Context,
    client: reqwest::Client,
    mirrors: MirrorArena,
    targets: Vec<Target>,

    allowed_mirror_failures: i64,
    max_mirrors_to_try: i64,
    max_parallel_connections: usize,
}

impl<'ctx> Downloader<'ctx> {
    pub fn new(ctx: &'ctx Context) -> DownloadResult<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(ctx.connect_timeout)
            .pool_max_idle_per_host(ctx.max_parallel_downloads)
            .tcp_nodelay(true)
            .user_agent(concat!("fetchpool/", env!("CARGO_PKG_VERSION")));

        if ctx.disable_ssl_verification {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca_path) = &ctx.ssl_ca_info {
            let pem = std::fs::read(ca_path).map_err(|e| {
                DownloadError::fatal(
                    ErrorCode::File,
                    format!("cannot read CA bundle {}: {e}", ca_path.display()),
                )
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                DownloadError::fatal(ErrorCode::BadOptArg, format!("invalid CA bundle: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if !ctx.proxy_map.is_empty() {
            let proxy_map = ctx.proxy_map.clone();
            let proxy = reqwest::Proxy::custom(move |url| {
                crate::context::match_proxy(&proxy_map, url)
                    .and_then(|p| reqwest::Url::parse(&p).ok())
            });
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            DownloadError::fatal(ErrorCode::BadOptArg, format!("failed to build HTTP client: {e}"))
        })?;

        Ok(Self {
            ctx,
            client,
            mirrors: MirrorArena::new(),
            targets: Vec::new(),
            allowed_mirror_failures: 3,
            max_mirrors_to_try: -1,
            max_parallel_connections: ctx.max_parallel_downloads,
        })
    }

    /// Cap how many mirrors are tried per target (-1 = unlimited).
    pub fn set_max_mirrors_to_try(&mut self, n: i64) {
        self.max_mirrors_to_try = n;
    }

    /// How many failures a mirror may accumulate before it is skipped.
    pub fn set_allowed_mirror_failures(&mut self, n: i64) {
        self.allowed_mirror_failures = n;
    }

    /// Queue a target. Must not be called after [`Downloader::download`].
    ///
    /// When the target's `base_url` matches a key in the context mirror map
    /// the registered mirrors serve it and `base_url` is dropped.
    pub fn add(&mut self, mut dl_target: DownloadTarget) {
        let mut mirror_ids = Vec::new();
        if let Some(mirrors) = self.ctx.mirror_map.get(&dl_target.base_url) {
            for mirror in mirrors {
                let mut mirror = mirror.clone();
                mirror.apply_context(self.ctx);
                mirror_ids.push(self.mirrors.insert(mirror));
            }
            dl_target.base_url.clear();
        }
        self.targets.push(Target::new(dl_target, mirror_ids));
    }

    /// Queue a target with an explicit mirror list.
    pub fn add_with_mirrors(&mut self, dl_target: DownloadTarget, mirrors: Vec<Mirror>) {
        let mut mirror_ids = Vec::new();
        for mirror in mirrors {
            let mut mirror = mirror;
            mirror.apply_context(self.ctx);
            mirror_ids.push(self.mirrors.insert(mirror));
        }
        self.targets.push(Target::new(dl_target, mirror_ids));
    }

    /// The queued targets (terminal states and errors after a run).
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Consume the scheduler, yielding the caller-facing targets.
    pub fn into_targets(self) -> Vec<DownloadTarget> {
        self.targets.into_iter().map(|t| t.target).collect()
    }

    /// Run until every target reached a terminal state.
    ///
    /// Returns an error only for fatal run-aborts (failfast failures, fatal
    /// callbacks, interrupt); per-target errors are delivered through the end
    /// callbacks and `DownloadTarget::error`.
    pub async fn download(&mut self, options: DownloadOptions) -> DownloadResult<()> {
        let mut in_flight: InFlight = FuturesUnordered::new();
        self.prepare_next_transfers(&mut in_flight, &options)?;

        loop {
            if is_sig_interrupted() {
                tracing::info!("download interrupted");
                return Err(DownloadError::fatal(
                    ErrorCode::Interrupted,
                    "download interrupted by signal",
                ));
            }

            if in_flight.is_empty() {
                if self
                    .targets
                    .iter()
                    .any(|t| t.state == DownloadState::Waiting)
                {
                    // Blocked on mirror retry clocks or connection limits.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    self.prepare_next_transfers(&mut in_flight, &options)?;
                    continue;
                }
                break;
            }

            match tokio::time::timeout(Duration::from_secs(1), in_flight.next()).await {
                // Tick: re-check the interrupt flag.
                Err(_) => continue,
                Ok(None) => continue,
                Ok(Some(outcome)) => {
                    self.handle_completion(outcome, &options)?;
                    self.prepare_next_transfers(&mut in_flight, &options)?;
                }
            }
        }

        tracing::debug!("all downloads finished");
        Ok(())
    }

    /// Fill free transfer slots with waiting targets.
    fn prepare_next_transfers(
        &mut self,
        in_flight: &mut InFlight,
        options: &DownloadOptions,
    ) -> DownloadResult<()> {
        while in_flight.len() < self.max_parallel_connections {
            let Some((index, full_url)) = self.select_next_target(options)? else {
                break;
            };

            if full_url.is_empty() {
                self.submit_preparation(index, in_flight, options)?;
                continue;
            }

            tracing::info!("downloading {}", full_url);
            let job = {
                let ctx = self.ctx;
                let mirror_id = self.targets[index].mirror.clone();
                let arena = &self.mirrors;
                let targets = &mut self.targets;
                let mirror = mirror_id.as_ref().and_then(|id| arena.get(id));
                targets[index].prepare_transfer(index, &full_url, mirror, ctx)
            };

            match job {
                Err(e) => {
                    self.targets[index].set_failed(e.clone(), self.ctx);
                    if options.failfast && !options.allow_failure {
                        return Err(e);
                    }
                }
                Ok(None) => {
                    // Satisfied without a fetch (zchunk completed locally).
                }
                Ok(Some(job)) => {
                    if let Some(id) = self.targets[index].mirror.clone() {
                        if let Some(mirror) = self.mirrors.get_mut(&id) {
                            mirror.increase_running_transfers();
                        }
                    }
                    in_flight.push(Box::pin(run_transfer(self.client.clone(), job)));
                }
            }
        }
        Ok(())
    }

    /// Submit the preparatory (auth/manifest) fetch for a target's mirror.
    fn submit_preparation(
        &mut self,
        index: usize,
        in_flight: &mut InFlight,
        options: &DownloadOptions,
    ) -> DownloadResult<()> {
        let request = {
            let target = &self.targets[index];
            let mirror = target
                .mirror
                .as_ref()
                .and_then(|id| self.mirrors.get(id))
                .ok_or_else(|| {
                    DownloadError::fatal(ErrorCode::BadFuncArg, "preparation without a mirror")
                })?;
            mirror.preparation_request(&target.target.path)
        };

        let prep = match request {
            Ok(Some(prep)) => prep,
            Ok(None) => {
                let e = DownloadError::fatal(
                    ErrorCode::BadFuncArg,
                    "mirror requested preparation but produced no request",
                );
                self.targets[index].set_failed(e.clone(), self.ctx);
                if options.failfast && !options.allow_failure {
                    return Err(e);
                }
                return Ok(());
            }
            Err(e) => {
                self.targets[index].set_failed(e.clone(), self.ctx);
                if options.failfast && !options.allow_failure {
                    return Err(e);
                }
                return Ok(());
            }
        };

        let target = &mut self.targets[index];
        target.state = DownloadState::Preparation;
        let job = TransferJob {
            index,
            url: prep.url,
            headers: prep.headers,
            basic_auth: prep.basic_auth,
            resume_from: None,
            range: None,
            range_count: 0,
            expected_size: 0,
            sink: TransferSink::Capture,
            outfile: None,
            zck_dl: None,
            progress: None,
            progress_total: 0,
            progress_offset: 0,
            stall_timeout: self.ctx.low_speed_time,
            max_speed_limit: -1,
            buffersize: self.ctx.transfer_buffersize,
        };
        in_flight.push(Box::pin(run_transfer(self.client.clone(), job)));
        Ok(())
    }

    /// Pick the next waiting target and derive its fetch URL.
    ///
    /// Returns the target index plus the URL, or an empty URL when the chosen
    /// mirror must run a preparation round-trip first.
    fn select_next_target(
        &mut self,
        options: &DownloadOptions,
    ) -> DownloadResult<Option<(usize, String)>> {
        for index in 0..self.targets.len() {
            if self.targets[index].state != DownloadState::Waiting {
                continue;
            }

            if self.targets[index].check_if_already_finished(self.ctx) {
                continue;
            }

            // Sanity check: some URL source must exist.
            {
                let t = &self.targets[index].target;
                if !t.has_complete_url() && t.base_url.is_empty() && self.targets[index].mirrors.is_empty()
                {
                    let e = DownloadError::fatal(
                        ErrorCode::NoUrl,
                        format!("empty mirror list and no base url specified for {}", t.path),
                    );
                    self.targets[index].set_failed(e.clone(), self.ctx);
                    if options.failfast && !options.allow_failure {
                        return Err(e);
                    }
                    continue;
                }
            }

            let full_url;
            if let Some(url) = self.targets[index].target.complete_url.clone() {
                // Complete URL: no mirror involved.
                self.targets[index].mirror = None;
                full_url = url;
            } else if !self.targets[index].target.base_url.is_empty() {
                self.targets[index].mirror = None;
                let t = &self.targets[index].target;
                full_url = join_url(&t.base_url, &t.path);
            } else {
                match self.select_suitable_mirror(index) {
                    Err(e) => {
                        self.targets[index].set_failed(e.clone(), self.ctx);
                        if options.failfast && !options.allow_failure {
                            return Err(e);
                        }
                        continue;
                    }
                    Ok(None) => {
                        // All candidate mirrors are saturated right now.
                        continue;
                    }
                    Ok(Some(id)) => {
                        let needs_preparation = {
                            let mirror = self.mirrors.get(&id).ok_or_else(|| {
                                DownloadError::fatal(ErrorCode::Mirrors, "mirror vanished")
                            })?;
                            mirror.needs_preparation(&self.targets[index].target)
                        };
                        self.targets[index].mirror = Some(id.clone());
                        if needs_preparation {
                            return Ok(Some((index, String::new())));
                        }
                        let mirror = self.mirrors.get(&id).ok_or_else(|| {
                            DownloadError::fatal(ErrorCode::Mirrors, "mirror vanished")
                        })?;
                        full_url = mirror.format_url(&self.targets[index].target)?;
                    }
                }
            }

            if self.ctx.offline && !full_url.starts_with("file:") {
                let e = DownloadError::serious(
                    ErrorCode::NotLocal,
                    format!("cannot download {full_url}: offline mode is specified"),
                );
                self.targets[index].set_failed(e.clone(), self.ctx);
                if options.failfast && !options.allow_failure {
                    return Err(e);
                }
                continue;
            }

            return Ok(Some((index, full_url)));
        }

        Ok(None)
    }

    /// Choose a mirror for a target.
    ///
    /// The first pass skips already-tried and known-bad mirrors; when nothing
    /// fits, later passes relax the conditions proportionally to each
    /// mirror's failure count. `Ok(None)` means every candidate is merely
    /// busy right now; an error means no mirror can ever serve the target.
    fn select_suitable_mirror(&mut self, index: usize) -> DownloadResult<Option<MirrorId>> {
        let candidates = self.targets[index].mirrors.clone();
        let mut at_least_one_suitable = false;
        let mut reiterate = false;
        let mut iteration: usize = 0;

        loop {
            for id in &candidates {
                let Some(mirror) = self.mirrors.get_mut(id) else {
                    continue;
                };

                if iteration == 0 {
                    if mirror.protocol() != Protocol::File {
                        reiterate = true;
                    }
                    if self.targets[index].tried_mirrors.contains(id) {
                        continue;
                    }
                    if mirror.stats.successful_transfers == 0
                        && self.allowed_mirror_failures > 0
                        && i64::from(mirror.stats.failed_transfers) >= self.allowed_mirror_failures
                    {
                        tracing::debug!(
                            "skipping bad mirror ({} failures and no success): {}",
                            mirror.stats.failed_transfers,
                            mirror.url()
                        );
                        continue;
                    }
                } else if mirror.protocol() == Protocol::File {
                    // Retrying local paths has no reason.
                    continue;
                } else if iteration < mirror.stats.failed_transfers as usize {
                    // Reuse mirrors with few failures first.
                    continue;
                }

                at_least_one_suitable = true;

                if mirror.need_wait_for_retry()
                    || mirror.is_parallel_connections_limited_and_reached()
                {
                    continue;
                }

                mirror.init_allowed_parallel_connections(self.ctx.max_downloads_per_mirror);
                if mirror.is_parallel_connections_limited_and_reached() {
                    continue;
                }

                return Ok(Some(id.clone()));
            }

            iteration += 1;
            let tried = self.targets[index].tried_mirrors.len() as i64;
            if !(reiterate
                && tried < self.allowed_mirror_failures
                && (iteration as i64) < self.allowed_mirror_failures)
            {
                break;
            }
        }

        if at_least_one_suitable {
            Ok(None)
        } else {
            Err(DownloadError::serious(
                ErrorCode::NoUrl,
                format!(
                    "no suitable mirror found for {}",
                    self.targets[index].target.path
                ),
            ))
        }
    }

    /// Whether another download attempt is allowed.
    ///
    /// Direct URLs starting with `file:/` cannot recover; other direct
    /// URL/base-url targets retry up to `allowed_mirror_failures` times;
    /// mirror-mode targets retry until `max_mirrors_to_try` is exhausted.
    fn can_retry_download(
        allowed_mirror_failures: i64,
        max_mirrors_to_try: i64,
        num_tried: i64,
        url: &str,
    ) -> bool {
        if !url.is_empty() {
            if url.starts_with("file:/") {
                return false;
            }
            return allowed_mirror_failures > num_tried;
        }
        max_mirrors_to_try <= 0 || num_tried < max_mirrors_to_try
    }

    /// Dispatch one finished transfer: mirror statistics, retry policy,
    /// zchunk continuation or finalization.
    fn handle_completion(
        &mut self,
        outcome: TransferOutcome,
        options: &DownloadOptions,
    ) -> DownloadResult<()> {
        let ctx = self.ctx;
        let allowed_mirror_failures = self.allowed_mirror_failures;
        let max_mirrors_to_try = self.max_mirrors_to_try;
        let targets = &mut self.targets;
        let arena = &mut self.mirrors;

        let index = outcome.index;
        let target = targets.get_mut(index).ok_or_else(|| {
            DownloadError::fatal(
                ErrorCode::Unknown,
                "could not find target associated with finished transfer",
            )
        })?;

        target.restore_io(outcome.outfile, outcome.zck_dl);
        target.response = outcome.response;
        let effective_url = target.response.effective_url.clone();
        tracing::debug!("download finished {:?}", effective_url);

        let was_preparation = target.state == DownloadState::Preparation;

        // Range de-escalation: the server ignored our Range header. Halve
        // the allowance and retry the same mirror with fewer ranges.
        if outcome.range_fail {
            target.range_fail = true;
            if let Some(id) = target.mirror.clone() {
                if let Some(mirror) = arena.get_mut(&id) {
                    let count = target.zck_range_count.max(1);
                    if mirror.stats.max_ranges >= count {
                        mirror.change_max_ranges(count / 2);
                        tracing::debug!(
                            "setting max_ranges of {} to {}",
                            mirror.url(),
                            mirror.stats.max_ranges
                        );
                    }
                    mirror.update_statistics(true);
                }
                target.tried_mirrors.remove(&id);
            }
            target.state = DownloadState::Waiting;
            return Ok(());
        }

        let mut result = outcome.result;
        if result.is_err() && outcome.required_range_written {
            // The transfer aborted because the requested byte range was
            // fully written: a success in disguise.
            tracing::debug!(
                "transfer interrupted: the required range ({} - {}) was downloaded",
                target.target.byterange_start,
                target.target.byterange_end
            );
            result = Ok(());
        }
        if let (Err(e), Some(reason)) = (&result, &outcome.header_interrupted) {
            tracing::debug!("{e}");
            result = Err(DownloadError::transient(
                ErrorCode::Transport,
                format!("interrupted by header check: {reason}"),
            ));
        }

        if was_preparation && result.is_ok() {
            // Capture the token / digest the preparation fetched.
            let apply = {
                let mirror = target
                    .mirror
                    .as_ref()
                    .and_then(|id| arena.get_mut(id))
                    .ok_or_else(|| {
                        DownloadError::fatal(ErrorCode::BadFuncArg, "preparation without a mirror")
                    })?;
                mirror.apply_preparation(&target.target.path, &target.response)
            };
            if let Err(e) = apply {
                result = Err(e);
            }
        }

        // Mirror bookkeeping happens exactly once per terminal transfer
        // outcome. Successful preparation round-trips are not transfers;
        // failed ones count against the mirror so endless handshake retries
        // are bounded.
        if !was_preparation || result.is_err() {
            if let Some(id) = target.mirror.clone() {
                target.tried_mirrors.insert(id.clone());
                let success = result.is_ok();
                let serious = result.as_ref().err().map_or(false, DownloadError::is_serious);
                if let Some(mirror) = arena.get_mut(&id) {
                    mirror.update_statistics(success);
                }
                if ctx.adaptive_mirror_sorting {
                    sort_mirrors(&mut target.mirrors, arena, &id, success, serious);
                }
            }
        }

        if let Err(error) = result {
            error.log();
            tracing::info!("error during transfer for {}", target.target.path);

            let direct_url = if let Some(url) = &target.target.complete_url {
                url.clone()
            } else {
                target.target.base_url.clone()
            };

            let mut retry = false;
            if !error.is_fatal() {
                // The mirror may be fine but accept fewer parallel
                // connections than we opened.
                if let Some(id) = target.mirror.clone() {
                    if let Some(mirror) = arena.get_mut(&id) {
                        if target.can_retry_transfer_with_fewer_connections(mirror) {
                            tracing::debug!(
                                "lowering maximum of allowed parallel connections for {}",
                                mirror.url()
                            );
                            target.lower_mirror_parallel_connections(mirror);
                        }
                    }
                }

                // Mirror mode counts distinct mirrors; direct URLs have no
                // alternatives, so their budget is the retry counter.
                let num_tried = if direct_url.is_empty() {
                    target.tried_mirrors.len() as i64
                } else {
                    i64::from(target.retries)
                };
                if Self::can_retry_download(
                    allowed_mirror_failures,
                    max_mirrors_to_try,
                    num_tried,
                    &direct_url,
                ) {
                    if direct_url.is_empty() {
                        tracing::info!("ignore error - try another mirror");
                    } else {
                        tracing::info!("ignore error - retry download");
                    }
                    target.set_retrying()?;
                    retry = true;
                }
            }

            if !retry {
                tracing::info!("no more retries (tried: {})", target.tried_mirrors.len());
                target.set_failed(error.clone(), ctx);
                if options.failfast && !options.allow_failure {
                    return Err(error);
                }
            }
            return Ok(());
        }

        if was_preparation {
            // Back to waiting for the main fetch.
            target.finalize_transfer(effective_url, ctx)?;
            return Ok(());
        }

        // Verify (size, hashes, zchunk substate) before finalizing.
        let mirror_ref = target.mirror.as_ref().and_then(|id| arena.get(id));
        if let Err(error) = target.finish_transfer(mirror_ref, ctx) {
            error.log();
            let direct_url = if let Some(url) = &target.target.complete_url {
                url.clone()
            } else {
                target.target.base_url.clone()
            };
            let num_tried = if direct_url.is_empty() {
                target.tried_mirrors.len() as i64
            } else {
                i64::from(target.retries)
            };
            if !error.is_fatal()
                && Self::can_retry_download(
                    allowed_mirror_failures,
                    max_mirrors_to_try,
                    num_tried,
                    &direct_url,
                )
            {
                target.set_retrying()?;
            } else {
                target.set_failed(error.clone(), ctx);
                if options.failfast && !options.allow_failure {
                    return Err(error);
                }
            }
            return Ok(());
        }

        target.finalize_transfer(effective_url, ctx)?;

        if target.state == DownloadState::Finished
            && target.target.is_zchunk
            && options.extract_zchunk_files
        {
            extract_zchunk(target);
        }
        Ok(())
    }
}

/// Extract a finished zchunk file next to its destination.
fn extract_zchunk(target: &mut Target) {
    let final_path = target.target.filename.clone();
    if final_path.extension().and_then(|e| e.to_str()) != Some("zck") {
        return;
    }
    let dest = final_path.with_extension("");

    let Some(zck) = target.target.zck.as_mut() else {
        return;
    };
    let Some(dl) = zck.dl.as_mut() else {
        return;
    };
    let mut slot = match crate::fileio::FileSlot::open(&final_path, crate::fileio::OpenMode::Read) {
        Ok(slot) => slot,
        Err(e) => {
            tracing::warn!("cannot open {} for extraction: {e}", final_path.display());
            return;
        }
    };
    if let Err(e) = dl.extract_to(&mut slot, &dest) {
        tracing::warn!("zchunk extraction failed for {}: {e}", final_path.display());
    } else {
        tracing::info!("extracted {} to {}", final_path.display(), dest.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumKind;
    use crate::context::ContextOptions;
    use crate::target::{CbReturnCode, TransferStatus};
    use crate::test_util::context_lock;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_ctx(dir: &tempfile::TempDir) -> Context {
        Context::new(ContextOptions {
            cache_dir: Some(dir.path().join("cache")),
            // keep mirror backoff clocks fast in tests
            retry_default_timeout_ms: 1,
            ..ContextOptions::default()
        })
        .unwrap()
    }

    /// Serve a fixed HTTP response for every incoming connection.
    async fn serve(response: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_can_retry_download() {
        // local paths cannot recover
        assert!(!Downloader::can_retry_download(3, -1, 0, "file:///tmp/x"));
        // direct URLs retry up to the failure allowance
        assert!(Downloader::can_retry_download(3, -1, 2, "https://a/x"));
        assert!(!Downloader::can_retry_download(3, -1, 3, "https://a/x"));
        // mirror mode with unlimited mirrors
        assert!(Downloader::can_retry_download(3, -1, 100, ""));
        // mirror mode with a cap
        assert!(Downloader::can_retry_download(3, 2, 1, ""));
        assert!(!Downloader::can_retry_download(3, 2, 2, ""));
    }

    #[tokio::test]
    async fn test_download_from_file_mirror() {
        let _guard = context_lock();
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("pkg.tar"), b"package content").unwrap();

        let mut ctx = test_ctx(&dir);
        ctx.add_mirrors(
            "local",
            vec![Mirror::http(format!("file://{}", repo.display()))],
        );

        let dest = dir.path().join("pkg.tar");
        let mut downloader = Downloader::new(&ctx).unwrap();
        downloader.add(DownloadTarget::new("pkg.tar", "local", &dest));
        downloader.download(DownloadOptions::default()).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"package content");
        assert!(!dir.path().join("pkg.tar.pdpart").exists());

        let target = &downloader.targets()[0];
        assert_eq!(target.state, DownloadState::Finished);
        assert_eq!(target.tried_mirrors.len(), 1);
        assert!(target.target.used_mirror.is_some());
        let mirror_id = target.target.used_mirror.clone().unwrap();
        assert_eq!(
            downloader.mirrors.get(&mirror_id).unwrap().stats.successful_transfers,
            1
        );
    }

    #[tokio::test]
    async fn test_download_happy_path_http() {
        let _guard = context_lock();
        let dir = tempdir().unwrap();
        let url = serve(
            "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
        )
        .await;

        let ctx = test_ctx(&dir);
        let dest = dir.path().join("hello.txt");
        let mut downloader = Downloader::new(&ctx).unwrap();
        downloader.add_with_mirrors(
            DownloadTarget::new("hello.txt", "", &dest)
                .with_expected_size(11)
                .with_checksum(
                    ChecksumKind::Sha256,
                    // sha256 of "hello world"
                    "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
                ),
            vec![Mirror::http(&url)],
        );
        downloader.download(DownloadOptions::default()).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert_eq!(downloader.targets()[0].state, DownloadState::Finished);
    }

    #[tokio::test]
    async fn test_content_length_mismatch_retries_and_fails() {
        let _guard = context_lock();
        let dir = tempdir().unwrap();
        let url = serve(
            "HTTP/1.1 200 OK\r\nContent-Length: 9999\r\nConnection: close\r\n\r\n",
        )
        .await;

        let ctx = test_ctx(&dir);
        let dest = dir.path().join("data.bin");
        let calls = Arc::new(AtomicU32::new(0));
        let calls_cb = Arc::clone(&calls);

        let mut downloader = Downloader::new(&ctx).unwrap();
        downloader.add_with_mirrors(
            DownloadTarget::new("data.bin", "", &dest)
                .with_expected_size(10_000)
                .with_end_callback(Box::new(move |status, _| {
                    assert_eq!(status, TransferStatus::Error);
                    calls_cb.fetch_add(1, AtomicOrdering::SeqCst);
                    CbReturnCode::Ok
                })),
            vec![Mirror::http(&url)],
        );
        downloader.download(DownloadOptions::default()).await.unwrap();

        let target = &downloader.targets()[0];
        assert_eq!(target.state, DownloadState::Failed);
        assert!(target.target.error.is_some());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert!(!dest.exists());
        assert!(!dir.path().join("data.bin.pdpart").exists());
    }

    #[tokio::test]
    async fn test_bad_status_fails_target() {
        let _guard = context_lock();
        let dir = tempdir().unwrap();
        let url = serve("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await;

        let ctx = test_ctx(&dir);
        let dest = dir.path().join("missing.bin");
        let mut downloader = Downloader::new(&ctx).unwrap();
        downloader.add_with_mirrors(
            DownloadTarget::new("missing.bin", "", &dest),
            vec![Mirror::http(&url)],
        );
        downloader.download(DownloadOptions::default()).await.unwrap();

        let target = &downloader.targets()[0];
        assert_eq!(target.state, DownloadState::Failed);
        // the mirror was exhausted by repeated bad statuses
        assert_eq!(target.target.error.as_ref().unwrap().code, ErrorCode::NoUrl);
        assert!(target.retries > 0);
    }

    #[tokio::test]
    async fn test_failfast_aborts_run() {
        let _guard = context_lock();
        let dir = tempdir().unwrap();

        let ctx = test_ctx(&dir);
        let dest = dir.path().join("gone.bin");
        let mut downloader = Downloader::new(&ctx).unwrap();
        // file:/ URLs never retry, so the first error is terminal
        downloader.add(DownloadTarget::new(
            "file:///definitely/not/here.bin",
            "",
            &dest,
        ));

        let result = downloader
            .download(DownloadOptions {
                failfast: true,
                allow_failure: false,
                ..DownloadOptions::default()
            })
            .await;
        assert!(result.is_err());
        assert_eq!(downloader.targets()[0].state, DownloadState::Failed);
    }

    #[tokio::test]
    async fn test_allow_failure_suppresses_failfast() {
        let _guard = context_lock();
        let dir = tempdir().unwrap();

        let ctx = test_ctx(&dir);
        let dest = dir.path().join("gone.bin");
        let mut downloader = Downloader::new(&ctx).unwrap();
        downloader.add(DownloadTarget::new(
            "file:///definitely/not/here.bin",
            "",
            &dest,
        ));

        downloader
            .download(DownloadOptions {
                failfast: true,
                allow_failure: true,
                ..DownloadOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(downloader.targets()[0].state, DownloadState::Failed);
    }

    #[tokio::test]
    async fn test_offline_rejects_remote_urls() {
        let _guard = context_lock();
        let dir = tempdir().unwrap();

        let mut ctx = test_ctx(&dir);
        ctx.offline = true;
        let dest = dir.path().join("pkg");
        let mut downloader = Downloader::new(&ctx).unwrap();
        downloader.add(DownloadTarget::new("https://example.com/pkg", "", &dest));
        downloader.download(DownloadOptions::default()).await.unwrap();

        let target = &downloader.targets()[0];
        assert_eq!(target.state, DownloadState::Failed);
        assert_eq!(target.target.error.as_ref().unwrap().code, ErrorCode::NotLocal);
    }

    #[tokio::test]
    async fn test_no_url_source_fails() {
        let _guard = context_lock();
        let dir = tempdir().unwrap();

        let ctx = test_ctx(&dir);
        let dest = dir.path().join("pkg");
        let mut downloader = Downloader::new(&ctx).unwrap();
        downloader.add(DownloadTarget::new("pkg", "", &dest));
        downloader.download(DownloadOptions::default()).await.unwrap();

        let target = &downloader.targets()[0];
        assert_eq!(target.state, DownloadState::Failed);
        assert_eq!(target.target.error.as_ref().unwrap().code, ErrorCode::NoUrl);
    }

    #[tokio::test]
    async fn test_bad_mirror_exhausts_and_fails() {
        let _guard = context_lock();
        let dir = tempdir().unwrap();
        let repo = dir.path().join("empty-repo");
        std::fs::create_dir_all(&repo).unwrap();

        let mut ctx = test_ctx(&dir);
        ctx.add_mirrors(
            "local",
            vec![Mirror::http(format!("file://{}", repo.display()))],
        );

        let dest = dir.path().join("pkg");
        let mut downloader = Downloader::new(&ctx).unwrap();
        downloader.add(DownloadTarget::new("pkg", "local", &dest));
        downloader.download(DownloadOptions::default()).await.unwrap();

        let target = &downloader.targets()[0];
        assert_eq!(target.state, DownloadState::Failed);
        assert!(!dir.path().join("pkg.pdpart").exists());
    }
}
