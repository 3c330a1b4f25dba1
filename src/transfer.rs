/*
 * fetchpool - Parallel mirror-aware artifact downloader.
 * Copyright (C) 2025  fetchpool contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Execution of a single HTTP operation.
//!
//! One [`TransferJob`] corresponds to one request handle: the response status
//! and headers run through a small inspection step (status acceptance,
//! Content-Length agreement), then the body streams through the job's sink --
//! plain writes, a byte-range window, or the zchunk handlers. The outcome
//! carries the moved-in file slot and zchunk handle back to the owning
//! target.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use futures::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::time::timeout;

use crate::downloader::zck::{ZckDownload, ZckState};
use crate::error::{DownloadError, DownloadResult, ErrorCode, ErrorLevel};
use crate::fileio::FileSlot;
use crate::target::{ProgressCallback, TransferResponse};

/// Windowed writer honoring `[range_start, range_end]` of the resource.
///
/// The server may deliver bytes the caller does not want (before the start of
/// the window, or after its end). The window keeps a cursor of received bytes
/// and cuts each buffer down to the intersection with the wanted range.
#[derive(Debug)]
pub struct RangeWindow {
    range_start: u64,
    /// Inclusive; 0 means "no end bound".
    range_end: u64,
    /// Offset the server already skipped (resume offset or byterange start).
    base_offset: u64,
    /// Bytes received so far, before windowing.
    received: u64,
    required_range_written: bool,
}

/// What to do with one incoming buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum WindowVerdict {
    /// The wanted range has not started yet.
    Skip,
    /// Write this sub-slice `[start, end)` of the buffer.
    Write(usize, usize),
    /// The wanted range is complete; abort the transfer successfully.
    Done,
}

impl RangeWindow {
    pub fn new(range_start: u64, range_end: u64, base_offset: u64) -> Self {
        Self {
            range_start,
            range_end,
            base_offset,
            received: 0,
            required_range_written: false,
        }
    }

    pub fn required_range_written(&self) -> bool {
        self.required_range_written
    }

    pub fn process(&mut self, len: usize) -> WindowVerdict {
        let all = len as u64;
        let cur_start = self.received + self.base_offset;
        let cur_end = cur_start + all;
        self.received += all;

        if cur_end < self.range_start {
            return WindowVerdict::Skip;
        }
        if self.range_end != 0 && cur_start > self.range_end {
            self.required_range_written = true;
            return WindowVerdict::Done;
        }

        let start_off = self.range_start.saturating_sub(cur_start) as usize;
        let mut keep = len - start_off;
        if self.range_end != 0 && cur_end > self.range_end {
            let overshoot = (cur_end - self.range_end) as usize;
            if overshoot > keep {
                self.required_range_written = true;
                return WindowVerdict::Done;
            }
            keep -= overshoot - 1;
        }
        WindowVerdict::Write(start_off, start_off + keep)
    }
}

/// Optional per-transfer download speed cap.
pub(crate) struct SpeedLimiter {
    limiter: Option<DefaultDirectRateLimiter>,
    burst: u32,
}

impl SpeedLimiter {
    pub fn new(limit_bytes_per_sec: i64) -> Self {
        let burst = limit_bytes_per_sec.clamp(0, i64::from(u32::MAX)) as u32;
        let limiter = NonZeroU32::new(burst).map(|n| RateLimiter::direct(Quota::per_second(n)));
        Self { limiter, burst }
    }

    pub async fn throttle(&self, len: usize) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        let mut remaining = len;
        while remaining > 0 {
            let step = remaining.min(self.burst as usize);
            if let Some(n) = NonZeroU32::new(step as u32) {
                let _ = limiter.until_n_ready(n).await;
            }
            remaining -= step;
        }
    }
}

/// Where the body bytes of a transfer go.
pub enum TransferSink {
    /// Write everything (optionally filtered by a range window).
    Plain { window: Option<RangeWindow> },
    /// Dispatch by zchunk substate: lead bytes to the file, header bytes to
    /// the header handler, everything else to the chunk handler.
    Zck { state: ZckState },
    /// Preparation round-trip: capture the body for the mirror to parse.
    Capture,
}

/// One configured request, owning everything the transfer needs.
pub struct TransferJob {
    /// Index of the owning target in the scheduler's table.
    pub index: usize,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,

    /// Ask the server to skip this many bytes (resume / byterange start).
    pub resume_from: Option<u64>,
    /// Raw range spec for the `Range` header (without the `bytes=` prefix).
    pub range: Option<String>,
    /// Number of ranges in `range`, for range de-escalation bookkeeping.
    pub range_count: u32,

    /// Abort with the recorded reason when Content-Length disagrees.
    pub expected_size: u64,

    pub sink: TransferSink,
    pub outfile: Option<FileSlot>,
    pub zck_dl: Option<Box<dyn ZckDownload>>,

    pub progress: Option<ProgressCallback>,
    pub progress_total: u64,
    pub progress_offset: u64,

    pub stall_timeout: Duration,
    pub max_speed_limit: i64,
    /// Read granularity for transfers the client does not chunk itself.
    pub buffersize: usize,
}

/// Everything the scheduler needs to dispatch a finished transfer.
pub struct TransferOutcome {
    pub index: usize,
    pub result: DownloadResult<()>,
    pub response: TransferResponse,
    /// Moved back from the job.
    pub outfile: Option<FileSlot>,
    pub zck_dl: Option<Box<dyn ZckDownload>>,
    /// The requested byte range was fully written; the early abort is a
    /// success, not an error.
    pub required_range_written: bool,
    /// Content-Length disagreed with the expected size (recorded reason).
    pub header_interrupted: Option<String>,
    /// The server answered a ranged request with a full 200.
    pub range_fail: bool,
}

struct TransferState {
    job: TransferJob,
    response: TransferResponse,
    header_interrupted: Option<String>,
    range_fail: bool,
    received: u64,
}

impl TransferState {
    fn into_outcome(mut self, result: DownloadResult<()>) -> TransferOutcome {
        if let Some(file) = self.job.outfile.as_mut() {
            if let Err(e) = file.flush() {
                tracing::error!("could not flush output file: {e}");
            }
        }
        self.response.downloaded_size = self.received;
        let required_range_written = match &self.job.sink {
            TransferSink::Plain { window: Some(w) } => w.required_range_written(),
            _ => false,
        };
        TransferOutcome {
            index: self.job.index,
            result,
            response: self.response,
            outfile: self.job.outfile,
            zck_dl: self.job.zck_dl,
            required_range_written,
            header_interrupted: self.header_interrupted,
            range_fail: self.range_fail,
        }
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> DownloadResult<bool> {
        match &mut self.job.sink {
            TransferSink::Capture => {
                self.response
                    .body
                    .get_or_insert_with(Vec::new)
                    .extend_from_slice(chunk);
                Ok(true)
            }
            TransferSink::Plain { window } => {
                let file = self.job.outfile.as_mut().ok_or_else(|| {
                    DownloadError::fatal(ErrorCode::BadFuncArg, "transfer has no open output file")
                })?;
                match window {
                    None => {
                        file.write_all(chunk)?;
                        Ok(true)
                    }
                    Some(window) => match window.process(chunk.len()) {
                        WindowVerdict::Skip => Ok(true),
                        WindowVerdict::Done => Ok(false),
                        WindowVerdict::Write(start, end) => {
                            file.write_all(&chunk[start..end])?;
                            Ok(true)
                        }
                    },
                }
            }
            TransferSink::Zck { state } => {
                let file = self.job.outfile.as_mut().ok_or_else(|| {
                    DownloadError::fatal(ErrorCode::BadFuncArg, "transfer has no open output file")
                })?;
                match state {
                    ZckState::HeaderLead => {
                        file.write_all(chunk)?;
                    }
                    ZckState::Header => {
                        let dl = self.job.zck_dl.as_mut().ok_or_else(|| {
                            DownloadError::fatal(
                                ErrorCode::BadFuncArg,
                                "zchunk transfer has no download context",
                            )
                        })?;
                        dl.write_header(chunk, file)?;
                    }
                    _ => {
                        let dl = self.job.zck_dl.as_mut().ok_or_else(|| {
                            DownloadError::fatal(
                                ErrorCode::BadFuncArg,
                                "zchunk transfer has no download context",
                            )
                        })?;
                        dl.write_body(chunk, file)?;
                    }
                }
                Ok(true)
            }
        }
    }

    fn report_progress(&self) {
        if let Some(cb) = &self.job.progress {
            cb(self.job.progress_total, self.job.progress_offset + self.received);
        }
    }
}

/// Run one transfer to completion.
///
/// Never panics and never returns early without handing the file slot and
/// zchunk handle back through the outcome.
pub async fn run_transfer(client: reqwest::Client, job: TransferJob) -> TransferOutcome {
    let mut state = TransferState {
        job,
        response: TransferResponse::default(),
        header_interrupted: None,
        range_fail: false,
        received: 0,
    };

    if let Some(local) = local_path(&state.job.url) {
        let result = run_local_transfer(&mut state, local).await;
        return state.into_outcome(result);
    }

    let started = Instant::now();

    let mut request = client.get(&state.job.url);
    for (key, value) in &state.job.headers {
        request = request.header(key, value);
    }
    if let Some((user, password)) = &state.job.basic_auth {
        request = request.basic_auth(user, Some(password));
    }
    let ranged = state.job.range.is_some();
    if let Some(offset) = state.job.resume_from {
        request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
    } else if let Some(range) = &state.job.range {
        request = request.header(reqwest::header::RANGE, format!("bytes={range}"));
    }

    let sent = timeout(state.job.stall_timeout, request.send()).await;
    let response = match sent {
        Err(_) => {
            let err = DownloadError::serious(
                ErrorCode::Temporary,
                format!("operation timed out for {}", state.job.url),
            );
            return state.into_outcome(Err(err));
        }
        Ok(Err(e)) => {
            let err = DownloadError::from_transport(&e);
            return state.into_outcome(Err(err));
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status().as_u16();
    state.response.status = Some(status);
    state.response.effective_url = Some(response.url().to_string());
    for (key, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            state
                .response
                .headers
                .insert(key.as_str().to_lowercase(), value.to_string());
        }
    }
    state.response.filetime = parse_filetime(&state.response);

    // A 200 on a ranged zchunk request means the server ignored our Range
    // header; abort so the scheduler can de-escalate max_ranges.
    if ranged && status == 200 && matches!(state.job.sink, TransferSink::Zck { .. }) {
        state.range_fail = true;
        let err = DownloadError::transient(
            ErrorCode::Transport,
            format!("server ignored range request for {}", state.job.url),
        );
        return state.into_outcome(Err(err));
    }

    if status / 100 != 2 {
        let err = DownloadError::from_status(status, &state.job.url);
        return state.into_outcome(Err(err));
    }

    if state.job.expected_size > 0 {
        if let Some(content_length) = state
            .response
            .header("content-length")
            .and_then(|v| v.parse::<u64>().ok())
        {
            if content_length > 0 && content_length != state.job.expected_size {
                let reason = format!(
                    "server reports content-length: {} but expected size is: {}",
                    content_length, state.job.expected_size
                );
                state.header_interrupted = Some(reason.clone());
                let err = DownloadError::transient(ErrorCode::Transport, reason);
                return state.into_outcome(Err(err));
            }
        }
    }

    let limiter = SpeedLimiter::new(state.job.max_speed_limit);
    let mut stream = response.bytes_stream();
    loop {
        let next = timeout(state.job.stall_timeout, stream.next()).await;
        match next {
            Err(_) => {
                let err = DownloadError::serious(
                    ErrorCode::Temporary,
                    format!("download stalled for {}", state.job.url),
                );
                return state.into_outcome(Err(err));
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                let err = DownloadError::from_transport(&e);
                return state.into_outcome(Err(err));
            }
            Ok(Some(Ok(chunk))) => {
                limiter.throttle(chunk.len()).await;
                state.received += chunk.len() as u64;
                match state.write_chunk(&chunk) {
                    Err(e) => return state.into_outcome(Err(e)),
                    // The wanted range is complete; stop reading.
                    Ok(false) => break,
                    Ok(true) => {}
                }
                state.report_progress();
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        state.response.average_speed = state.received as f64 / elapsed;
    }

    state.into_outcome(Ok(()))
}

/// Serve a `file://` URL through the same sink machinery.
async fn run_local_transfer(state: &mut TransferState, path: PathBuf) -> DownloadResult<()> {
    let data = tokio::fs::read(&path).await.map_err(|e| {
        DownloadError::new(
            ErrorLevel::Serious,
            ErrorCode::File,
            format!("cannot read local file {}: {e}", path.display()),
        )
    })?;

    let skip = state.job.resume_from.unwrap_or(0) as usize;
    let data = data.get(skip..).unwrap_or_default();

    for chunk in data.chunks(state.job.buffersize.max(1)) {
        state.received += chunk.len() as u64;
        if !state.write_chunk(chunk)? {
            break;
        }
        state.report_progress();
    }
    state.response.effective_url = Some(state.job.url.clone());
    Ok(())
}

fn local_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("file://")?;
    Some(PathBuf::from(rest))
}

fn parse_filetime(response: &TransferResponse) -> Option<SystemTime> {
    let raw = response.header("last-modified")?;
    let parsed = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    Some(SystemTime::from(parsed))
}
